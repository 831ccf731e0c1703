//! Monotonic event tail for one stack.
//!
//! Tracks the last seen event id and delivers only events that arrived after
//! it, in chronological order. The catalog present at construction time is
//! never delivered.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{finish_wait, WaitCallback, WaitConfig, POLL_INTERVAL};
use crate::closer::Closer;
use crate::error::Result;
use crate::provider::{ProviderClient, RemoteStackEvent};

/// Resource type of a nested stack.
pub const STACK_RESOURCE_TYPE: &str = "AWS::CloudFormation::Stack";

/// A single resource event on a stack.
#[derive(Debug, Clone, Default)]
pub struct StackEventData {
    pub event_id: String,
    pub stack_id: String,
    pub stack_name: String,
    pub logical_resource_id: String,
    pub physical_resource_id: String,
    pub resource_type: String,
    pub resource_status: String,
    pub resource_status_reason: String,
    pub resource_properties: String,
}

impl StackEventData {
    /// Whether the resource in this event reached a completed state.
    pub fn is_complete(&self) -> bool {
        self.resource_status.ends_with("_COMPLETE")
    }
}

impl From<RemoteStackEvent> for StackEventData {
    fn from(e: RemoteStackEvent) -> Self {
        Self {
            event_id: e.event_id,
            stack_id: e.stack_id,
            stack_name: e.stack_name,
            logical_resource_id: e.logical_resource_id,
            physical_resource_id: e.physical_resource_id,
            resource_type: e.resource_type,
            resource_status: e.resource_status,
            resource_status_reason: e.resource_status_reason,
            resource_properties: e.resource_properties,
        }
    }
}

/// Event stream for a single stack.
///
/// Construction reads the current events and remembers the newest id as the
/// high-water mark; only strictly newer events are surfaced by [`wait`].
///
/// [`wait`]: StackEvents::wait
pub struct StackEvents {
    name: String,
    client: ProviderClient,
    last: Mutex<String>,
}

impl StackEvents {
    pub async fn new(client: ProviderClient, name: impl Into<String>) -> Result<Arc<Self>> {
        let stream =
            Arc::new(Self { name: name.into(), client, last: Mutex::new(String::new()) });
        let events = stream.chronological_events().await?;
        if let Some(latest) = events.last() {
            *stream.last.lock().unwrap() = latest.event_id.clone();
        }
        Ok(stream)
    }

    /// All events for the stack in chronological order.
    async fn chronological_events(&self) -> Result<Vec<RemoteStackEvent>> {
        let mut events = self.client.stack_events(&self.name).await?;
        events.reverse();
        Ok(events)
    }

    async fn update(
        &self,
        callback: &mut WaitCallback<StackEventData>,
        closer: &Closer,
    ) -> Result<()> {
        debug!(stack = %self.name, "starting stack events update");
        'outer: loop {
            let events = self.chronological_events().await?;
            let mut found = self.last.lock().unwrap().is_empty();
            for event in events {
                if found {
                    let data = StackEventData::from(event);
                    let event_id = data.event_id.clone();
                    if !callback(&data)? {
                        break 'outer;
                    }
                    *self.last.lock().unwrap() = event_id;
                } else if *self.last.lock().unwrap() == event.event_id {
                    found = true;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = closer.closed() => return Ok(()),
            }
        }
        Ok(())
    }

    /// Poll for new events every two seconds, delivering each one in order
    /// to the callback, until the callback stops the loop, fails, or the
    /// closer fires.
    pub fn wait(self: Arc<Self>, mut config: WaitConfig<StackEventData>) {
        tokio::spawn(async move {
            let result = self.update(&mut config.callback, &config.closer).await;
            finish_wait(result, &config.closer, config.close_on_end, config.close_on_error);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::provider::ProviderClient;

    fn event(id: &str, stack: &str) -> RemoteStackEvent {
        RemoteStackEvent {
            event_id: id.to_string(),
            stack_name: stack.to_string(),
            resource_status: "CREATE_IN_PROGRESS".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_events_are_not_delivered() {
        let provider = Arc::new(MockProvider::new());
        // Newest first, like the provider returns them.
        provider.push_events(vec![event("ev-2", "app"), event("ev-1", "app")]);

        let client = ProviderClient::new(provider.clone());
        let stream = StackEvents::new(client, "app").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let closer = Closer::new();
        let seen2 = seen.clone();
        stream.wait(WaitConfig {
            callback: Box::new(move |e| {
                seen2.lock().unwrap().push(e.event_id.clone());
                // Stop once the new event arrives.
                Ok(e.event_id != "ev-3")
            }),
            closer: closer.clone(),
            close_on_end: true,
            close_on_error: true,
        });

        provider.push_events(vec![event("ev-3", "app")]);
        closer.wait().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["ev-3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_delivered_in_order_across_pages() {
        let provider = Arc::new(MockProvider::new());
        provider.set_page_size(2);
        provider.push_events(vec![event("ev-0", "app")]);

        let client = ProviderClient::new(provider.clone());
        let stream = StackEvents::new(client, "app").await.unwrap();

        // Five new events, newest first in the listing.
        provider.push_events(vec![
            event("ev-5", "app"),
            event("ev-4", "app"),
            event("ev-3", "app"),
            event("ev-2", "app"),
            event("ev-1", "app"),
        ]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let closer = Closer::new();
        let seen2 = seen.clone();
        stream.wait(WaitConfig {
            callback: Box::new(move |e| {
                seen2.lock().unwrap().push(e.event_id.clone());
                Ok(e.event_id != "ev-5")
            }),
            closer: closer.clone(),
            close_on_end: true,
            close_on_error: true,
        });

        closer.wait().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ev-1", "ev-2", "ev-3", "ev-4", "ev-5"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_redelivery_after_high_water_mark_advances() {
        let provider = Arc::new(MockProvider::new());
        let client = ProviderClient::new(provider.clone());
        let stream = StackEvents::new(client, "app").await.unwrap();

        provider.push_events(vec![event("ev-1", "app")]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let closer = Closer::new();
        let seen2 = seen.clone();
        let provider2 = provider.clone();
        stream.wait(WaitConfig {
            callback: Box::new(move |e| {
                seen2.lock().unwrap().push(e.event_id.clone());
                if e.event_id == "ev-1" {
                    provider2.push_events(vec![event("ev-2", "app")]);
                    return Ok(true);
                }
                Ok(e.event_id != "ev-2")
            }),
            closer: closer.clone(),
            close_on_end: true,
            close_on_error: true,
        });

        closer.wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["ev-1".to_string(), "ev-2".to_string()]);
    }
}
