//! Provider client: a thin typed facade over the remote change-set API.
//!
//! [`ProviderClient`] wraps a [`ProviderApi`] implementation and adds the
//! behavior callers rely on: transparent retry when reads are throttled and
//! full pagination for event and change-detail listings. Pagination tokens
//! never leak out of this module.

pub mod api;
pub mod aws;
#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

pub use api::{
    CallerIdentity, ChangeSetRef, CreateChangeSetInput, ErrorKind, ObjectMeta, ObjectStore,
    ProviderApi, ProviderError, ProviderResult, RemoteChange, RemoteChangeDetail,
    RemoteChangeSet, RemoteChangeTarget, RemoteOutput, RemoteParameter, RemoteResourceChange,
    RemoteStack, RemoteStackEvent, RemoteTag, StackEventPage,
};
pub use aws::AwsCli;

/// Maximum retries for throttled read operations.
const RETRY_ATTEMPTS: u32 = 5;

/// Base delay for the exponential retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Retry `call` while it fails with a throttling error, backing off
/// exponentially up to [`RETRY_ATTEMPTS`] retries.
async fn retry_throttled<T, Fut>(mut call: impl FnMut() -> Fut) -> ProviderResult<T>
where
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(err) if err.is_throttled() && attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY * (1 << attempt);
                debug!(attempt, ?delay, "throttled by provider, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Shared, cloneable facade over the provider API.
#[derive(Clone)]
pub struct ProviderClient {
    api: Arc<dyn ProviderApi>,
}

impl ProviderClient {
    pub fn new(api: Arc<dyn ProviderApi>) -> Self {
        Self { api }
    }

    /// Describe a stack, retrying on throttling. `None` means the stack
    /// does not exist.
    pub async fn describe_stack(&self, name: &str) -> ProviderResult<Option<RemoteStack>> {
        retry_throttled(|| self.api.describe_stack(name)).await
    }

    /// Fetch all events for a stack, newest first, retrying each page on
    /// throttling and following pagination to completion.
    pub async fn stack_events(&self, name: &str) -> ProviderResult<Vec<RemoteStackEvent>> {
        let mut events = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = retry_throttled(|| {
                self.api.describe_stack_events(name, token.as_deref())
            })
            .await?;
            events.extend(page.events);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(events)
    }

    pub async fn create_change_set(&self, input: &CreateChangeSetInput) -> ProviderResult<String> {
        self.api.create_change_set(input).await
    }

    /// Describe a change set, accumulating change details across all pages
    /// into a single snapshot. `None` means the change set does not exist.
    pub async fn describe_change_set(
        &self,
        change_set: &ChangeSetRef,
    ) -> ProviderResult<Option<RemoteChangeSet>> {
        let mut token: Option<String> = None;
        let mut acc: Option<RemoteChangeSet> = None;
        loop {
            let page = retry_throttled(|| {
                self.api.describe_change_set(change_set, token.as_deref())
            })
            .await?;
            let Some(mut page) = page else {
                return Ok(None);
            };
            let next = page.next_token.take();
            match &mut acc {
                Some(acc) => acc.changes.append(&mut page.changes),
                None => acc = Some(page),
            }
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(acc)
    }

    pub async fn execute_change_set(&self, change_set: &ChangeSetRef) -> ProviderResult<()> {
        self.api.execute_change_set(change_set).await
    }

    pub async fn delete_stack(&self, name: &str) -> ProviderResult<()> {
        self.api.delete_stack(name).await
    }

    pub async fn caller_identity(&self) -> ProviderResult<CallerIdentity> {
        self.api.caller_identity().await
    }
}
