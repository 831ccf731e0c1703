//! Stack snapshot and controller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use super::{finish_wait, WaitCallback, WaitConfig, POLL_INTERVAL};
use crate::closer::Closer;
use crate::error::Result;
use crate::provider::{ProviderClient, RemoteStack};

/// Status of a stack that does not exist.
pub const STACK_STATUS_NOT_FOUND: &str = "STACK_NOT_FOUND";

const STACK_STATUS_REVIEW_IN_PROGRESS: &str = "REVIEW_IN_PROGRESS";

/// A point-in-time snapshot of one remote stack.
///
/// `name` is always set; every other field is empty when the stack does not
/// exist (`status` is then [`STACK_STATUS_NOT_FOUND`]).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackData {
    /// Resource id of the stack; empty when the stack does not exist.
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "RoleARN")]
    pub role_arn: String,
    pub capabilities: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,

    // Used for updates only.
    #[serde(rename = "TemplateURL")]
    pub template_url: String,
    pub template_body: String,

    // Set only after reading the stack.
    pub status: String,
    pub status_reason: String,
    pub outputs: BTreeMap<String, String>,
}

impl StackData {
    /// Build a snapshot from the provider's description. An absent stack
    /// maps to the not-found sentinel with only `name` set.
    pub fn from_remote(name: &str, remote: Option<RemoteStack>) -> Self {
        let Some(remote) = remote else {
            return Self {
                name: name.to_string(),
                status: STACK_STATUS_NOT_FOUND.to_string(),
                ..Default::default()
            };
        };
        Self {
            id: remote.stack_id,
            name: remote.stack_name,
            description: remote.description,
            role_arn: remote.role_arn,
            capabilities: remote.capabilities,
            parameters: remote
                .parameters
                .into_iter()
                .map(|p| (p.parameter_key, p.parameter_value))
                .collect(),
            tags: remote.tags.into_iter().map(|t| (t.key, t.value)).collect(),
            template_url: String::new(),
            template_body: String::new(),
            status: remote.stack_status,
            status_reason: remote.stack_status_reason,
            outputs: remote
                .outputs
                .into_iter()
                .map(|o| (o.output_key, o.output_value))
                .collect(),
        }
    }

    /// Whether the stack is currently being updated.
    pub fn is_in_progress(&self) -> bool {
        self.status.ends_with("_IN_PROGRESS")
    }

    /// Whether the stack is in review, i.e. first created through a change
    /// set that has not been executed yet.
    pub fn is_review_in_progress(&self) -> bool {
        self.status == STACK_STATUS_REVIEW_IN_PROGRESS
    }

    /// Whether the stack completed its last operation.
    pub fn is_complete(&self) -> bool {
        self.status.ends_with("_COMPLETE")
    }

    /// Whether the stack failed its last operation.
    pub fn is_failed(&self) -> bool {
        self.status.ends_with("_FAILED")
    }

    /// Whether the stack is in any rollback state.
    pub fn is_rollback(&self) -> bool {
        self.status.contains("_ROLLBACK_")
    }

    /// Whether the stack exists.
    pub fn exists(&self) -> bool {
        self.status != STACK_STATUS_NOT_FOUND
    }
}

/// Controller for a single remote stack.
///
/// Construction performs one describe and caches the snapshot; [`wait`]
/// launches a background poller that keeps it fresh.
///
/// [`wait`]: StackController::wait
pub struct StackController {
    pub name: String,
    client: ProviderClient,
    data: Mutex<StackData>,
}

impl StackController {
    pub async fn new(client: ProviderClient, name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let controller = Arc::new(Self {
            data: Mutex::new(StackData {
                name: name.clone(),
                status: STACK_STATUS_NOT_FOUND.to_string(),
                ..Default::default()
            }),
            name,
            client,
        });
        controller.refresh().await?;
        Ok(controller)
    }

    /// The latest cached snapshot.
    pub fn data(&self) -> StackData {
        self.data.lock().unwrap().clone()
    }

    async fn refresh(&self) -> Result<StackData> {
        let remote = self.client.describe_stack(&self.name).await?;
        let data = StackData::from_remote(&self.name, remote);
        *self.data.lock().unwrap() = data.clone();
        Ok(data)
    }

    async fn update(&self, callback: &mut WaitCallback<StackData>, closer: &Closer) -> Result<()> {
        loop {
            let data = self.refresh().await?;
            if !callback(&data)? {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = closer.closed() => return Ok(()),
            }
        }
        Ok(())
    }

    /// Poll the stack every two seconds, invoking the callback with each
    /// fresh snapshot, until the callback stops the loop, fails, or the
    /// closer fires.
    pub fn wait(self: Arc<Self>, mut config: WaitConfig<StackData>) {
        tokio::spawn(async move {
            let result = self.update(&mut config.callback, &config.closer).await;
            finish_wait(result, &config.closer, config.close_on_end, config.close_on_error);
        });
    }

    /// Start deleting the stack. Does not wait.
    pub async fn destroy(&self) -> Result<()> {
        debug!(stack = %self.name, "deleting stack");
        self.client.delete_stack(&self.name).await?;
        Ok(())
    }
}
