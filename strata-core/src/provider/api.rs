//! Provider API traits and wire types.
//!
//! The remote change-set API is abstracted behind two narrow traits:
//! [`ProviderApi`] for the stack/change-set operations and [`ObjectStore`]
//! for the artifact store. Wire types mirror the provider's JSON shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for raw provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Classified provider error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The kind of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// The request was rejected as invalid.
    Validation,
    /// The provider is rate limiting the caller.
    Throttled,
    /// A transient transport failure; retrying may succeed.
    Transient,
    /// Any other, non-retryable failure.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Validation => "validation error",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Transient => "transient error",
            ErrorKind::Fatal => "provider error",
        };
        f.write_str(s)
    }
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_throttled(&self) -> bool {
        self.kind == ErrorKind::Throttled
    }
}

/// A stack as described by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteStack {
    pub stack_id: String,
    pub stack_name: String,
    pub description: String,
    #[serde(rename = "RoleARN")]
    pub role_arn: String,
    pub stack_status: String,
    pub stack_status_reason: String,
    pub capabilities: Vec<String>,
    pub parameters: Vec<RemoteParameter>,
    pub tags: Vec<RemoteTag>,
    pub outputs: Vec<RemoteOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteParameter {
    pub parameter_key: String,
    pub parameter_value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteTag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteOutput {
    pub output_key: String,
    pub output_value: String,
}

/// A stack event as described by the provider. Newest events come first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteStackEvent {
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

/// One page of stack events.
#[derive(Debug, Clone, Default)]
pub struct StackEventPage {
    pub events: Vec<RemoteStackEvent>,
    pub next_token: Option<String>,
}

/// One page of a change-set description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteChangeSet {
    pub change_set_id: String,
    pub change_set_name: String,
    pub stack_id: String,
    pub stack_name: String,
    pub status: String,
    pub status_reason: String,
    pub execution_status: String,
    pub capabilities: Vec<String>,
    pub parameters: Vec<RemoteParameter>,
    pub tags: Vec<RemoteTag>,
    pub changes: Vec<RemoteChange>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteChange {
    #[serde(rename = "Type")]
    pub change_type: String,
    pub resource_change: RemoteResourceChange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteResourceChange {
    pub action: String,
    pub logical_resource_id: String,
    pub physical_resource_id: String,
    pub resource_type: String,
    pub replacement: String,
    pub details: Vec<RemoteChangeDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteChangeDetail {
    pub target: RemoteChangeTarget,
    pub evaluation: String,
    pub change_source: String,
    pub causing_entity: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RemoteChangeTarget {
    pub attribute: String,
    pub name: String,
    pub requires_recreation: String,
}

/// Input for creating a change set.
#[derive(Debug, Clone, Default)]
pub struct CreateChangeSetInput {
    /// Stack id when known, stack name otherwise.
    pub stack_name: String,
    pub change_set_name: String,
    /// `CREATE` for new stacks, `UPDATE` otherwise.
    pub change_set_type: String,
    pub role_arn: Option<String>,
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub parameters: Vec<RemoteParameter>,
    pub tags: Vec<RemoteTag>,
    pub template_url: Option<String>,
    pub template_body: Option<String>,
    pub use_previous_template: bool,
}

/// Addressing for an existing change set: either its id, or its name
/// together with the owning stack's name.
#[derive(Debug, Clone)]
pub enum ChangeSetRef {
    Id(String),
    Named { name: String, stack_name: String },
}

/// The authenticated caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    #[serde(skip)]
    pub region: String,
}

/// The remote change-set API. One method per remote operation; pagination
/// tokens are exposed here and hidden again by the client facade.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Describe a stack. Returns `None` when the stack does not exist.
    async fn describe_stack(&self, name: &str) -> ProviderResult<Option<RemoteStack>>;

    /// Fetch one page of stack events, newest first.
    async fn describe_stack_events(
        &self,
        name: &str,
        next_token: Option<&str>,
    ) -> ProviderResult<StackEventPage>;

    /// Create a change set and return its id.
    async fn create_change_set(&self, input: &CreateChangeSetInput) -> ProviderResult<String>;

    /// Fetch one page of a change-set description. Returns `None` when the
    /// change set does not exist.
    async fn describe_change_set(
        &self,
        change_set: &ChangeSetRef,
        next_token: Option<&str>,
    ) -> ProviderResult<Option<RemoteChangeSet>>;

    /// Start executing a change set. Does not wait for completion.
    async fn execute_change_set(&self, change_set: &ChangeSetRef) -> ProviderResult<()>;

    /// Start deleting a stack. Does not wait for completion.
    async fn delete_stack(&self, name: &str) -> ProviderResult<()>;

    /// Identify the authenticated caller.
    async fn caller_identity(&self) -> ProviderResult<CallerIdentity>;
}

/// Metadata of a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Content hash as reported by the store (md5 hex, possibly quoted).
    pub etag: String,
    pub version_id: Option<String>,
    pub content_type: String,
}

/// The artifact store. Raw operations only; content-addressing lives in
/// [`crate::artifact`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> ProviderResult<ObjectMeta>;

    /// Returns `None` when the object does not exist.
    async fn head(&self, bucket: &str, key: &str) -> ProviderResult<Option<ObjectMeta>>;

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> ProviderResult<(Vec<u8>, ObjectMeta)>;
}
