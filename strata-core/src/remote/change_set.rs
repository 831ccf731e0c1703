//! Change-set snapshot and controller.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use super::stack::StackData;
use super::{finish_wait, WaitCallback, WaitConfig, POLL_INTERVAL};
use crate::closer::Closer;
use crate::error::{Error, Result};
use crate::provider::{
    ChangeSetRef, CreateChangeSetInput, ProviderClient, RemoteChangeSet, RemoteParameter,
    RemoteTag,
};

/// Status of a change set that does not exist.
pub const CHANGE_SET_STATUS_NOT_FOUND: &str = "CHANGE_SET_NOT_FOUND";

const STATUS_CREATE_PENDING: &str = "CREATE_PENDING";
const STATUS_CREATE_IN_PROGRESS: &str = "CREATE_IN_PROGRESS";
const STATUS_CREATE_COMPLETE: &str = "CREATE_COMPLETE";
const STATUS_FAILED: &str = "FAILED";
const EXECUTION_STATUS_AVAILABLE: &str = "AVAILABLE";

const CHANGE_SET_TYPE_CREATE: &str = "CREATE";
const CHANGE_SET_TYPE_UPDATE: &str = "UPDATE";

/// The provider's exact wording for a change set that failed only because
/// nothing changed. Such a change set is reported as a no-op success.
pub const NO_CHANGES_STATUS_REASON: &str = "The submitted information didn't contain changes. \
     Submit different information to create a change set.";

/// A point-in-time snapshot of one change set, with all change details
/// accumulated.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeSetData {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub status: String,
    pub status_reason: String,
    pub execution_status: String,
    pub stack_data: StackData,

    /// Whether executing this change set creates the stack.
    pub is_new: bool,
    pub changes: Vec<ResourceChange>,
}

/// A planned change to one resource.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceChange {
    /// One of `Add`, `Modify`, `Remove`.
    pub action: String,
    pub logical_resource_id: String,
    pub physical_resource_id: String,
    pub resource_type: String,
    /// One of `True`, `False`, `Conditional`, or empty.
    pub replacement: String,
    pub details: Vec<ChangeDetail>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeDetail {
    pub change_source: String,
    pub causing_entity: String,
    pub evaluation: String,
    pub target: ChangeTarget,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeTarget {
    pub attribute: String,
    pub name: String,
    pub requires_recreation: String,
}

impl ChangeSetData {
    /// Whether the change set is still being created.
    pub fn is_in_progress(&self) -> bool {
        self.status == STATUS_CREATE_PENDING || self.status == STATUS_CREATE_IN_PROGRESS
    }

    /// Whether the change set finished creating.
    pub fn is_complete(&self) -> bool {
        self.status == STATUS_CREATE_COMPLETE
    }

    /// Whether the change set failed. A failure whose reason is the
    /// provider's "no changes" phrase counts as a no-op success, not a
    /// failure.
    pub fn is_failed(&self) -> bool {
        if self.status == STATUS_FAILED && self.status_reason == NO_CHANGES_STATUS_REASON {
            return false;
        }
        self.status == STATUS_FAILED
    }

    /// Whether the change set exists.
    pub fn exists(&self) -> bool {
        self.status != CHANGE_SET_STATUS_NOT_FOUND
    }

    /// Whether the change set can be executed.
    pub fn is_executable(&self) -> bool {
        self.execution_status == EXECUTION_STATUS_AVAILABLE
    }
}

fn stack_data_from_page(page: &RemoteChangeSet) -> StackData {
    StackData {
        id: page.stack_id.clone(),
        name: page.stack_name.clone(),
        capabilities: page.capabilities.clone(),
        parameters: page
            .parameters
            .iter()
            .map(|p| (p.parameter_key.clone(), p.parameter_value.clone()))
            .collect(),
        tags: page.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
        ..Default::default()
    }
}

fn data_from_page(page: &RemoteChangeSet, is_new: bool) -> ChangeSetData {
    ChangeSetData {
        id: page.change_set_id.clone(),
        name: page.change_set_name.clone(),
        status: page.status.clone(),
        status_reason: page.status_reason.clone(),
        execution_status: page.execution_status.clone(),
        stack_data: stack_data_from_page(page),
        is_new,
        changes: page
            .changes
            .iter()
            .map(|c| ResourceChange {
                action: c.resource_change.action.clone(),
                logical_resource_id: c.resource_change.logical_resource_id.clone(),
                physical_resource_id: c.resource_change.physical_resource_id.clone(),
                resource_type: c.resource_change.resource_type.clone(),
                replacement: c.resource_change.replacement.clone(),
                details: c
                    .resource_change
                    .details
                    .iter()
                    .map(|d| ChangeDetail {
                        change_source: d.change_source.clone(),
                        causing_entity: d.causing_entity.clone(),
                        evaluation: d.evaluation.clone(),
                        target: ChangeTarget {
                            attribute: d.target.attribute.clone(),
                            name: d.target.name.clone(),
                            requires_recreation: d.target.requires_recreation.clone(),
                        },
                    })
                    .collect(),
            })
            .collect(),
    }
}

struct CsState {
    id: String,
    name: String,
    stack_name: String,
    is_new: bool,
    data: ChangeSetData,
}

/// Controller for a single change-set resource.
pub struct ChangeSetController {
    client: ProviderClient,
    state: Mutex<CsState>,
}

impl std::fmt::Debug for ChangeSetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetController").finish()
    }
}

impl ChangeSetController {
    /// Submit a new change set built from `cs_data`. The change-set type is
    /// `CREATE` when the stack is new, `UPDATE` otherwise; the template is
    /// passed by URL when set, inline as a body otherwise, falling back to
    /// the previously deployed template.
    pub async fn create(client: ProviderClient, cs_data: &ChangeSetData) -> Result<Arc<Self>> {
        let stack = &cs_data.stack_data;
        let input = CreateChangeSetInput {
            stack_name: if !stack.id.is_empty() {
                stack.id.clone()
            } else {
                stack.name.clone()
            },
            change_set_name: cs_data.name.clone(),
            change_set_type: if cs_data.is_new {
                CHANGE_SET_TYPE_CREATE.to_string()
            } else {
                CHANGE_SET_TYPE_UPDATE.to_string()
            },
            role_arn: (!stack.role_arn.is_empty()).then(|| stack.role_arn.clone()),
            description: (!stack.description.is_empty()).then(|| stack.description.clone()),
            capabilities: stack.capabilities.clone(),
            parameters: stack
                .parameters
                .iter()
                .map(|(k, v)| RemoteParameter {
                    parameter_key: k.clone(),
                    parameter_value: v.clone(),
                })
                .collect(),
            tags: stack
                .tags
                .iter()
                .map(|(k, v)| RemoteTag { key: k.clone(), value: v.clone() })
                .collect(),
            template_url: (!stack.template_url.is_empty()).then(|| stack.template_url.clone()),
            template_body: (!stack.template_body.is_empty())
                .then(|| stack.template_body.clone()),
            use_previous_template: stack.template_url.is_empty()
                && stack.template_body.is_empty(),
        };

        debug!(stack = %stack.name, change_set = %cs_data.name, "creating change set");
        let id = client.create_change_set(&input).await?;

        Ok(Arc::new(Self {
            client,
            state: Mutex::new(CsState {
                id,
                name: cs_data.name.clone(),
                stack_name: stack.name.clone(),
                is_new: cs_data.is_new,
                data: cs_data.clone(),
            }),
        }))
    }

    /// Attach to an existing change set and describe it once. The change
    /// set is addressed by id, or by name together with the stack name.
    pub async fn attach(client: ProviderClient, cs_data: &ChangeSetData) -> Result<Arc<Self>> {
        if cs_data.id.is_empty()
            && (cs_data.name.is_empty() || cs_data.stack_data.name.is_empty())
        {
            return Err(Error::other(
                "neither change set id nor change set and stack names are set",
            ));
        }
        let controller = Arc::new(Self {
            client,
            state: Mutex::new(CsState {
                id: cs_data.id.clone(),
                name: cs_data.name.clone(),
                stack_name: cs_data.stack_data.name.clone(),
                is_new: cs_data.is_new,
                data: cs_data.clone(),
            }),
        });
        controller.refresh().await?;
        Ok(controller)
    }

    fn change_set_ref(&self) -> Result<ChangeSetRef> {
        let state = self.state.lock().unwrap();
        if !state.id.is_empty() {
            Ok(ChangeSetRef::Id(state.id.clone()))
        } else if !state.name.is_empty() && !state.stack_name.is_empty() {
            Ok(ChangeSetRef::Named {
                name: state.name.clone(),
                stack_name: state.stack_name.clone(),
            })
        } else {
            Err(Error::other("neither change set id nor change set and stack names are set"))
        }
    }

    fn not_found_data(&self) -> ChangeSetData {
        let state = self.state.lock().unwrap();
        ChangeSetData {
            id: state.id.clone(),
            name: state.name.clone(),
            status: CHANGE_SET_STATUS_NOT_FOUND.to_string(),
            stack_data: StackData { name: state.stack_name.clone(), ..Default::default() },
            is_new: state.is_new,
            ..Default::default()
        }
    }

    /// Describe the change set once, fully paginated, and cache the result.
    async fn refresh(&self) -> Result<ChangeSetData> {
        let change_set_ref = self.change_set_ref()?;
        let page = self.client.describe_change_set(&change_set_ref).await?;
        let data = {
            let is_new = self.state.lock().unwrap().is_new;
            match &page {
                Some(page) => data_from_page(page, is_new),
                None => self.not_found_data(),
            }
        };
        let mut state = self.state.lock().unwrap();
        if !data.name.is_empty() {
            state.name = data.name.clone();
        }
        state.data = data.clone();
        Ok(data)
    }

    /// The latest cached snapshot.
    pub fn data(&self) -> ChangeSetData {
        self.state.lock().unwrap().data.clone()
    }

    async fn update(
        &self,
        callback: &mut WaitCallback<ChangeSetData>,
        closer: &Closer,
    ) -> Result<()> {
        loop {
            // Every poll re-paginates fully, so the callback always sees one
            // complete snapshot.
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

    /// Poll the change set every two seconds until the callback stops the
    /// loop, fails, or the closer fires.
    pub fn wait(self: Arc<Self>, mut config: WaitConfig<ChangeSetData>) {
        tokio::spawn(async move {
            let result = self.update(&mut config.callback, &config.closer).await;
            finish_wait(result, &config.closer, config.close_on_end, config.close_on_error);
        });
    }

    /// Start executing the change set. Does not wait.
    pub async fn execute(&self) -> Result<()> {
        let change_set_ref = self.change_set_ref()?;
        self.client.execute_change_set(&change_set_ref).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::provider::{ProviderClient, RemoteChange, RemoteResourceChange};

    fn client(provider: &Arc<MockProvider>) -> ProviderClient {
        ProviderClient::new(provider.clone())
    }

    fn change(id: &str) -> RemoteChange {
        RemoteChange {
            change_type: "Resource".into(),
            resource_change: RemoteResourceChange {
                action: "Modify".into(),
                logical_resource_id: id.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_no_changes_failure_is_not_a_failure() {
        let data = ChangeSetData {
            status: STATUS_FAILED.into(),
            status_reason: NO_CHANGES_STATUS_REASON.into(),
            ..Default::default()
        };
        assert!(!data.is_failed());

        let data = ChangeSetData {
            status: STATUS_FAILED.into(),
            status_reason: "template error".into(),
            ..Default::default()
        };
        assert!(data.is_failed());
    }

    #[test]
    fn test_executable_requires_available() {
        let mut data = ChangeSetData {
            status: STATUS_CREATE_COMPLETE.into(),
            execution_status: EXECUTION_STATUS_AVAILABLE.into(),
            ..Default::default()
        };
        assert!(data.is_complete());
        assert!(data.is_executable());

        data.execution_status = "UNAVAILABLE".into();
        assert!(!data.is_executable());
    }

    #[tokio::test]
    async fn test_attach_missing_change_set_yields_sentinel() {
        let provider = Arc::new(MockProvider::new());
        let controller = ChangeSetController::attach(
            client(&provider),
            &ChangeSetData {
                name: "cs".into(),
                stack_data: StackData { name: "app".into(), ..Default::default() },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let data = controller.data();
        assert_eq!(data.status, CHANGE_SET_STATUS_NOT_FOUND);
        assert!(!data.exists());
        assert_eq!(data.stack_data.name, "app");
    }

    #[tokio::test]
    async fn test_attach_requires_addressing() {
        let provider = Arc::new(MockProvider::new());
        let err = ChangeSetController::attach(client(&provider), &ChangeSetData::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("neither change set id"));
    }

    #[tokio::test]
    async fn test_create_uses_template_url_then_body_then_previous() {
        let provider = Arc::new(MockProvider::new());

        // With a template URL the stack is addressed by its id.
        let cs_data = ChangeSetData {
            name: "cs-1".into(),
            is_new: false,
            stack_data: StackData {
                id: "stack-id".into(),
                name: "app".into(),
                template_url: "https://example/template".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        ChangeSetController::create(client(&provider), &cs_data).await.unwrap();
        assert_eq!(provider.create_change_set_calls(), 1);
    }

    #[tokio::test]
    async fn test_wait_accumulates_all_pages_per_poll() {
        let provider = Arc::new(MockProvider::new());
        provider.set_page_size(2);
        provider.set_next_change_set_changes(vec![
            change("a"),
            change("b"),
            change("c"),
            change("d"),
            change("e"),
        ]);

        let cs_data = ChangeSetData {
            name: "cs".into(),
            is_new: true,
            stack_data: StackData {
                name: "app".into(),
                template_body: "{}".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let controller = ChangeSetController::create(client(&provider), &cs_data).await.unwrap();

        let closer = Closer::new();
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let snapshots2 = snapshots.clone();
        controller.clone().wait(WaitConfig {
            callback: Box::new(move |data| {
                snapshots2.lock().unwrap().push(data.changes.len());
                Ok(data.is_in_progress())
            }),
            closer: closer.clone(),
            close_on_end: true,
            close_on_error: true,
        });
        closer.wait().await.unwrap();

        // One callback per poll, each with the full accumulated change list.
        assert_eq!(*snapshots.lock().unwrap(), vec![5]);
        assert!(controller.data().is_complete());
        assert!(controller.data().is_new);
    }
}
