//! The stack manager: the externally visible lifecycle API.
//!
//! Holds the configured stack graph, renders stack inputs, drives the
//! remote-resource controllers, enforces ordering and cycle rules, and
//! emits progress events through a single callback.

mod node;
mod resolver;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::artifact::{self, RemoteFile, Upload};
use crate::closer::Closer;
use crate::config::{Config, FileConfig, StackConfig};
use crate::error::{Error, Result};
use crate::plan::Plan;
use crate::provider::{ObjectStore, ProviderApi, ProviderClient};
use crate::remote::{
    ChangeSetController, ChangeSetData, StackData, StackEventData, WaitConfig,
};

use node::{AcceptFn, StackNode};

/// Key prefix for uploaded stack templates.
const TEMPLATE_PREFIX: &str = "templates/";

/// A stack snapshot together with its configuration name.
#[derive(Debug, Clone, Serialize)]
pub struct StackInfo {
    pub config_name: String,
    #[serde(flatten)]
    pub data: StackData,
}

/// An event emitted by the manager while an operation runs.
#[derive(Debug, Clone)]
pub enum Event {
    /// The stack's status changed.
    Stack(StackInfo),
    /// A change-set snapshot arrived.
    ChangeSet(ChangeSetData),
    /// A resource event arrived.
    StackEvent(StackEventData),
}

/// Callback receiving manager events.
pub type EmitFn = Arc<dyn Fn(Event) + Send + Sync>;

/// Hook invoked to bring a referenced parent stack up to date before its
/// outputs are consumed.
pub type VerifyFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

struct ManagerState {
    bucket: Option<String>,
    files: std::collections::BTreeMap<String, RemoteFile>,
}

/// High level API for managing a fleet of stacks.
pub struct StackManager {
    name: String,
    config: Config,
    client: ProviderClient,
    store: Arc<dyn ObjectStore>,

    account_id: String,
    region: String,
    session_name: String,

    stack_order: Vec<String>,
    stacks: HashMap<String, Arc<StackNode>>,

    vars: std::collections::BTreeMap<String, String>,
    file_configs: std::collections::BTreeMap<String, FileConfig>,

    state: Mutex<ManagerState>,
    emit: Mutex<EmitFn>,
    verify: Mutex<Option<VerifyFn>>,
}

impl std::fmt::Debug for StackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackManager").field("name", &self.name).finish()
    }
}

impl StackManager {
    /// Create a manager from configuration: authenticate, verify the
    /// account, and initialize one runtime node per stack with a single
    /// remote describe.
    pub async fn new(
        config: Config,
        api: Arc<dyn ProviderApi>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<StackManager> {
        let client = ProviderClient::new(api);
        let identity = client.caller_identity().await?;

        if !config.account_id.is_empty() && config.account_id != identity.account {
            return Err(Error::config(format!(
                "AccountID specified in config ({}) is not same as for the provider connection ({})",
                config.account_id, identity.account
            )));
        }

        let mut stack_order = Vec::with_capacity(config.stacks.len());
        let mut stacks = HashMap::with_capacity(config.stacks.len());
        for stack_config in &config.stacks {
            if stack_config.name.is_empty() {
                return Err(Error::config("stack name is empty"));
            }
            if stacks.contains_key(&stack_config.name) {
                return Err(Error::config(format!("duplicate stack {}", stack_config.name)));
            }
            let node = StackNode::new(
                client.clone(),
                format!("{}-{}", config.name, stack_config.name),
                stack_config.name.clone(),
            )
            .await?;
            stack_order.push(stack_config.name.clone());
            stacks.insert(stack_config.name.clone(), node);
        }

        Ok(StackManager {
            name: config.name.clone(),
            session_name: session_name(&identity.arn),
            account_id: identity.account,
            region: identity.region,
            client,
            store,
            stack_order,
            stacks,
            vars: config.variables.clone(),
            file_configs: config.files.clone(),
            state: Mutex::new(ManagerState {
                bucket: None,
                files: std::collections::BTreeMap::new(),
            }),
            emit: Mutex::new(Arc::new(|_| {})),
            verify: Mutex::new(None),
            config,
        })
    }

    /// Set the callback invoked for every manager event.
    pub fn set_emit(&self, emit: EmitFn) {
        *self.emit.lock().unwrap() = emit;
    }

    /// Set the verify hook called for referenced parent stacks.
    pub fn set_verify(&self, verify: VerifyFn) {
        *self.verify.lock().unwrap() = Some(verify);
    }

    /// Set the bucket used for template uploads.
    pub fn set_bucket(&self, bucket: impl Into<String>) {
        self.state.lock().unwrap().bucket = Some(bucket.into());
    }

    pub fn bucket(&self) -> Option<String> {
        self.state.lock().unwrap().bucket.clone()
    }

    fn emit_fn(&self) -> EmitFn {
        self.emit.lock().unwrap().clone()
    }

    pub(crate) fn verify_fn(&self) -> Option<VerifyFn> {
        self.verify.lock().unwrap().clone()
    }

    pub(crate) fn root_stack(&self) -> &str {
        &self.config.root_stack
    }

    fn get_node(&self, name: &str) -> Result<(&Arc<StackNode>, &StackConfig)> {
        let node = self
            .stacks
            .get(name)
            .ok_or_else(|| Error::UnknownStack { stack: name.to_string() })?;
        let config = self
            .config
            .stacks
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::UnknownStack { stack: name.to_string() })?;
        Ok((node, config))
    }

    pub(crate) fn node(&self, name: &str) -> Result<&Arc<StackNode>> {
        self.stacks
            .get(name)
            .ok_or_else(|| Error::UnknownStack { stack: name.to_string() })
    }

    /// Snapshots of all stacks in configuration order.
    pub fn list(&self) -> Vec<StackInfo> {
        self.stack_order
            .iter()
            .filter_map(|name| self.stacks.get(name))
            .map(|node| node.info())
            .collect()
    }

    /// Snapshot of a single stack.
    pub fn get(&self, name: &str) -> Result<StackInfo> {
        Ok(self.node(name)?.info())
    }

    /// Plan changes for a stack: render its inputs, create a change set,
    /// wait until it is terminal, and build the plan.
    pub async fn plan(&self, name: &str) -> Result<Plan> {
        self.plan_inner(name)
            .await
            .map_err(|e| Error::PlanFailed { stack: name.to_string(), source: Box::new(e) })
    }

    async fn plan_inner(&self, name: &str) -> Result<Plan> {
        let (node, stack_config) = self.get_node(name)?;
        info!(stack = %name, "planning stack");
        let stack_data = self.render_stack_data(name, stack_config, node).await?;

        let current = node.controller.data();
        let cs_data = ChangeSetData {
            name: self.new_change_set_name(&node.name),
            is_new: !current.exists() || current.is_review_in_progress(),
            stack_data,
            ..Default::default()
        };

        let change_set = ChangeSetController::create(self.client.clone(), &cs_data).await?;

        let closer = Closer::new();
        let emit = self.emit_fn();
        Arc::clone(&change_set).wait(WaitConfig {
            callback: Box::new(move |data: &ChangeSetData| {
                emit(Event::ChangeSet(data.clone()));
                if data.is_failed() {
                    return Err(Error::other(format!(
                        "cannot create change set: {}",
                        data.status_reason
                    )));
                }
                Ok(data.is_in_progress())
            }),
            closer: closer.clone(),
            close_on_end: true,
            close_on_error: true,
        });
        closer.wait().await?;

        let plan = Plan::new(change_set.data(), node.info(), self.config.ignore_nested_updates)?;
        node.set_planned(plan.has_change);
        Ok(plan)
    }

    /// Rehydrate a previously created plan from its stripped id.
    pub async fn get_plan(&self, name: &str, plan_id: &str) -> Result<Plan> {
        let node = self.node(name)?;
        let change_set = ChangeSetController::attach(
            self.client.clone(),
            &ChangeSetData {
                id: self.change_set_id(plan_id),
                stack_data: node.controller.data(),
                ..Default::default()
            },
        )
        .await?;
        Plan::new(change_set.data(), node.info(), self.config.ignore_nested_updates)
    }

    /// Execute a previously planned change set and stream progress until
    /// the stack reaches a terminal state.
    pub async fn execute(&self, name: &str, plan_id: &str) -> Result<StackInfo> {
        self.execute_inner(name, plan_id)
            .await
            .map_err(|e| Error::ExecuteFailed { stack: name.to_string(), source: Box::new(e) })
    }

    async fn execute_inner(&self, name: &str, plan_id: &str) -> Result<StackInfo> {
        let node = self.node(name)?;
        let change_set = ChangeSetController::attach(
            self.client.clone(),
            &ChangeSetData {
                id: self.change_set_id(plan_id),
                stack_data: node.controller.data(),
                ..Default::default()
            },
        )
        .await?;
        change_set.execute().await?;

        let accept: AcceptFn = Box::new(|stack| {
            if stack.is_in_progress() {
                Ok(true)
            } else if stack.is_complete() && !stack.is_rollback() {
                Ok(false)
            } else {
                Err(Error::other(format!(
                    "stack '{}' has invalid status '{}'",
                    stack.name, stack.status
                )))
            }
        });
        let closer = Arc::clone(node).track_updates(self.client.clone(), self.emit_fn(), accept);
        closer.wait().await?;

        node.set_updated();
        Ok(node.info())
    }

    /// Destroy a stack and wait for it to disappear. Destroying an absent
    /// stack is a no-op that returns the not-found snapshot.
    pub async fn destroy(&self, name: &str) -> Result<StackInfo> {
        self.destroy_inner(name)
            .await
            .map_err(|e| Error::DestroyFailed { stack: name.to_string(), source: Box::new(e) })
    }

    async fn destroy_inner(&self, name: &str) -> Result<StackInfo> {
        let node = self.node(name)?;
        node.controller.destroy().await?;

        let accept: AcceptFn = Box::new(|stack| {
            if stack.is_in_progress() {
                Ok(true)
            } else if !stack.exists() {
                Ok(false)
            } else {
                Err(Error::other(format!(
                    "stack '{}' has invalid status '{}'",
                    stack.name, stack.status
                )))
            }
        });
        let closer = Arc::clone(node).track_updates(self.client.clone(), self.emit_fn(), accept);
        closer.wait().await?;

        Ok(node.info())
    }

    /// Upload every configured auxiliary file to the artifact store,
    /// defaulting to the bootstrap bucket, and record the results for
    /// template rendering.
    pub async fn sync_files(&self) -> Result<()> {
        for (name, file_config) in &self.file_configs {
            let bucket = if file_config.bucket.is_empty() {
                self.bucket().ok_or_else(|| {
                    Error::config("no bucket configured; initialize the bootstrap stack first")
                })?
            } else {
                file_config.bucket.clone()
            };

            debug!(file = %name, bucket = %bucket, "syncing file");
            let file = artifact::upload(
                self.store.as_ref(),
                Upload {
                    bucket: &bucket,
                    key: (!file_config.key.is_empty()).then_some(file_config.key.as_str()),
                    prefix: "",
                    source: Path::new(&file_config.src),
                    content_type: None,
                    region: &self.region,
                },
            )
            .await
            .map_err(|e| Error::other(format!("cannot upload file '{name}': {e}")))?;

            self.state.lock().unwrap().files.insert(name.clone(), file);
        }
        Ok(())
    }

    /// The template context shared by all input rendering: deployment name,
    /// variables, and uploaded files.
    pub(crate) fn template_context(&self) -> tera::Context {
        let mut context = tera::Context::new();
        context.insert("Name", &self.name);
        context.insert("Var", &self.vars);
        let files = self.state.lock().unwrap().files.clone();
        context.insert("File", &files);
        context
    }

    /// Render the desired stack state from its configuration, resolving
    /// cross-stack references and uploading the template when a bucket is
    /// available. Before the bootstrap completes the template is sent
    /// inline instead.
    async fn render_stack_data(
        &self,
        name: &str,
        stack_config: &StackConfig,
        node: &Arc<StackNode>,
    ) -> Result<StackData> {
        let lookup = self.resolve_references(node, stack_config).await?;
        let context = self.template_context();

        let render = |content: &str, what: String| {
            let rendered = crate::template::render(content, &context, lookup.clone());
            rendered.map_err(|e| {
                Error::template(format!("cannot render {what} of stack '{name}': {e}"))
            })
        };

        let mut data = StackData {
            name: format!("{}-{}", self.name, name),
            capabilities: stack_config.capabilities.clone(),
            ..Default::default()
        };

        data.role_arn = render(&stack_config.role_arn, "RoleARN".to_string())?;
        for (key, value) in &stack_config.parameters {
            data.parameters
                .insert(key.clone(), render(value, format!("parameter '{key}'"))?);
        }
        for (key, value) in &stack_config.tags {
            data.tags.insert(key.clone(), render(value, format!("tag '{key}'"))?);
        }

        match self.bucket() {
            Some(bucket) => {
                let template = artifact::upload(
                    self.store.as_ref(),
                    Upload {
                        bucket: &bucket,
                        key: None,
                        prefix: TEMPLATE_PREFIX,
                        source: Path::new(&stack_config.template),
                        content_type: None,
                        region: &self.region,
                    },
                )
                .await
                .map_err(|e| {
                    Error::other(format!(
                        "cannot upload template '{}' for stack '{name}': {e}",
                        stack_config.template
                    ))
                })?;
                data.template_url = template.url;
            }
            None => {
                // Only the bootstrap deploys without a bucket.
                let path = Path::new(&stack_config.template);
                data.template_body = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::io(path, &e))?;
            }
        }

        Ok(data)
    }

    fn new_change_set_name(&self, stack_name: &str) -> String {
        format!(
            "{}-{}-{}",
            stack_name,
            self.session_name,
            Utc::now().format("%Y%m%d%H%M%S")
        )
    }

    /// Reconstruct the fully qualified change-set identifier from a
    /// stripped plan id using the authenticated region and account.
    fn change_set_id(&self, plan_id: &str) -> String {
        format!(
            "arn:aws:cloudformation:{}:{}:changeSet/{}",
            self.region, self.account_id, plan_id
        )
    }
}

/// Derive a session name from the caller's identity, keeping only
/// alphanumerics and dashes.
fn session_name(arn: &str) -> String {
    let resource = arn.splitn(6, ':').nth(5).unwrap_or(arn);
    resource
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}
