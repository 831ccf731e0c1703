//! Command handlers over the stack manager.

use std::sync::Arc;

use tracing::info;

use strata_core::provider::{ObjectStore, ProviderApi};
use strata_core::{Config, Error, StackInfo, StackManager};

use crate::confirm::ask_for_confirmation;
use crate::output;

/// Name given to the bootstrap stack; it is prepended to the stack list and
/// fixed as the root of the reference graph.
pub const BOOTSTRAP_STACK_NAME: &str = "bootstrap";

/// Errors surfaced by the command layer.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] Error),

    /// Carrier for a non-standard exit code, notably 2 from `plan` when
    /// changes are present.
    #[error("exit status {code}")]
    StatusCode { code: u8 },
}

/// Flags shared by the modifying commands.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    pub auto_approve: bool,
    pub input: bool,
    pub verify_parent_stacks: bool,
}

#[derive(Clone)]
pub struct Handler {
    manager: Arc<StackManager>,
    flags: Flags,
}

impl Handler {
    /// Build the manager from configuration: the bootstrap stack is named,
    /// prepended and fixed as the root; events stream to stderr; the
    /// verify hook deploys referenced parents when enabled.
    pub async fn new(
        mut config: Config,
        flags: Flags,
        api: Arc<dyn ProviderApi>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Handler, CliError> {
        config.bootstrap.name = BOOTSTRAP_STACK_NAME.to_string();
        let bootstrap = config.bootstrap.clone();
        config.stacks.insert(0, bootstrap);
        config.root_stack = BOOTSTRAP_STACK_NAME.to_string();

        let manager = Arc::new(StackManager::new(config, api, store).await?);
        manager.set_emit(Arc::new(output::status_line));

        let handler = Handler { manager: manager.clone(), flags };
        let hook = handler.clone();
        manager.set_verify(Arc::new(move |name| {
            let hook = hook.clone();
            Box::pin(async move { hook.verify_stack(&name).await })
        }));

        Ok(handler)
    }

    /// The verify hook: bring a referenced parent stack up to date before
    /// its outputs are consumed.
    async fn verify_stack(&self, name: &str) -> strata_core::Result<()> {
        if !self.flags.verify_parent_stacks {
            info!(stack = %name, "skipping parent stack verification");
            return Ok(());
        }
        info!(stack = %name, "verifying parent stack");
        let (stack, updated) = self.deploy_stack(name).await.map_err(|e| match e {
            CliError::Core(err) => err,
            CliError::StatusCode { code } => Error::other(format!("exit status {code}")),
        })?;
        if updated {
            eprintln!("{}", output::render_stack(&stack, false));
            info!(stack = %name, "stack updated");
        } else {
            info!(stack = %name, "parent stack does not contain changes");
        }
        Ok(())
    }

    /// Plan a stack and, when it carries changes, confirm and execute them.
    /// Returns the final stack state and whether anything changed.
    async fn deploy_stack(&self, name: &str) -> Result<(StackInfo, bool), CliError> {
        let plan = self.manager.plan(name).await?;
        let mut stack = plan.stack.clone();
        if plan.has_change {
            eprintln!("{}", output::render_plan(&plan));
            ask_for_confirmation(
                "Do you want to apply these changes on stack?",
                self.flags.auto_approve,
                self.flags.input,
            )?;
            info!(stack = %name, "changes approved, starting plan execution");
            stack = self.manager.execute(name, &plan.id).await?;
        }
        Ok((stack, plan.has_change))
    }

    /// Plan-and-deploy the bootstrap stack, set the artifact bucket from
    /// its outputs, and sync the configured files.
    async fn init(&self) -> Result<StackInfo, CliError> {
        let (stack, has_change) = self.deploy_stack(BOOTSTRAP_STACK_NAME).await?;
        if has_change {
            eprintln!("{}", output::render_stack(&stack, false));
        }

        let bucket = stack.data.outputs.get("Bucket").cloned().ok_or_else(|| {
            Error::config("bootstrap stack must have 'Bucket' in outputs")
        })?;
        self.manager.set_bucket(bucket);
        self.manager.sync_files().await?;

        Ok(stack)
    }

    pub async fn list(&self) -> Result<(), CliError> {
        println!("{}", output::render_list(&self.manager.list()));
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Result<(), CliError> {
        let stack = self.manager.get(name)?;
        println!("{}", output::render_stack(&stack, true));
        Ok(())
    }

    pub async fn init_command(&self) -> Result<(), CliError> {
        let stack = self.init().await?;
        println!("{}", output::render_stack(&stack, true));
        Ok(())
    }

    pub async fn plan(&self, name: &str) -> Result<(), CliError> {
        // Fail on unknown stacks before doing any bootstrap work.
        self.manager.get(name)?;
        if name != BOOTSTRAP_STACK_NAME {
            self.init().await?;
        }

        info!(stack = %name, "planning stack");
        let plan = self.manager.plan(name).await?;
        self.finish_plan(&plan)
    }

    pub async fn plan_status(&self, name: &str, plan_id: &str) -> Result<(), CliError> {
        let plan = self.manager.get_plan(name, plan_id).await?;
        self.finish_plan(&plan)
    }

    fn finish_plan(&self, plan: &strata_core::Plan) -> Result<(), CliError> {
        eprintln!("{}", output::render_plan(plan));
        println!("{}", plan.id);
        if plan.has_change {
            return Err(CliError::StatusCode { code: 2 });
        }
        info!(stack = %plan.stack.config_name, "stack does not contain changes");
        Ok(())
    }

    pub async fn execute(&self, name: &str, plan_id: &str) -> Result<(), CliError> {
        let plan = self.manager.get_plan(name, plan_id).await?;
        eprintln!("{}", output::render_plan(&plan));
        let stack = self.manager.execute(name, plan_id).await?;
        println!("{}", output::render_stack(&stack, true));
        Ok(())
    }

    pub async fn deploy(&self, name: &str) -> Result<(), CliError> {
        if name != BOOTSTRAP_STACK_NAME {
            self.init().await?;
        }
        let (stack, _) = self.deploy_stack(name).await?;
        println!("{}", output::render_stack(&stack, true));
        Ok(())
    }

    pub async fn destroy(&self, name: &str) -> Result<(), CliError> {
        let stack = self.manager.get(name)?;
        eprintln!("{}", output::render_stack(&stack, false));

        ask_for_confirmation(
            "Are you sure you want to destroy this stack?",
            self.flags.auto_approve,
            self.flags.input,
        )?;

        let stack = self.manager.destroy(name).await?;
        println!("{}", output::render_stack(&stack, true));
        Ok(())
    }
}
