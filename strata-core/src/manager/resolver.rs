//! Cross-stack reference resolution.
//!
//! Rendering a stack's inputs is two-phase. A discovery render collects the
//! `stack(name=...)` references from every template-bearing string; each
//! referenced stack is then resolved under the graph rules (self-reference
//! rejection, lookup, cycle detection, the freshness gate, and the verify
//! hook), producing a snapshot map. The final render's `stack` function is a
//! pure lookup into that map.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::node::StackNode;
use super::StackManager;
use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::template::{self, StackLookup};

impl StackManager {
    /// Resolve every stack reference in the stack's inputs, returning the
    /// lookup for the final render. The root stack never resolves
    /// references: its `stack` function stays uninstalled.
    pub(crate) async fn resolve_references(
        &self,
        node: &Arc<StackNode>,
        stack_config: &StackConfig,
    ) -> Result<Option<StackLookup>> {
        if node.config_name == self.root_stack() {
            return Ok(None);
        }

        let context = self.template_context();
        let mut wanted: Vec<String> = Vec::new();
        let inputs = std::iter::once(stack_config.role_arn.as_str())
            .chain(stack_config.parameters.values().map(String::as_str))
            .chain(stack_config.tags.values().map(String::as_str));
        for content in inputs {
            for name in template::discover_stack_refs(content, &context) {
                if !wanted.contains(&name) {
                    wanted.push(name);
                }
            }
        }

        let mut resolved: BTreeMap<String, tera::Value> = BTreeMap::new();
        for target in wanted {
            let value = self.resolve_reference(node, &target).await?;
            resolved.insert(target, value);
        }

        let lookup: StackLookup = Arc::new(move |name| {
            resolved
                .get(name)
                .cloned()
                .ok_or_else(|| format!("stack '{name}' is not resolved"))
        });
        Ok(Some(lookup))
    }

    /// Resolve one reference from `node` to the stack named `target`,
    /// applying the graph rules and the freshness gate.
    async fn resolve_reference(
        &self,
        node: &Arc<StackNode>,
        target: &str,
    ) -> Result<tera::Value> {
        if target == node.config_name {
            return Err(Error::SelfReference { stack: target.to_string() });
        }
        let parent = self.node(target)?;

        // Record the dependency edge; a cycle is rejected here with the
        // full offending chain.
        parent.add_child(node)?;

        if parent.is_fresh() {
            debug!(stack = %target, "parent stack is fresh, skipping verification");
            return stack_value(parent);
        }

        if let Some(verify) = self.verify_fn() {
            verify(target.to_string()).await.map_err(|e| Error::ParentNotReady {
                stack: target.to_string(),
                source: Box::new(e),
            })?;
        }

        let data = parent.controller.data();
        if !data.exists() {
            return Err(Error::ParentNotReady {
                stack: target.to_string(),
                source: Box::new(Error::other(format!("stack '{target}' is not deployed"))),
            });
        }
        stack_value(parent)
    }
}

fn stack_value(node: &Arc<StackNode>) -> Result<tera::Value> {
    serde_json::to_value(node.info())
        .map_err(|e| Error::other(format!("cannot serialize stack data: {e}")))
}
