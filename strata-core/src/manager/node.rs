//! Runtime stack node.
//!
//! One node exists per configured stack. It owns the stack controller, the
//! bookkeeping flags driving the freshness gate, the child set used for
//! cycle detection, and the nested-stack tracker map for event fan-out.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use super::{EmitFn, Event, StackInfo};
use crate::closer::Closer;
use crate::error::{Error, Result};
use crate::provider::ProviderClient;
use crate::remote::{
    StackController, StackData, StackEventData, StackEvents, WaitConfig, STACK_RESOURCE_TYPE,
};

/// Acceptance rule for update tracking; decides when polling is done.
pub(crate) type AcceptFn = Box<dyn FnMut(&StackData) -> Result<bool> + Send>;

#[derive(Debug, Clone, Copy, Default)]
struct NodeFlags {
    planned: bool,
    has_change: bool,
    updated: bool,
}

pub(crate) struct StackNode {
    /// Full remote stack name.
    pub name: String,
    /// Name of the stack in the configuration.
    pub config_name: String,
    pub controller: Arc<StackController>,

    flags: Mutex<NodeFlags>,
    children: Mutex<BTreeMap<String, Arc<StackNode>>>,
    nested: Mutex<HashMap<String, Closer>>,
}

impl StackNode {
    pub async fn new(
        client: ProviderClient,
        stack_name: String,
        config_name: String,
    ) -> Result<Arc<Self>> {
        let controller = StackController::new(client, stack_name.clone()).await?;
        Ok(Arc::new(Self {
            name: stack_name,
            config_name,
            controller,
            flags: Mutex::new(NodeFlags::default()),
            children: Mutex::new(BTreeMap::new()),
            nested: Mutex::new(HashMap::new()),
        }))
    }

    pub fn info(&self) -> StackInfo {
        StackInfo { config_name: self.config_name.clone(), data: self.controller.data() }
    }

    pub fn set_planned(&self, has_change: bool) {
        let mut flags = self.flags.lock().unwrap();
        flags.planned = true;
        flags.has_change = has_change;
    }

    pub fn set_updated(&self) {
        self.flags.lock().unwrap().updated = true;
    }

    /// Whether downstream consumers may use this node's data without
    /// re-verification: it was updated this run, or planned without changes.
    pub fn is_fresh(&self) -> bool {
        let flags = self.flags.lock().unwrap();
        flags.updated || (flags.planned && !flags.has_change)
    }

    /// Register `child` as depending on this node. Fails when the new edge
    /// would close a cycle, reporting the full chain.
    pub fn add_child(&self, child: &Arc<StackNode>) -> Result<()> {
        let mut children = self.children.lock().unwrap();
        if children.contains_key(&child.config_name) {
            return Ok(());
        }
        if let Some(mut chain) = child.find_descendant(&self.config_name) {
            chain.push(self.config_name.clone());
            return Err(Error::CycleDetected { chain });
        }
        children.insert(child.config_name.clone(), Arc::clone(child));
        Ok(())
    }

    /// Depth-first search for `name` among descendants; returns the path
    /// from the found node up to (and including) this one.
    ///
    /// The target is always matched by map key before recursing, so the
    /// search never locks the node whose `add_child` initiated it.
    fn find_descendant(&self, name: &str) -> Option<Vec<String>> {
        let children = self.children.lock().unwrap();
        for (child_name, child) in children.iter() {
            if child_name == name {
                return Some(vec![child.config_name.clone(), self.config_name.clone()]);
            }
            if let Some(mut chain) = child.find_descendant(name) {
                chain.push(self.config_name.clone());
                return Some(chain);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn nested_tracker_count(&self) -> usize {
        self.nested.lock().unwrap().len()
    }

    /// Start polling the stack, forwarding status changes through `emit`
    /// (de-duplicated) and resource events through the event stream,
    /// including nested-stack fan-out. The returned closer fires when the
    /// acceptance rule ends the loop or polling fails.
    pub fn track_updates(
        self: Arc<Self>,
        client: ProviderClient,
        emit: EmitFn,
        mut accept: AcceptFn,
    ) -> Closer {
        debug!(stack = %self.name, "starting stack update tracking");
        let closer = Closer::new();

        let node = Arc::clone(&self);
        let emit_status = emit.clone();
        let mut last_status = String::new();
        Arc::clone(&self.controller).wait(WaitConfig {
            callback: Box::new(move |stack| {
                debug!(stack = %stack.name, status = %stack.status, "received stack update");
                let again = accept(stack)?;
                if again && stack.status != last_status {
                    emit_status(Event::Stack(StackInfo {
                        config_name: node.config_name.clone(),
                        data: stack.clone(),
                    }));
                    last_status = stack.status.clone();
                }
                Ok(again)
            }),
            closer: closer.clone(),
            close_on_end: true,
            close_on_error: true,
        });

        let node = Arc::clone(&self);
        let events_closer = closer.clone();
        tokio::spawn(async move {
            let name = node.name.clone();
            if let Err(err) = node.track_stack_events(name, events_closer, client, emit).await {
                error!(error = %err.chain(), "cannot track stack events");
            }
        });

        closer
    }

    /// Tail the events of `name` (the stack itself or a nested stack) until
    /// `closer` fires, forwarding each event through `emit` and spawning
    /// nested trackers as nested stacks appear.
    async fn track_stack_events(
        self: Arc<Self>,
        name: String,
        closer: Closer,
        client: ProviderClient,
        emit: EmitFn,
    ) -> Result<()> {
        debug!(stack = %name, "starting stack events tracking");
        let stream = StackEvents::new(client.clone(), name).await?;

        let node = Arc::clone(&self);
        let parent_closer = closer.clone();
        stream.wait(WaitConfig {
            callback: Box::new(move |event| {
                if event.resource_type == STACK_RESOURCE_TYPE {
                    Self::track_nested(&node, event, &parent_closer, &client, &emit);
                }
                emit(Event::StackEvent(event.clone()));
                Ok(true)
            }),
            closer,
            close_on_end: false,
            close_on_error: false,
        });

        Ok(())
    }

    /// Maintain the nested tracker map for one stack-resource event. A
    /// completion event only removes an existing tracker, so no tracker
    /// survives a nested stack reaching a terminal state.
    fn track_nested(
        node: &Arc<Self>,
        event: &StackEventData,
        parent: &Closer,
        client: &ProviderClient,
        emit: &EmitFn,
    ) {
        let stack_id = &event.physical_resource_id;
        if stack_id.is_empty()
            || *stack_id == node.name
            || *stack_id == node.controller.data().id
        {
            return;
        }

        let mut nested = node.nested.lock().unwrap();
        if event.is_complete() {
            if let Some(tracker) = nested.remove(stack_id) {
                debug!(stack = %stack_id, "removing nested stack tracking");
                tracker.close(None);
            }
            return;
        }
        if nested.contains_key(stack_id) {
            return;
        }

        debug!(stack = %stack_id, "adding nested stack tracking");
        let tracker = parent.child();
        nested.insert(stack_id.clone(), tracker.clone());

        let node = Arc::clone(node);
        let client = client.clone();
        let emit = emit.clone();
        let stack_id = stack_id.clone();
        tokio::spawn(async move {
            if let Err(err) = node
                .track_stack_events(stack_id.clone(), tracker, client, emit)
                .await
            {
                error!(stack = %stack_id, error = %err.chain(), "nested stack tracking failed");
            }
        });
    }
}
