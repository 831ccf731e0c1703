//! In-memory provider and object store used by tests.
//!
//! Seedable stacks, events and change sets with index-based page tokens,
//! per-operation failure injection and call counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use md5::{Digest, Md5};

use super::api::*;

pub const MOCK_REGION: &str = "eu-central-1";
pub const MOCK_ACCOUNT: &str = "123456789012";
pub const MOCK_CALLER_ARN: &str = "arn:aws:iam::123456789012:user/tester";

type DescribeStackOverride =
    Arc<dyn Fn(&str) -> ProviderResult<Option<RemoteStack>> + Send + Sync>;
type DescribeChangeSetOverride = Arc<
    dyn Fn(&ChangeSetRef, Option<&str>) -> ProviderResult<Option<RemoteChangeSet>> + Send + Sync,
>;

#[derive(Default)]
struct MockState {
    stacks: HashMap<String, RemoteStack>,
    events: Vec<RemoteStackEvent>,
    change_sets: HashMap<String, RemoteChangeSet>,
    page_size: usize,
    change_set_seq: u64,

    next_change_set_changes: Vec<RemoteChange>,
    next_change_set_status: Option<(String, String, String)>,

    fail_describe_stack: Option<(u32, ErrorKind)>,
    describe_stack_override: Option<DescribeStackOverride>,
    describe_change_set_override: Option<DescribeChangeSetOverride>,

    describe_stack_calls: usize,
    create_change_set_calls: usize,
    execute_change_set_calls: usize,
    delete_stack_calls: usize,
}

/// Mock implementation of the provider API.
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockState { page_size: 10, ..Default::default() }) }
    }

    pub fn add_stack(&self, mut stack: RemoteStack) {
        if stack.stack_id.is_empty() {
            stack.stack_id = format!(
                "arn:aws:cloudformation:{MOCK_REGION}:{MOCK_ACCOUNT}:stack/{}/seed",
                stack.stack_name
            );
        }
        let mut state = self.state.lock().unwrap();
        state.stacks.insert(stack.stack_name.clone(), stack);
    }

    pub fn remove_stack(&self, name: &str) {
        self.state.lock().unwrap().stacks.remove(name);
    }

    pub fn stack(&self, name: &str) -> Option<RemoteStack> {
        self.state.lock().unwrap().stacks.get(name).cloned()
    }

    /// Prepend events; like the real listing, newest events come first.
    pub fn push_events(&self, events: Vec<RemoteStackEvent>) {
        let mut state = self.state.lock().unwrap();
        let old = std::mem::take(&mut state.events);
        state.events = events;
        state.events.extend(old);
    }

    pub fn add_change_set(&self, change_set: RemoteChangeSet) {
        let mut state = self.state.lock().unwrap();
        state.change_sets.insert(change_set.change_set_id.clone(), change_set);
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().unwrap().page_size = page_size;
    }

    /// Changes reported by the change set created next.
    pub fn set_next_change_set_changes(&self, changes: Vec<RemoteChange>) {
        self.state.lock().unwrap().next_change_set_changes = changes;
    }

    /// Status triple (status, reason, execution status) of the change set
    /// created next. Defaults to CREATE_COMPLETE / AVAILABLE.
    pub fn set_next_change_set_status(&self, status: &str, reason: &str, execution: &str) {
        self.state.lock().unwrap().next_change_set_status =
            Some((status.into(), reason.into(), execution.into()));
    }

    pub fn fail_describe_stack_times(&self, times: u32, kind: ErrorKind) {
        self.state.lock().unwrap().fail_describe_stack = Some((times, kind));
    }

    pub fn set_describe_stack_override(&self, f: DescribeStackOverride) {
        self.state.lock().unwrap().describe_stack_override = Some(f);
    }

    pub fn set_describe_change_set_override(&self, f: DescribeChangeSetOverride) {
        self.state.lock().unwrap().describe_change_set_override = Some(f);
    }

    pub fn describe_stack_calls(&self) -> usize {
        self.state.lock().unwrap().describe_stack_calls
    }

    pub fn create_change_set_calls(&self) -> usize {
        self.state.lock().unwrap().create_change_set_calls
    }

    pub fn execute_change_set_calls(&self) -> usize {
        self.state.lock().unwrap().execute_change_set_calls
    }

    pub fn delete_stack_calls(&self) -> usize {
        self.state.lock().unwrap().delete_stack_calls
    }

    fn find_change_set(state: &MockState, change_set: &ChangeSetRef) -> Option<RemoteChangeSet> {
        match change_set {
            ChangeSetRef::Id(id) => state.change_sets.get(id).cloned(),
            ChangeSetRef::Named { name, stack_name } => state
                .change_sets
                .values()
                .find(|cs| &cs.change_set_name == name && &cs.stack_name == stack_name)
                .cloned(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn page_token(start: usize) -> Option<String> {
    Some(start.to_string())
}

#[async_trait]
impl ProviderApi for MockProvider {
    async fn describe_stack(&self, name: &str) -> ProviderResult<Option<RemoteStack>> {
        let mut state = self.state.lock().unwrap();
        state.describe_stack_calls += 1;
        if let Some((remaining, kind)) = state.fail_describe_stack {
            if remaining > 0 {
                state.fail_describe_stack = Some((remaining - 1, kind));
                return Err(ProviderError::new(kind, "injected failure"));
            }
        }
        if let Some(f) = state.describe_stack_override.clone() {
            drop(state);
            return f(name);
        }
        Ok(state
            .stacks
            .values()
            .find(|s| s.stack_name == name || s.stack_id == name)
            .cloned())
    }

    async fn describe_stack_events(
        &self,
        name: &str,
        next_token: Option<&str>,
    ) -> ProviderResult<StackEventPage> {
        let state = self.state.lock().unwrap();
        let events: Vec<RemoteStackEvent> = state
            .events
            .iter()
            .filter(|e| e.stack_name == name || e.stack_id == name)
            .cloned()
            .collect();

        let start = next_token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
        let page_size = state.page_size;
        let mut page = StackEventPage::default();
        if start + page_size < events.len() {
            page.events = events[start..start + page_size].to_vec();
            page.next_token = page_token(start + page_size);
        } else if start < events.len() {
            page.events = events[start..].to_vec();
        }
        Ok(page)
    }

    async fn create_change_set(&self, input: &CreateChangeSetInput) -> ProviderResult<String> {
        let mut state = self.state.lock().unwrap();
        state.create_change_set_calls += 1;
        state.change_set_seq += 1;
        let id = format!(
            "arn:aws:cloudformation:{MOCK_REGION}:{MOCK_ACCOUNT}:changeSet/{}/{}",
            input.change_set_name, state.change_set_seq
        );

        let (status, status_reason, execution_status) =
            state.next_change_set_status.take().unwrap_or_else(|| {
                ("CREATE_COMPLETE".into(), String::new(), "AVAILABLE".into())
            });
        let stack_id = state
            .stacks
            .get(&input.stack_name)
            .map(|s| s.stack_id.clone())
            .unwrap_or_else(|| {
                format!(
                    "arn:aws:cloudformation:{MOCK_REGION}:{MOCK_ACCOUNT}:stack/{}/new",
                    input.stack_name
                )
            });

        let change_set = RemoteChangeSet {
            change_set_id: id.clone(),
            change_set_name: input.change_set_name.clone(),
            stack_id,
            stack_name: input.stack_name.clone(),
            status,
            status_reason,
            execution_status,
            capabilities: input.capabilities.clone(),
            parameters: input.parameters.clone(),
            tags: input.tags.clone(),
            changes: std::mem::take(&mut state.next_change_set_changes),
            next_token: None,
        };
        state.change_sets.insert(id.clone(), change_set);
        Ok(id)
    }

    async fn describe_change_set(
        &self,
        change_set: &ChangeSetRef,
        next_token: Option<&str>,
    ) -> ProviderResult<Option<RemoteChangeSet>> {
        let state = self.state.lock().unwrap();
        if let Some(f) = state.describe_change_set_override.clone() {
            drop(state);
            return f(change_set, next_token);
        }
        let Some(full) = Self::find_change_set(&state, change_set) else {
            return Ok(None);
        };

        let start = next_token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
        let page_size = state.page_size;
        let mut page = full.clone();
        if start + page_size < full.changes.len() {
            page.changes = full.changes[start..start + page_size].to_vec();
            page.next_token = page_token(start + page_size);
        } else if start < full.changes.len() {
            page.changes = full.changes[start..].to_vec();
            page.next_token = None;
        } else {
            page.changes = Vec::new();
            page.next_token = None;
        }
        Ok(Some(page))
    }

    async fn execute_change_set(&self, change_set: &ChangeSetRef) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.execute_change_set_calls += 1;
        let Some(cs) = Self::find_change_set(&state, change_set) else {
            return Err(ProviderError::not_found("change set does not exist"));
        };
        let parameters = cs.parameters.clone();
        let entry = state.stacks.entry(cs.stack_name.clone()).or_insert_with(|| RemoteStack {
            stack_id: cs.stack_id.clone(),
            stack_name: cs.stack_name.clone(),
            ..Default::default()
        });
        entry.stack_status = if entry.stack_status.is_empty() {
            "CREATE_COMPLETE".to_string()
        } else {
            "UPDATE_COMPLETE".to_string()
        };
        entry.parameters = parameters;
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_stack_calls += 1;
        state.stacks.remove(name);
        Ok(())
    }

    async fn caller_identity(&self) -> ProviderResult<CallerIdentity> {
        Ok(CallerIdentity {
            account: MOCK_ACCOUNT.to_string(),
            arn: MOCK_CALLER_ARN.to_string(),
            region: MOCK_REGION.to_string(),
        })
    }
}

#[derive(Default)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    etag: String,
    version_id: String,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<(String, String), StoredObject>,
    version_seq: u64,
    put_calls: usize,
}

/// In-memory object store with put counting.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_calls(&self) -> usize {
        self.state.lock().unwrap().put_calls
    }

    pub fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.state.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn meta_of(object: &StoredObject) -> ObjectMeta {
    ObjectMeta {
        etag: object.etag.clone(),
        version_id: Some(object.version_id.clone()),
        content_type: object.content_type.clone(),
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> ProviderResult<ObjectMeta> {
        let mut state = self.state.lock().unwrap();
        state.put_calls += 1;
        state.version_seq += 1;
        let object = StoredObject {
            body: body.to_vec(),
            content_type: content_type.to_string(),
            // The store reports quoted md5 etags, like the real thing.
            etag: format!("\"{:x}\"", Md5::digest(body)),
            version_id: format!("v{}", state.version_seq),
        };
        let meta = meta_of(&object);
        state.objects.insert((bucket.to_string(), key.to_string()), object);
        Ok(meta)
    }

    async fn head(&self, bucket: &str, key: &str) -> ProviderResult<Option<ObjectMeta>> {
        let state = self.state.lock().unwrap();
        Ok(state.objects.get(&(bucket.to_string(), key.to_string())).map(meta_of))
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        _version_id: Option<&str>,
    ) -> ProviderResult<(Vec<u8>, ObjectMeta)> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&(bucket.to_string(), key.to_string())) {
            Some(object) => Ok((object.body.clone(), meta_of(object))),
            None => Err(ProviderError::not_found(format!("object '{bucket}/{key}' not found"))),
        }
    }
}
