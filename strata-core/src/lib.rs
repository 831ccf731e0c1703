//! strata core library
//!
//! Declarative management of a fleet of CloudFormation stacks through the
//! change-set lifecycle: plan, review, apply. The stack manager renders
//! templated inputs with cross-stack references, drives long-polling
//! controllers for stacks, change sets and event streams, and reports
//! progress through a single event callback.

pub mod artifact;
pub mod closer;
pub mod config;
pub mod error;
pub mod manager;
pub mod plan;
pub mod provider;
pub mod remote;
pub mod template;

// Re-export commonly used items
pub use closer::Closer;
pub use config::{Config, FileConfig, StackConfig};
pub use error::{Error, Result};
pub use manager::{Event, StackInfo, StackManager, VerifyFn};
pub use plan::{DiffString, DiffStringMap, Plan};
pub use remote::{
    ChangeSetData, ResourceChange, StackData, StackEventData, CHANGE_SET_STATUS_NOT_FOUND,
    STACK_STATUS_NOT_FOUND,
};
