//! Remote-resource controllers.
//!
//! Each controller wraps one remote resource (a stack, its event tail, a
//! change set) behind a long-polling state machine. Polling loops share the
//! same shape: a callback deciding whether to poll again, a closer to cancel
//! the loop, and options to close that closer when the loop ends.

pub mod change_set;
pub mod events;
pub mod stack;

use std::time::Duration;

use crate::closer::Closer;
use crate::error::Result;

pub use change_set::{
    ChangeDetail, ChangeSetController, ChangeSetData, ChangeTarget, ResourceChange,
    CHANGE_SET_STATUS_NOT_FOUND, NO_CHANGES_STATUS_REASON,
};
pub use events::{StackEventData, StackEvents, STACK_RESOURCE_TYPE};
pub use stack::{StackController, StackData, STACK_STATUS_NOT_FOUND};

/// Interval between polls of the remote API.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Callback invoked with each fresh snapshot; returns whether the loop
/// should poll again.
pub type WaitCallback<T> = Box<dyn FnMut(&T) -> Result<bool> + Send>;

/// Configuration for a controller's `wait` loop.
pub struct WaitConfig<T> {
    /// Called for each update. Returning `Ok(false)` or an error stops the
    /// loop.
    pub callback: WaitCallback<T>,

    /// Closing this closer stops the loop within one poll interval.
    pub closer: Closer,

    /// Close the closer with no error when the loop ends normally.
    pub close_on_end: bool,

    /// Close the closer with the error when the loop fails.
    pub close_on_error: bool,
}

/// Apply the close-on-end / close-on-error contract when a wait loop
/// finishes.
pub(crate) fn finish_wait(
    result: Result<()>,
    closer: &Closer,
    close_on_end: bool,
    close_on_error: bool,
) {
    match result {
        Err(err) => {
            if close_on_error {
                closer.close(Some(err));
            } else if close_on_end {
                closer.close(None);
            }
        }
        Ok(()) => {
            if close_on_end {
                closer.close(None);
            }
        }
    }
}
