//! Hierarchical one-shot cancellation.
//!
//! A [`Closer`] is a broadcast signal used to cancel groups of tasks. It can
//! be closed once, keeps the first error it was closed with, and closes every
//! registered child when it fires. Polling loops select on [`Closer::closed`]
//! to terminate deterministically.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// A one-shot cancellation signal carrying an optional error.
///
/// Cloning a `Closer` yields another handle to the same signal.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Mutex<Shared>,
    notify: Notify,
}

#[derive(Default)]
struct Shared {
    closed: bool,
    err: Option<Error>,
    children: Vec<Closer>,
}

impl Closer {
    /// Create a new open closer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner { shared: Mutex::new(Shared::default()), notify: Notify::new() }),
        }
    }

    /// Close the closer, releasing all waiters and closing every registered
    /// child with the same error.
    ///
    /// `close` is idempotent: only the first call's error is kept and later
    /// calls are no-ops. Children are closed outside the lock so a child
    /// shared between multiple parents cannot deadlock propagation.
    pub fn close(&self, err: Option<Error>) {
        let children = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.err = err.clone();
            std::mem::take(&mut shared.children)
        };
        self.inner.notify.notify_waiters();
        for child in children {
            child.close(err.clone());
        }
    }

    /// Whether the closer has fired.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().unwrap().closed
    }

    /// The error captured by the first `close` call, if any.
    pub fn err(&self) -> Option<Error> {
        self.inner.shared.lock().unwrap().err.clone()
    }

    /// Resolves once the closer fires. Reading a closed signal always
    /// succeeds immediately.
    pub async fn closed(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // close between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Block until the closer fires and return the captured error.
    pub async fn wait(&self) -> Result<()> {
        self.closed().await;
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create a new closer registered as a child of this one.
    pub fn child(&self) -> Closer {
        let child = Closer::new();
        self.add_child(&child);
        child
    }

    /// Register `child` to be closed when this closer closes.
    ///
    /// Adding a child to an already-closed parent closes it immediately.
    /// Registering the same child twice, or a closer as its own child, is a
    /// no-op.
    pub fn add_child(&self, child: &Closer) {
        if Arc::ptr_eq(&self.inner, &child.inner) {
            return;
        }
        let close_now = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.closed {
                Some(shared.err.clone())
            } else {
                if !shared.children.iter().any(|c| Arc::ptr_eq(&c.inner, &child.inner)) {
                    shared.children.push(child.clone());
                }
                None
            }
        };
        if let Some(err) = close_now {
            child.close(err);
        }
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_keeps_first_error() {
        let closer = Closer::new();
        closer.close(Some(Error::other("first")));
        closer.close(Some(Error::other("second")));

        let err = closer.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn test_close_with_none_is_success() {
        let closer = Closer::new();
        closer.close(None);
        assert!(closer.wait().await.is_ok());
        // A closed signal stays readable.
        closer.closed().await;
    }

    #[tokio::test]
    async fn test_wait_releases_on_close() {
        let closer = Closer::new();
        let waiter = {
            let closer = closer.clone();
            tokio::spawn(async move { closer.wait().await })
        };
        closer.close(Some(Error::other("stop")));
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "stop");
    }

    #[tokio::test]
    async fn test_parent_close_propagates_to_children() {
        let parent = Closer::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.close(Some(Error::other("down")));

        assert_eq!(child.wait().await.unwrap_err().to_string(), "down");
        assert_eq!(grandchild.wait().await.unwrap_err().to_string(), "down");
    }

    #[tokio::test]
    async fn test_child_of_closed_parent_closes_immediately() {
        let parent = Closer::new();
        parent.close(Some(Error::other("gone")));

        let child = parent.child();
        assert!(child.is_closed());
        assert_eq!(child.err().unwrap().to_string(), "gone");
    }

    #[tokio::test]
    async fn test_closed_child_keeps_own_error() {
        let parent = Closer::new();
        let child = parent.child();
        child.close(Some(Error::other("mine")));
        parent.close(Some(Error::other("parents")));

        assert_eq!(child.err().unwrap().to_string(), "mine");
    }

    #[tokio::test]
    async fn test_duplicate_and_self_registration() {
        let parent = Closer::new();
        let child = Closer::new();
        parent.add_child(&child);
        parent.add_child(&child);
        parent.add_child(&parent);

        assert_eq!(parent.inner.shared.lock().unwrap().children.len(), 1);

        parent.close(None);
        assert!(child.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_close_keeps_one_error() {
        let closer = Closer::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let closer = closer.clone();
            handles.push(tokio::spawn(async move {
                closer.close(Some(Error::other(format!("err{i}"))));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let err = closer.err().unwrap().to_string();
        assert!(err.starts_with("err"));
        // Every later close was a no-op; the stored error never changes.
        assert_eq!(closer.err().unwrap().to_string(), err);
    }
}
