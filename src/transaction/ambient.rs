//! Ambient discovery of the live transaction context.
//!
//! The context is keyed by the current cooperative task: `may` coroutine
//! local storage, falling back to thread-local storage when called outside
//! a coroutine (tests, startup code). Nested `with_transaction` calls find
//! the outer context here instead of threading it through every signature;
//! a coroutine spawned from inside a transaction starts with no context and
//! gets its own connection.

use super::context::TxnContext;
use std::cell::RefCell;
use std::sync::Arc;

may::coroutine_local!(static ACTIVE_TXN: RefCell<Option<Arc<TxnContext>>> = RefCell::new(None));

/// The transaction context of the current task, if one is live.
pub(crate) fn current() -> Option<Arc<TxnContext>> {
    ACTIVE_TXN.with(|cell| cell.borrow().clone())
}

/// Install the context for the current task.
pub(crate) fn enter(cx: Arc<TxnContext>) {
    ACTIVE_TXN.with(|cell| {
        let prev = cell.borrow_mut().replace(cx);
        debug_assert!(
            prev.is_none(),
            "a transaction context was already installed for this task"
        );
    });
}

/// Remove the context for the current task.
pub(crate) fn exit() {
    ACTIVE_TXN.with(|cell| {
        cell.borrow_mut().take();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::IsolationLevel;
    use crate::test_helpers::RecordingConn;
    use std::sync::mpsc;

    fn context() -> Arc<TxnContext> {
        Arc::new(TxnContext::new(
            Arc::new(RecordingConn::new()),
            IsolationLevel::ReadCommitted,
        ))
    }

    #[test]
    fn empty_by_default() {
        assert!(current().is_none());
    }

    #[test]
    fn enter_exit_roundtrip() {
        let cx = context();
        enter(Arc::clone(&cx));
        let found = current().expect("context should be discoverable");
        assert_eq!(found.id(), cx.id());
        exit();
        assert!(current().is_none());
    }

    #[test]
    fn other_tasks_do_not_see_this_context() {
        let cx = context();
        enter(cx);

        let (tx, rx) = mpsc::channel();
        may::go!(move || {
            let _ = tx.send(current().is_none());
        });
        let isolated = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("coroutine should report");
        assert!(isolated, "a fresh coroutine must start with no context");

        exit();
    }
}
