//! Per-transaction state.
//!
//! One `TxnContext` exists per outermost `with_transaction` call and owns
//! the checked-out session for its whole lifetime. Nested calls share it
//! through the ambient store and stack savepoint frames on it. All state is
//! behind a mutex that is only held for bookkeeping, never across a
//! database round-trip.

use crate::executor::MedbayExecutor;
use crate::isolation::IsolationLevel;
use crate::outcome::MedbayError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Hook queued by `post_commit`, run after the outermost commit.
pub(crate) type PostCommitHook = Box<dyn FnOnce() -> Result<(), MedbayError> + Send>;

/// An open savepoint.
#[derive(Debug)]
pub(crate) struct SavepointFrame {
    pub name: String,
    /// Post-commit queue length when this frame opened; entries at or after
    /// this index were registered inside the frame (or its children).
    pub pc_start: usize,
}

struct TxnState {
    depth: u32,
    /// Savepoint name counter. Only ever increments; names are not reused
    /// within a transaction even after release.
    savepoint_seq: u32,
    frames: Vec<SavepointFrame>,
    post_commit: Vec<PostCommitHook>,
    aborted: bool,
}

pub(crate) struct TxnContext {
    id: Uuid,
    session: Arc<dyn MedbayExecutor>,
    isolation: IsolationLevel,
    state: Mutex<TxnState>,
}

impl TxnContext {
    pub fn new(session: Arc<dyn MedbayExecutor>, isolation: IsolationLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            isolation,
            state: Mutex::new(TxnState {
                depth: 1,
                savepoint_seq: 0,
                frames: Vec::new(),
                post_commit: Vec::new(),
                aborted: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TxnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn session(&self) -> &dyn MedbayExecutor {
        self.session.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.state().depth
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    pub fn mark_aborted(&self) {
        self.state().aborted = true;
    }

    /// Run a statement against the owned session.
    ///
    /// Fails fast once the context is aborted; any session error marks the
    /// context aborted (the engine has aborted the enclosing block).
    pub fn run<R>(
        &self,
        op: impl FnOnce(&dyn MedbayExecutor) -> Result<R, MedbayError>,
    ) -> Result<R, MedbayError> {
        if self.is_aborted() {
            return Err(MedbayError::transaction_aborted());
        }
        op(self.session.as_ref()).map_err(|e| {
            self.mark_aborted();
            e
        })
    }

    /// Allocate the next savepoint name and capture the current post-commit
    /// watermark. The frame is pushed only after the `SAVEPOINT` statement
    /// succeeds.
    pub fn next_savepoint(&self) -> (String, usize) {
        let mut st = self.state();
        st.savepoint_seq += 1;
        (format!("sp{}", st.savepoint_seq), st.post_commit.len())
    }

    pub fn push_frame(&self, name: String, pc_start: usize) {
        let mut st = self.state();
        st.frames.push(SavepointFrame { name, pc_start });
        st.depth += 1;
    }

    pub fn pop_frame(&self) -> Option<SavepointFrame> {
        let mut st = self.state();
        let frame = st.frames.pop();
        if frame.is_some() {
            st.depth -= 1;
        }
        frame
    }

    pub fn enqueue_post_commit(&self, hook: PostCommitHook) {
        self.state().post_commit.push(hook);
    }

    /// Discard hooks registered at or after the given watermark (a rolled
    /// back frame and everything nested inside it).
    pub fn truncate_post_commit(&self, len: usize) {
        self.state().post_commit.truncate(len);
    }

    pub fn take_post_commit(&self) -> Vec<PostCommitHook> {
        std::mem::take(&mut self.state().post_commit)
    }

    pub fn clear_post_commit(&self) {
        self.state().post_commit.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingConn;

    fn context() -> TxnContext {
        TxnContext::new(Arc::new(RecordingConn::new()), IsolationLevel::ReadCommitted)
    }

    #[test]
    fn savepoint_names_increment_and_never_repeat() {
        let cx = context();
        let (a, _) = cx.next_savepoint();
        let (b, _) = cx.next_savepoint();
        let (c, _) = cx.next_savepoint();
        assert_eq!(a, "sp1");
        assert_eq!(b, "sp2");
        assert_eq!(c, "sp3");
    }

    #[test]
    fn frames_track_depth_lifo() {
        let cx = context();
        assert_eq!(cx.depth(), 1);
        cx.push_frame("sp1".into(), 0);
        cx.push_frame("sp2".into(), 0);
        assert_eq!(cx.depth(), 3);
        assert_eq!(cx.pop_frame().unwrap().name, "sp2");
        assert_eq!(cx.pop_frame().unwrap().name, "sp1");
        assert_eq!(cx.depth(), 1);
        assert!(cx.pop_frame().is_none());
    }

    #[test]
    fn run_fails_fast_once_aborted() {
        let cx = context();
        cx.mark_aborted();
        let err = cx.run(|s| s.execute("SELECT 1", &[])).unwrap_err();
        assert!(matches!(err, MedbayError::TransactionAborted(_)));
    }

    #[test]
    fn run_marks_aborted_on_session_error() {
        let conn = Arc::new(RecordingConn::new());
        conn.fail_next_matching("boom", MedbayError::internal_code("db-error", "boom"));
        let cx = TxnContext::new(conn, IsolationLevel::ReadCommitted);
        assert!(cx.run(|s| s.execute("boom", &[])).is_err());
        assert!(cx.is_aborted());
    }

    #[test]
    fn post_commit_watermark_truncation() {
        let cx = context();
        cx.enqueue_post_commit(Box::new(|| Ok(())));
        let (_, watermark) = cx.next_savepoint();
        cx.enqueue_post_commit(Box::new(|| Ok(())));
        cx.enqueue_post_commit(Box::new(|| Ok(())));
        cx.truncate_post_commit(watermark);
        assert_eq!(cx.take_post_commit().len(), 1);
    }
}
