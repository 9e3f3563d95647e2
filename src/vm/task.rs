use std::sync::Arc;
use std::time::Instant;
use parking_lot::Mutex;
use tracing::debug;
use crate::entity::{Entity, Exception};
use crate::heap::ObjectReference;
use crate::vm::{LockTable, ThreadState, VMResult, VMThread};

/// Scheduling state of a task after a call to `execute_task`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Runnable,
    /// Waiting for a monitor held by another thread
    Blocked(ObjectReference),
    /// Waiting for a future to resolve
    Waiting,
    Sleeping(Instant),
    Complete(Entity),
    Failed(Exception),
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Complete(_) | TaskState::Failed(_))
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Ready(Entity),
    Failed(Exception),
}

/// Result cell shared between an async task and the `Future` object that
/// observes it.
#[derive(Debug)]
pub struct FutureSlot {
    outcome: Mutex<Outcome>,
}

impl FutureSlot {
    pub fn new() -> Self {
        Self {
            outcome: Mutex::new(Outcome::Pending),
        }
    }

    /// Settle the slot. Later calls are ignored.
    pub fn resolve(&self, result: Result<Entity, Exception>) {
        let mut outcome = self.outcome.lock();
        if matches!(*outcome, Outcome::Pending) {
            *outcome = match result {
                Ok(value) => Outcome::Ready(value),
                Err(exception) => Outcome::Failed(exception),
            };
        }
    }

    /// Resolved value, if any
    pub fn value(&self) -> Option<Entity> {
        match &*self.outcome.lock() {
            Outcome::Ready(value) => Some(*value),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<Result<Entity, Exception>> {
        match &*self.outcome.lock() {
            Outcome::Pending => None,
            Outcome::Ready(value) => Some(Ok(*value)),
            Outcome::Failed(exception) => Some(Err(exception.clone())),
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.outcome.lock(), Outcome::Pending)
    }
}

impl Default for FutureSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of scheduled work: one VM thread inside one process.
#[derive(Debug)]
pub struct Task {
    pub id: u64,
    pub process_id: u32,
    pub thread: VMThread,
    pub state: TaskState,
    /// Resolved when the task finishes; set for async calls
    pub future: Option<Arc<FutureSlot>>,
    /// Future the task is suspended on
    pub awaiting: Option<Arc<FutureSlot>>,
    /// Instructions executed so far
    pub steps: u64,
}

impl Task {
    pub fn new(id: u64, process_id: u32) -> Self {
        Self {
            id,
            process_id,
            thread: VMThread::new(id),
            state: TaskState::Runnable,
            future: None,
            awaiting: None,
            steps: 0,
        }
    }

    pub fn with_future(mut self, future: Arc<FutureSlot>) -> Self {
        self.future = Some(future);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Objects the task can still reach: every frame plus the monitors it holds
    pub fn roots(&self) -> Vec<ObjectReference> {
        let mut roots: Vec<ObjectReference> =
            self.thread.contexts().iter().flat_map(|context| context.roots()).collect();
        roots.extend(self.thread.held_locks());
        roots
    }

    /// Record the final state and settle the task's future.
    pub fn finish(&mut self, state: TaskState) {
        if let Some(future) = &self.future {
            match &state {
                TaskState::Complete(value) => future.resolve(Ok(*value)),
                TaskState::Failed(exception) => future.resolve(Err(exception.clone())),
                _ => {}
            }
        }
        debug!(task = self.id, process = self.process_id, state = ?state, "Task finished");
        self.state = state;
    }

    /// Crash-stop: drop the call stack, give back every lock and fail the task.
    pub fn cancel(&mut self, locks: &LockTable) -> VMResult<()> {
        self.thread.clear_contexts();
        self.thread.release_all_locks(locks)?;
        if self.thread.state() != ThreadState::Terminated {
            self.thread.transition(ThreadState::Runnable)?;
            self.thread.terminate(locks)?;
        }
        self.awaiting = None;
        self.finish(TaskState::Failed(Exception::new("Task cancelled")));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_resolves_once() {
        let slot = FutureSlot::new();
        assert!(!slot.is_ready());
        assert_eq!(slot.outcome(), None);
        slot.resolve(Ok(Entity::int(3)));
        slot.resolve(Ok(Entity::int(4)));
        assert!(slot.is_ready());
        assert_eq!(slot.value(), Some(Entity::int(3)));
    }

    #[test]
    fn test_failed_future_has_no_value() {
        let slot = FutureSlot::new();
        slot.resolve(Err(Exception::new("boom")));
        assert!(slot.is_ready());
        assert_eq!(slot.value(), None);
        assert_eq!(slot.outcome(), Some(Err(Exception::new("boom"))));
    }

    #[test]
    fn test_finish_settles_future() {
        let slot = Arc::new(FutureSlot::new());
        let mut task = Task::new(1, 1).with_future(slot.clone());
        task.finish(TaskState::Complete(Entity::int(9)));
        assert!(task.is_finished());
        assert_eq!(slot.value(), Some(Entity::int(9)));
    }

    #[test]
    fn test_cancel_releases_locks() {
        let locks = LockTable::new();
        let obj = ObjectReference::new(1, 1);
        let slot = Arc::new(FutureSlot::new());
        let mut task = Task::new(4, 1).with_future(slot.clone());
        task.thread.transition(ThreadState::Runnable).unwrap();
        task.thread.transition(ThreadState::Blocked).unwrap();
        assert!(locks.try_acquire(obj, 4));
        task.thread.record_lock(obj);

        task.cancel(&locks).unwrap();
        assert_eq!(locks.held_by(4), 0);
        assert_eq!(task.thread.state(), ThreadState::Terminated);
        assert_eq!(task.thread.depth(), 0);
        assert!(matches!(&task.state, TaskState::Failed(e) if e.message == "Task cancelled"));
        assert!(matches!(slot.outcome(), Some(Err(_))));
    }
}
