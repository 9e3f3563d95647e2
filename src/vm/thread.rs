use crate::entity::StackLine;
use crate::heap::ObjectReference;
use crate::vm::{Context, LockTable, VMError, VMResult};

/// Lifecycle of a VM thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

impl ThreadState {
    /// Whether `self -> to` is a legal transition. Staying put is always legal.
    pub fn can_transition_to(self, to: ThreadState) -> bool {
        use ThreadState::*;
        self == to
            || matches!(
                (self, to),
                (New, Runnable)
                    | (Runnable, Blocked)
                    | (Runnable, Waiting)
                    | (Runnable, TimedWaiting)
                    | (Runnable, Terminated)
                    | (Blocked, Runnable)
                    | (Waiting, Runnable)
                    | (TimedWaiting, Runnable)
            )
    }

    pub fn is_suspended(self) -> bool {
        matches!(self, ThreadState::Blocked | ThreadState::Waiting | ThreadState::TimedWaiting)
    }
}

/// A thread of execution: its call stack and the monitors it holds.
///
/// Each held lock is tagged with the depth of the frame that took it, so
/// unwinding a frame can give back exactly that frame's locks.
#[derive(Debug)]
pub struct VMThread {
    id: u64,
    state: ThreadState,
    contexts: Vec<Context>,
    locks: Vec<(ObjectReference, usize)>,
}

impl VMThread {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: ThreadState::New,
            contexts: Vec::new(),
            locks: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn transition(&mut self, to: ThreadState) -> VMResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(VMError::IllegalTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    pub fn push_context(&mut self, context: Context) {
        self.contexts.push(context);
    }

    pub fn pop_context(&mut self) -> Option<Context> {
        self.contexts.pop()
    }

    pub fn current(&self) -> Option<&Context> {
        self.contexts.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Context> {
        self.contexts.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.contexts.len()
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Drop every frame. Locks are left alone.
    pub fn clear_contexts(&mut self) {
        self.contexts.clear();
    }

    /// Remember a successful acquisition by the current frame.
    pub fn record_lock(&mut self, obj: ObjectReference) {
        let depth = self.contexts.len();
        self.locks.push((obj, depth));
    }

    /// Forget the most recent acquisition of `obj`. Returns false if the
    /// thread never recorded one.
    pub fn forget_lock(&mut self, obj: ObjectReference) -> bool {
        match self.locks.iter().rposition(|(held, _)| *held == obj) {
            Some(index) => {
                self.locks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn held_locks(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        self.locks.iter().map(|(obj, _)| *obj)
    }

    /// Release the locks taken by frames deeper than `depth`.
    pub fn release_frame_locks(&mut self, table: &LockTable, depth: usize) -> VMResult<()> {
        while let Some(&(obj, frame)) = self.locks.last() {
            if frame <= depth {
                break;
            }
            self.locks.pop();
            table.release(obj, self.id)?;
        }
        Ok(())
    }

    /// Hand the locks of frames deeper than `depth` to the frame at `depth`.
    /// Used on return so a callee's locks stay held by its caller.
    pub fn adopt_frame_locks(&mut self, depth: usize) {
        for (_, frame) in self.locks.iter_mut() {
            if *frame > depth {
                *frame = depth;
            }
        }
    }

    pub fn release_all_locks(&mut self, table: &LockTable) -> VMResult<()> {
        self.release_frame_locks(table, 0)?;
        // Locks recorded with no frame on the stack.
        for (obj, _) in self.locks.drain(..) {
            table.release(obj, self.id)?;
        }
        Ok(())
    }

    /// Finish the thread. Only legal from `Runnable`; afterwards the thread
    /// holds no locks.
    pub fn terminate(&mut self, table: &LockTable) -> VMResult<()> {
        if !self.state.can_transition_to(ThreadState::Terminated) {
            return Err(VMError::IllegalTransition { from: self.state, to: ThreadState::Terminated });
        }
        self.release_all_locks(table)?;
        self.state = ThreadState::Terminated;
        Ok(())
    }

    /// One line per active frame, innermost first.
    pub fn stacktrace(&self) -> Vec<StackLine> {
        self.contexts.iter().rev().map(Context::stack_line).collect()
    }
}
