use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use crate::entity::{Entity, Function, Module};
use crate::heap::{Heap, ObjectReference, StandardHeap};
use crate::vm::{Context, FutureSlot, LockTable, Task, VMError, VMResult};

/// Where `PRNT` output goes
#[derive(Debug)]
enum Output {
    Stdout,
    Captured(Mutex<String>),
}

/// A heap-isolation unit. Every task of a process shares its heap and
/// monitors; nothing on the heap is visible to other processes.
pub struct Process {
    id: u32,
    heap: Arc<dyn Heap>,
    locks: LockTable,
    /// Tasks spawned by running code and not yet picked up by a scheduler
    spawned: Mutex<VecDeque<Task>>,
    output: Output,
    next_task_id: AtomicU64,
}

impl Process {
    pub fn new(id: u32, heap_capacity: usize, capture_output: bool) -> Self {
        Self {
            id,
            heap: Arc::new(StandardHeap::with_capacity(id, heap_capacity)),
            locks: LockTable::new(),
            spawned: Mutex::new(VecDeque::new()),
            output: if capture_output {
                Output::Captured(Mutex::new(String::new()))
            } else {
                Output::Stdout
            },
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn heap(&self) -> &Arc<dyn Heap> {
        &self.heap
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn new_task(&self) -> Task {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        Task::new(id, self.id)
    }

    /// Task running a module's top-level code
    pub fn spawn_module(&self, module: Arc<Module>) -> Task {
        let mut task = self.new_task();
        task.thread.push_context(Context::for_module(module));
        task
    }

    /// Task running one bytecode function with a single argument.
    pub fn spawn_call(
        &self,
        module: Arc<Module>,
        function: &Function,
        arg: Entity,
        receiver: Option<Entity>,
    ) -> VMResult<Task> {
        let entry = function
            .entry()
            .ok_or_else(|| VMError::NotCallable(format!("native function {}", function.qualified_name())))?;
        let mut task = self.new_task();
        task.thread
            .push_context(Context::call(module, function.name.clone(), entry, arg, receiver));
        Ok(task)
    }

    /// Like `spawn_call`, but the task settles a fresh future when it ends.
    pub fn spawn_async(
        &self,
        module: Arc<Module>,
        function: &Function,
        arg: Entity,
        receiver: Option<Entity>,
    ) -> VMResult<(Task, Arc<FutureSlot>)> {
        let slot = Arc::new(FutureSlot::new());
        let task = self.spawn_call(module, function, arg, receiver)?.with_future(slot.clone());
        Ok((task, slot))
    }

    /// Queue a task for the scheduler.
    pub fn spawn(&self, task: Task) {
        self.spawned.lock().push_back(task);
    }

    /// Take every task spawned since the last drain.
    pub fn drain_spawned(&self) -> Vec<Task> {
        self.spawned.lock().drain(..).collect()
    }

    /// Objects reachable from queued tasks that no scheduler has picked up yet
    pub fn queued_roots(&self) -> Vec<ObjectReference> {
        self.spawned.lock().iter().flat_map(Task::roots).collect()
    }

    pub fn print(&self, line: &str) {
        match &self.output {
            Output::Stdout => println!("{}", line),
            Output::Captured(buffer) => {
                let mut buffer = buffer.lock();
                buffer.push_str(line);
                buffer.push('\n');
            }
        }
    }

    /// Captured output so far; empty when printing to stdout.
    pub fn take_output(&self) -> String {
        match &self.output {
            Output::Stdout => String::new(),
            Output::Captured(buffer) => std::mem::take(&mut *buffer.lock()),
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("objects", &self.heap.object_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, Op, Tape};
    use crate::entity::FunctionFlags;
    use crate::utils::KeyedList;

    fn module() -> Arc<Module> {
        let mut tape = Tape::new();
        tape.append(Instruction::new(Op::Ret));
        Arc::new(Module {
            name: "main".into(),
            classes: KeyedList::new(),
            functions: KeyedList::new(),
            tape: Arc::new(tape),
        })
    }

    #[test]
    fn test_process_owns_heap_with_its_id() {
        let process = Process::new(3, 0, true);
        assert_eq!(process.heap().id(), 3);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let process = Process::new(1, 0, true);
        let a = process.spawn_module(module());
        let b = process.spawn_module(module());
        assert_ne!(a.id, b.id);
        assert_eq!(a.process_id, 1);
        assert_eq!(a.thread.depth(), 1);
    }

    #[test]
    fn test_spawn_queue() {
        let process = Process::new(1, 0, true);
        let function = Function::bytecode("f".into(), "main".into(), None, 0, FunctionFlags::ASYNC);
        let (task, slot) = process.spawn_async(module(), &function, Entity::int(1), None).unwrap();
        assert!(task.future.is_some());
        assert!(!slot.is_ready());
        process.spawn(task);
        assert_eq!(process.drain_spawned().len(), 1);
        assert!(process.drain_spawned().is_empty());
    }

    #[test]
    fn test_queued_tasks_report_their_roots() {
        let process = Process::new(1, 0, true);
        let function = Function::bytecode("f".into(), "main".into(), None, 0, FunctionFlags::BACKGROUND);
        let arg = ObjectReference::new(1, 7);
        let task = process.spawn_call(module(), &function, Entity::Object(arg), None).unwrap();
        process.spawn(task);
        assert_eq!(process.queued_roots(), vec![arg]);

        process.drain_spawned();
        assert!(process.queued_roots().is_empty());
    }

    #[test]
    fn test_captured_output() {
        let process = Process::new(1, 0, true);
        process.print("hello");
        process.print("world");
        assert_eq!(process.take_output(), "hello\nworld\n");
        assert_eq!(process.take_output(), "");
    }
}
