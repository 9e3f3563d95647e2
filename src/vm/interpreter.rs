use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};
use crate::bytecode::{Instruction, Op, Operand};
use crate::entity::{
    Class, Entity, Exception, Function, FunctionBody, FunctionRef, Module, NativeCall, NativeObject, Primitive,
    StackLine,
};
use crate::heap::{deep_copy, render_entity, Heap, HeapExt, ObjectReference};
use crate::runtime::RuntimeConfig;
use crate::vm::module_manager::BUILTIN_MODULE;
use crate::vm::{
    Context, FutureSlot, LoadError, ModuleManager, Process, ReturnMode, Task, TaskState, ThreadState, VMError,
    VMResult,
};

/// What the dispatch loop does after one instruction
#[derive(Debug)]
enum Flow {
    Continue,
    Suspend(TaskState),
    Finished(Entity),
}

/// Payload a `GET` may fall back on when an object has no such member
enum Described {
    Module(Arc<Module>),
    Class(Arc<Class>),
    Nothing,
}

/// The Virtual Machine: module manager, processes and the engine that runs
/// their tasks.
pub struct VM {
    modules: Arc<ModuleManager>,
    processes: DashMap<u32, Arc<Process>>,
    main_process: Arc<Process>,
    next_process_id: AtomicU32,
    config: RuntimeConfig,
}

impl VM {
    pub fn new() -> VMResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> VMResult<Self> {
        let modules = Arc::new(ModuleManager::new()?);
        let main_process = Arc::new(Process::new(1, config.heap_capacity, config.capture_output));
        let processes = DashMap::new();
        processes.insert(main_process.id(), main_process.clone());
        info!(process = main_process.id(), "Created main process");
        Ok(Self {
            modules,
            processes,
            main_process,
            next_process_id: AtomicU32::new(2),
            config,
        })
    }

    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn main_process(&self) -> Arc<Process> {
        self.main_process.clone()
    }

    pub fn create_process(&self) -> Arc<Process> {
        let id = self.next_process_id.fetch_add(1, AtomicOrdering::Relaxed);
        let process = Arc::new(Process::new(id, self.config.heap_capacity, self.config.capture_output));
        self.processes.insert(id, process.clone());
        info!(process = id, "Created process");
        process
    }

    pub fn process(&self, id: u32) -> VMResult<Arc<Process>> {
        self.processes
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(VMError::ProcessNotFound(id))
    }

    /// Drop a process and the reflection objects cached for its heap.
    pub fn destroy_process(&self, id: u32) -> VMResult<()> {
        self.processes.remove(&id).ok_or(VMError::ProcessNotFound(id))?;
        self.modules.forget_heap(id);
        info!(process = id, "Destroyed process");
        Ok(())
    }

    /// Drop every process. The VM is unusable afterwards.
    pub fn shutdown(&self) {
        let ids: Vec<u32> = self.processes.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.processes.remove(&id);
            self.modules.forget_heap(id);
        }
        info!("VM shut down");
    }

    /// Task that runs `function` with one argument on `process`.
    pub fn spawn_function(&self, process: &Process, function: &Function, arg: Entity) -> VMResult<Task> {
        let module = self.modules.module(&function.module)?;
        process.spawn_call(module, function, arg, None)
    }

    /// Deep-copy `value` from one process's heap into another's.
    pub fn transfer(&self, value: Entity, from: u32, to: u32) -> VMResult<Entity> {
        let source = self.process(from)?;
        let target = self.process(to)?;
        deep_copy(source.heap().as_ref(), target.heap().as_ref(), value, self.modules.as_ref())
    }

    /// Collect a process's heap. Values held by `live` tasks and by tasks
    /// still queued on the process survive.
    pub fn collect(&self, process_id: u32, live: &[&Task]) -> VMResult<usize> {
        let process = self.process(process_id)?;
        let mut roots = process.queued_roots();
        for task in live {
            roots.extend(task.roots());
        }
        Ok(process.heap().collect(&roots)?)
    }

    /// Run `task` until it finishes, suspends or uses up its time slice.
    pub fn execute_task(&self, task: &mut Task) -> TaskState {
        if task.is_finished() {
            return task.state.clone();
        }
        let process = match self.process(task.process_id) {
            Ok(process) => process,
            Err(err) => {
                task.finish(TaskState::Failed(Exception::new(err.to_string())));
                return task.state.clone();
            }
        };
        match self.resume(task) {
            Ok(None) => {}
            Ok(Some(state)) => return state,
            Err(err) => return self.fail(&process, task, Exception::new(err.to_string())),
        }

        let mut executed = 0usize;
        loop {
            if self.config.time_slice.map_or(false, |limit| executed >= limit) {
                return task.state.clone();
            }
            let outcome = match self.step(&process, task) {
                Err(err) if !err.is_fatal() && !matches!(err, VMError::Uncaught(_)) => {
                    self.raise_error(&process, task, err)
                }
                other => other,
            };
            match outcome {
                Ok(Flow::Continue) => {
                    executed += 1;
                    task.steps += 1;
                }
                Ok(Flow::Suspend(state)) => {
                    debug!(task = task.id, process = process.id(), state = ?state, "Task suspended");
                    task.state = state.clone();
                    return state;
                }
                Ok(Flow::Finished(value)) => {
                    task.steps += 1;
                    return self.complete(&process, task, value);
                }
                Err(VMError::Uncaught(exception)) => return self.fail(&process, task, exception),
                Err(err) => {
                    let exception = Exception::new(err.to_string()).with_stacktrace(task.thread.stacktrace());
                    return self.fail(&process, task, exception);
                }
            }
        }
    }

    /// Wake a suspended task if whatever it waits on is done. Returns the
    /// state to report when it must stay suspended.
    fn resume(&self, task: &mut Task) -> VMResult<Option<TaskState>> {
        match task.thread.state() {
            // A blocked task retries its LOCK instruction.
            ThreadState::New | ThreadState::Blocked => task.thread.transition(ThreadState::Runnable)?,
            ThreadState::Runnable => {}
            ThreadState::Waiting => {
                if task.awaiting.as_ref().map_or(false, |slot| !slot.is_ready()) {
                    return Ok(Some(task.state.clone()));
                }
                task.awaiting = None;
                task.thread.transition(ThreadState::Runnable)?;
            }
            ThreadState::TimedWaiting => {
                if let TaskState::Sleeping(wake_at) = task.state {
                    if Instant::now() < wake_at {
                        return Ok(Some(task.state.clone()));
                    }
                }
                task.thread.transition(ThreadState::Runnable)?;
            }
            ThreadState::Terminated => return Ok(Some(task.state.clone())),
        }
        if task.state != TaskState::Runnable {
            debug!(task = task.id, "Task resumed");
        }
        task.state = TaskState::Runnable;
        Ok(None)
    }

    fn complete(&self, process: &Process, task: &mut Task, value: Entity) -> TaskState {
        task.thread.clear_contexts();
        if let Err(err) = task.thread.terminate(process.locks()) {
            return self.fail(process, task, Exception::new(err.to_string()));
        }
        task.finish(TaskState::Complete(value));
        task.state.clone()
    }

    fn fail(&self, process: &Process, task: &mut Task, exception: Exception) -> TaskState {
        warn!(task = task.id, process = process.id(), error = %exception, "Uncaught exception");
        task.thread.clear_contexts();
        if task.thread.state() != ThreadState::Terminated {
            let released = task
                .thread
                .transition(ThreadState::Runnable)
                .and_then(|_| task.thread.terminate(process.locks()));
            if let Err(err) = released {
                warn!(task = task.id, error = %err, "Failed to release thread");
            }
        }
        task.finish(TaskState::Failed(exception));
        task.state.clone()
    }

    fn step(&self, process: &Process, task: &mut Task) -> VMResult<Flow> {
        let context = match task.thread.current_mut() {
            Some(context) => context,
            None => return Ok(Flow::Finished(Entity::None)),
        };
        let index = context.pc();
        let instruction = match context.current_instruction() {
            Some(instruction) => instruction.clone(),
            // Running off the end of the tape returns like RET.
            None if context.is_at_end() => {
                let value = context.pop_or_none();
                return self.return_from(task, value);
            }
            None => return Err(VMError::InvalidProgramCounter(index as i64)),
        };
        context.set_pc(index + 1);

        if self.config.stack_trace {
            trace!(
                task = task.id,
                module = %context.module().name,
                function = %context.function(),
                pc = index,
                stack = context.stack_depth(),
                "{}",
                instruction
            );
        }
        self.dispatch(process, task, index, &instruction)
    }

    fn dispatch(&self, process: &Process, task: &mut Task, index: usize, instruction: &Instruction) -> VMResult<Flow> {
        let heap = process.heap().as_ref();
        let op = instruction.op;
        match op {
            Op::Nop => {}

            Op::Exit => {
                let value = frame(task)?.pop_or_none();
                return Ok(Flow::Finished(value));
            }

            Op::Push => {
                let value = match &instruction.operand {
                    Operand::Primitive(value) => Entity::Primitive(*value),
                    Operand::String(text) => self.new_str(heap, text.as_ref())?,
                    Operand::Identifier(name) => self.resolve(process, task, name)?,
                    Operand::None => return Err(VMError::MissingOperand(op)),
                };
                frame(task)?.push(value);
            }

            Op::Pnil => frame(task)?.push(Entity::None),

            Op::Peek => {
                let depth = int_operand_or(instruction, 0)?;
                let depth = usize::try_from(depth).map_err(|_| VMError::InvalidOperand {
                    op,
                    expected: "a non-negative depth",
                })?;
                let context = frame(task)?;
                let value = context.peek(depth)?;
                context.push(value);
            }

            Op::Dup => {
                let context = frame(task)?;
                let value = context.peek(0)?;
                context.push(value);
            }

            Op::Pop => {
                frame(task)?.pop()?;
            }

            Op::Swap => {
                let context = frame(task)?;
                let top = context.pop()?;
                let below = context.pop()?;
                context.push(top);
                context.push(below);
            }

            Op::Let => {
                let name = name_operand(instruction)?;
                let context = frame(task)?;
                let value = context.pop()?;
                context.define_local(name.clone(), value);
            }

            Op::Set => {
                let name = name_operand(instruction)?;
                let context = frame(task)?;
                let value = context.pop()?;
                context.set_local(name, value)?;
            }

            Op::Not => {
                let context = frame(task)?;
                let value = context.pop()?;
                context.push(Entity::from_bool(value.is_none()));
            }

            Op::Notc => {
                let context = frame(task)?;
                let zero = match context.pop()? {
                    Entity::None => true,
                    Entity::Primitive(value) => value.is_zero(),
                    Entity::Object(_) => false,
                };
                context.push(Entity::int(zero as i64));
            }

            Op::Gt | Op::Lt | Op::Gte | Op::Lte => {
                let (a, b) = pop_pair(task)?;
                let ordering = self.compare(heap, op, a, b)?;
                let result = match op {
                    Op::Gt => ordering == Some(Ordering::Greater),
                    Op::Lt => ordering == Some(Ordering::Less),
                    Op::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    _ => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                };
                frame(task)?.push(Entity::from_bool(result));
            }

            Op::Eq | Op::Neq => {
                let (a, b) = pop_pair(task)?;
                let equal = self.equals(heap, a, b)?;
                frame(task)?.push(Entity::from_bool(equal == (op == Op::Eq)));
            }

            Op::And | Op::Or | Op::Xor => {
                let (a, b) = pop_pair(task)?;
                let result = match op {
                    Op::And => a.is_truthy() && b.is_truthy(),
                    Op::Or => a.is_truthy() || b.is_truthy(),
                    _ => a.is_truthy() != b.is_truthy(),
                };
                frame(task)?.push(Entity::from_bool(result));
            }

            Op::If | Op::Ifn => {
                let offset = int_operand(instruction)?;
                let context = frame(task)?;
                let condition = context.pop()?;
                if condition.is_truthy() == (op == Op::If) {
                    context.jump_relative(index, offset)?;
                }
            }

            Op::Jmp => {
                let offset = int_operand(instruction)?;
                frame(task)?.jump_relative(index, offset)?;
            }

            Op::Goto => {
                let target = int_operand(instruction)?;
                frame(task)?.jump_absolute(target)?;
            }

            Op::Add => {
                let (a, b) = pop_pair(task)?;
                let result = if let (Entity::Primitive(x), Entity::Primitive(y)) = (a, b) {
                    Entity::Primitive(x.add(y))
                } else if self.is_str(heap, a)? || self.is_str(heap, b)? {
                    let text = render_entity(heap, &a)? + &render_entity(heap, &b)?;
                    self.new_str(heap, text)?
                } else {
                    return Err(VMError::TypeError(format!(
                        "cannot add {} and {}",
                        a.type_name(),
                        b.type_name()
                    )));
                };
                frame(task)?.push(result);
            }

            Op::Sub | Op::Mult | Op::Div | Op::Mod | Op::Band | Op::Bor | Op::Bxor | Op::Lshf | Op::Rshf => {
                let (a, b) = pop_pair(task)?;
                let x = primitive(op, a)?;
                let y = primitive(op, b)?;
                let result = match op {
                    Op::Sub => x.sub(y),
                    Op::Mult => x.mul(y),
                    Op::Div => x.div(y)?,
                    Op::Mod => x.rem(y)?,
                    Op::Band => x.bit_and(y)?,
                    Op::Bor => x.bit_or(y)?,
                    Op::Bxor => x.bit_xor(y)?,
                    Op::Lshf => x.shift_left(y)?,
                    _ => x.shift_right(y)?,
                };
                frame(task)?.push(Entity::Primitive(result));
            }

            Op::Neg | Op::Inc | Op::Dec | Op::Bnot => {
                let context = frame(task)?;
                let value = primitive(op, context.pop()?)?;
                let result = match op {
                    Op::Neg => value.neg(),
                    Op::Inc => value.step(1),
                    Op::Dec => value.step(-1),
                    _ => value.bit_not()?,
                };
                context.push(Entity::Primitive(result));
            }

            Op::Call => {
                let (callee, arg) = match instruction.operand.text() {
                    Some(name) => {
                        let arg = frame(task)?.pop()?;
                        (self.resolve(process, task, name)?, arg)
                    }
                    None => {
                        let context = frame(task)?;
                        let callee = context.pop()?;
                        (callee, context.pop()?)
                    }
                };
                return self.call_value(process, task, callee, arg);
            }

            Op::Clln => {
                let name = name_operand(instruction)?;
                let context = frame(task)?;
                let arg = context.pop()?;
                let receiver = context.pop()?;
                return self.call_method(process, task, receiver, name, arg);
            }

            Op::Ret => {
                let value = frame(task)?.pop_or_none();
                return self.return_from(task, value);
            }

            Op::Get => {
                let name = name_operand(instruction)?;
                let target = frame(task)?.pop()?;
                let value = self.get_member(heap, target, name)?;
                frame(task)?.push(value);
            }

            Op::Fld => {
                let name = name_operand(instruction)?;
                let context = frame(task)?;
                let value = context.pop()?;
                let target = object(op, context.pop()?)?;
                heap.write(target, |o| o.set_member(name.clone(), value))?;
            }

            Op::Is => {
                let class = match instruction.operand.text() {
                    Some(name) => self.resolve(process, task, name)?,
                    None => frame(task)?.pop()?,
                };
                let value = frame(task)?.pop()?;
                let result = self.is_instance(heap, value, class)?;
                frame(task)?.push(Entity::from_bool(result));
            }

            Op::Cls => {
                let value = frame(task)?.pop()?;
                let class = match value {
                    Entity::Object(obj) => {
                        let class = heap.get_class(obj)?;
                        Entity::Object(self.modules.reflect_class(heap, &class)?)
                    }
                    _ => Entity::None,
                };
                frame(task)?.push(class);
            }

            Op::Copy => {
                let value = frame(task)?.pop()?;
                let copy = self.shallow_copy(heap, value)?;
                frame(task)?.push(copy);
            }

            Op::Str => {
                let value = frame(task)?.pop()?;
                let text = render_entity(heap, &value)?;
                let string = self.new_str(heap, text)?;
                frame(task)?.push(string);
            }

            Op::Anew => {
                let count = int_operand_or(instruction, 0)?;
                let count = usize::try_from(count).map_err(|_| VMError::InvalidOperand {
                    op,
                    expected: "a non-negative element count",
                })?;
                let items = frame(task)?.pop_n(count)?;
                let class = self.builtin_class("Array")?;
                let array = heap.allocate_native(&class, NativeObject::Array(items))?;
                frame(task)?.push(Entity::Object(array));
            }

            Op::Aidx => {
                let (target, position) = pop_pair(task)?;
                let obj = object(op, target)?;
                let value = heap.read(obj, |o| match &o.native {
                    Some(NativeObject::Array(items)) => {
                        index_in(position, items.len()).map(|i| items[i])
                    }
                    Some(NativeObject::Str(text)) => {
                        index_in(position, text.len()).map(|i| Entity::char(text.as_bytes()[i] as i8))
                    }
                    _ => Err(VMError::TypeError(format!("{} is not indexable", o.class.qualified_name()))),
                })??;
                frame(task)?.push(value);
            }

            Op::Aset => {
                let context = frame(task)?;
                let value = context.pop()?;
                let position = context.pop()?;
                let obj = object(op, context.pop()?)?;
                heap.write(obj, |o| match o.as_array_mut() {
                    Some(items) => index_in(position, items.len()).map(|i| items[i] = value),
                    None => Err(VMError::TypeError(format!("{} is not an array", o.class.qualified_name()))),
                })??;
            }

            Op::Alen => {
                let value = frame(task)?.pop()?;
                let length = self.length(heap, value)?;
                frame(task)?.push(Entity::int(length as i64));
            }

            Op::Apsh => {
                let context = frame(task)?;
                let value = context.pop()?;
                let target = context.pop()?;
                let obj = object(op, target)?;
                heap.write(obj, |o| match o.as_array_mut() {
                    Some(items) => {
                        items.push(value);
                        Ok(())
                    }
                    None => Err(VMError::TypeError(format!("{} is not an array", o.class.qualified_name()))),
                })??;
                frame(task)?.push(target);
            }

            Op::Nlst => {
                let class = self.builtin_class("NamedList")?;
                let list = heap.allocate(&class)?;
                frame(task)?.push(Entity::Object(list));
            }

            Op::Nget => {
                let key = match instruction.operand.text() {
                    Some(key) => key.clone(),
                    None => {
                        let key = frame(task)?.pop()?;
                        self.key(heap, key)?
                    }
                };
                let target = object(op, frame(task)?.pop()?)?;
                let value = heap.read(target, |o| match o.as_named_list() {
                    Some(items) => items.get(&key).copied().ok_or_else(|| VMError::KeyNotFound(key.clone())),
                    None => Err(VMError::TypeError(format!("{} is not a named list", o.class.qualified_name()))),
                })??;
                frame(task)?.push(value);
            }

            Op::Nset => {
                let value = frame(task)?.pop()?;
                let key = match instruction.operand.text() {
                    Some(key) => key.clone(),
                    None => {
                        let key = frame(task)?.pop()?;
                        self.key(heap, key)?
                    }
                };
                let target = frame(task)?.pop()?;
                let obj = object(op, target)?;
                heap.write(obj, |o| match o.as_named_list_mut() {
                    Some(items) => {
                        items.set(key, value);
                        Ok(())
                    }
                    None => Err(VMError::TypeError(format!("{} is not a named list", o.class.qualified_name()))),
                })??;
                frame(task)?.push(target);
            }

            Op::Rais => {
                let value = frame(task)?.pop_or_none();
                return self.raise(process, task, value);
            }

            Op::Ctch => match &instruction.operand {
                Operand::None => {
                    frame(task)?.pop_handler();
                }
                _ => {
                    let target = int_operand(instruction)?;
                    let context = frame(task)?;
                    if target < 0 || target as usize > context.module().tape.len() {
                        return Err(VMError::InvalidProgramCounter(target));
                    }
                    context.push_handler(target as usize);
                }
            },

            Op::Wait => {
                let target = frame(task)?.peek(0)?;
                let slot = match target {
                    Entity::Object(obj) => heap.read(obj, |o| o.as_future().cloned())?,
                    _ => None,
                };
                // Anything that is not a future is already its own value.
                if let Some(slot) = slot {
                    match slot.outcome() {
                        Some(Ok(value)) => {
                            let context = frame(task)?;
                            context.pop()?;
                            context.push(value);
                        }
                        Some(Err(exception)) => {
                            frame(task)?.pop()?;
                            let error = self.new_error(heap, &exception.message)?;
                            return self.throw(process, task, error, exception.message, exception.stacktrace);
                        }
                        None => {
                            frame(task)?.set_pc(index);
                            task.thread.transition(ThreadState::Waiting)?;
                            task.awaiting = Some(slot);
                            return Ok(Flow::Suspend(TaskState::Waiting));
                        }
                    }
                }
            }

            Op::Slep => {
                let millis = match &instruction.operand {
                    Operand::None => {
                        let value = frame(task)?.pop()?;
                        primitive(op, value)?.as_int()
                    }
                    _ => int_operand(instruction)?,
                };
                if millis > 0 {
                    let wake_at = Instant::now() + Duration::from_millis(millis as u64);
                    task.thread.transition(ThreadState::TimedWaiting)?;
                    return Ok(Flow::Suspend(TaskState::Sleeping(wake_at)));
                }
            }

            Op::Lock => {
                let obj = object(op, frame(task)?.peek(0)?)?;
                if process.locks().try_acquire(obj, task.thread.id()) {
                    frame(task)?.pop()?;
                    task.thread.record_lock(obj);
                } else {
                    frame(task)?.set_pc(index);
                    task.thread.transition(ThreadState::Blocked)?;
                    return Ok(Flow::Suspend(TaskState::Blocked(obj)));
                }
            }

            Op::Unlk => {
                let obj = object(op, frame(task)?.pop()?)?;
                if !task.thread.forget_lock(obj) {
                    return Err(VMError::LockNotHeld(obj));
                }
                process.locks().release(obj, task.thread.id())?;
            }

            Op::Prnt => {
                let value = frame(task)?.pop()?;
                let text = render_entity(heap, &value)?;
                process.print(&text);
            }

            Op::Lmdl => {
                let name = match instruction.operand.text() {
                    Some(name) => name.clone(),
                    None => {
                        let value = frame(task)?.pop()?;
                        self.key(heap, value)?
                    }
                };
                let module = self.modules.module(&name)?;
                let reflection = self.modules.reflect_module(heap, &module)?;
                frame(task)?.push(Entity::Object(reflection));
            }
        }
        Ok(Flow::Continue)
    }

    /// Look a name up from the running frame: locals, `module.member`,
    /// the frame's module, loaded modules, then the builtin module.
    fn resolve(&self, process: &Process, task: &Task, name: &Arc<str>) -> VMResult<Entity> {
        let context = task.thread.current().ok_or(VMError::StackUnderflow)?;
        if let Some(value) = context.local(name) {
            return Ok(value);
        }
        let heap = process.heap().as_ref();
        if let Some((module_name, member)) = name.split_once('.') {
            let module = self.modules.module(module_name)?;
            return self
                .reflect_member(heap, &module, member)?
                .ok_or_else(|| VMError::VariableNotFound(name.clone()));
        }
        if let Some(found) = self.reflect_member(heap, context.module(), name)? {
            return Ok(found);
        }
        match self.modules.module(name) {
            Ok(module) => return Ok(Entity::Object(self.modules.reflect_module(heap, &module)?)),
            Err(LoadError::UnknownModule(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(builtin) = self.modules.builtin() {
            if let Some(found) = self.reflect_member(heap, &builtin, name)? {
                return Ok(found);
            }
        }
        Err(VMError::VariableNotFound(name.clone()))
    }

    fn reflect_member(&self, heap: &dyn Heap, module: &Arc<Module>, name: &str) -> VMResult<Option<Entity>> {
        if let Some(function) = module.function(name) {
            return Ok(Some(Entity::Object(self.modules.reflect_function(heap, function)?)));
        }
        if let Some(class) = module.class(name) {
            return Ok(Some(Entity::Object(self.modules.reflect_class(heap, class)?)));
        }
        Ok(None)
    }

    fn get_member(&self, heap: &dyn Heap, target: Entity, name: &Arc<str>) -> VMResult<Entity> {
        let obj = match target {
            Entity::Object(obj) => obj,
            other => {
                return Err(VMError::MemberNotFound {
                    owner: other.type_name().to_string(),
                    member: name.clone(),
                })
            }
        };
        let (member, class, described) = heap.read(obj, |o| {
            let described = match &o.native {
                Some(NativeObject::Module(module)) => Described::Module(module.clone()),
                Some(NativeObject::Class(class)) => Described::Class(class.clone()),
                _ => Described::Nothing,
            };
            (o.member(name), o.class.clone(), described)
        })?;
        if let Some(value) = member {
            return Ok(value);
        }
        match described {
            Described::Module(module) => {
                if let Some(found) = self.reflect_member(heap, &module, name)? {
                    return Ok(found);
                }
            }
            Described::Class(described) => {
                if let Some(method) = described.find_method(name) {
                    return Ok(Entity::Object(self.modules.reflect_function(heap, method)?));
                }
            }
            Described::Nothing => {}
        }
        if let Some(method) = class.find_method(name) {
            let bound = NativeObject::Function(FunctionRef {
                function: method.clone(),
                receiver: Some(target),
            });
            let function_class = self.builtin_class("Function")?;
            return Ok(Entity::Object(heap.allocate_native(&function_class, bound)?));
        }
        Err(VMError::MemberNotFound {
            owner: class.qualified_name(),
            member: name.clone(),
        })
    }

    fn call_value(&self, process: &Process, task: &mut Task, callee: Entity, arg: Entity) -> VMResult<Flow> {
        enum Callee {
            Function(FunctionRef),
            Class(Arc<Class>),
            Other(String),
        }
        let obj = match callee {
            Entity::Object(obj) => obj,
            other => return Err(VMError::NotCallable(other.type_name().to_string())),
        };
        let target = process.heap().read(obj, |o| match &o.native {
            Some(NativeObject::Function(function)) => Callee::Function(function.clone()),
            Some(NativeObject::Class(class)) => Callee::Class(class.clone()),
            _ => Callee::Other(o.class.qualified_name()),
        })?;
        match target {
            Callee::Function(function) => self.call_function(process, task, &function.function, arg, function.receiver),
            Callee::Class(class) => self.construct(process, task, &class, arg),
            Callee::Other(name) => Err(VMError::NotCallable(name)),
        }
    }

    fn call_method(
        &self,
        process: &Process,
        task: &mut Task,
        receiver: Entity,
        name: &Arc<str>,
        arg: Entity,
    ) -> VMResult<Flow> {
        let obj = match receiver {
            Entity::Object(obj) => obj,
            other => {
                return Err(VMError::MethodNotFound {
                    owner: other.type_name().to_string(),
                    method: name.clone(),
                })
            }
        };
        let class = process.heap().get_class(obj)?;
        if let Some(method) = class.find_method(name) {
            let method = method.clone();
            return self.call_function(process, task, &method, arg, Some(receiver));
        }
        // Function-valued members and reflected module/class members.
        match self.get_member(process.heap().as_ref(), receiver, name) {
            Ok(callee) => self.call_value(process, task, callee, arg),
            Err(VMError::MemberNotFound { owner, member }) => Err(VMError::MethodNotFound { owner, method: member }),
            Err(err) => Err(err),
        }
    }

    fn call_function(
        &self,
        process: &Process,
        task: &mut Task,
        function: &Arc<Function>,
        arg: Entity,
        receiver: Option<Entity>,
    ) -> VMResult<Flow> {
        let heap = process.heap().as_ref();
        if let FunctionBody::Native(body) = function.body {
            let call = NativeCall {
                heap,
                modules: &self.modules,
                receiver: receiver.unwrap_or_default(),
            };
            let result = body(&call, arg)?;
            let result = if function.is_async() {
                let slot = Arc::new(FutureSlot::new());
                slot.resolve(Ok(result));
                self.new_future(heap, slot)?
            } else if function.is_background() {
                Entity::None
            } else {
                result
            };
            frame(task)?.push(result);
            return Ok(Flow::Continue);
        }

        let module = self.modules.module(&function.module)?;
        if function.is_async() {
            let (spawned, slot) = process.spawn_async(module, function, arg, receiver)?;
            debug!(task = task.id, spawned = spawned.id, function = %function.qualified_name(), "Spawned async task");
            process.spawn(spawned);
            let future = self.new_future(heap, slot)?;
            frame(task)?.push(future);
            return Ok(Flow::Continue);
        }
        if function.is_background() {
            let spawned = process.spawn_call(module, function, arg, receiver)?;
            debug!(task = task.id, spawned = spawned.id, function = %function.qualified_name(), "Spawned background task");
            process.spawn(spawned);
            frame(task)?.push(Entity::None);
            return Ok(Flow::Continue);
        }
        self.enter(task, module, function, arg, receiver, ReturnMode::Value)
    }

    /// Allocate an instance and run its `new` method, if it has one.
    fn construct(&self, process: &Process, task: &mut Task, class: &Arc<Class>, arg: Entity) -> VMResult<Flow> {
        let heap = process.heap().as_ref();
        let obj = heap.allocate(class)?;
        let instance = Entity::Object(obj);
        let constructor = class.find_method("new").cloned();
        match constructor {
            None => {
                frame(task)?.push(instance);
                Ok(Flow::Continue)
            }
            Some(constructor) => match constructor.body {
                FunctionBody::Native(body) => {
                    let call = NativeCall {
                        heap,
                        modules: &self.modules,
                        receiver: instance,
                    };
                    body(&call, arg)?;
                    frame(task)?.push(instance);
                    Ok(Flow::Continue)
                }
                FunctionBody::Bytecode { .. } => {
                    let module = self.modules.module(&constructor.module)?;
                    self.enter(task, module, &constructor, arg, Some(instance), ReturnMode::Construct(obj))
                }
            },
        }
    }

    fn enter(
        &self,
        task: &mut Task,
        module: Arc<Module>,
        function: &Function,
        arg: Entity,
        receiver: Option<Entity>,
        mode: ReturnMode,
    ) -> VMResult<Flow> {
        if task.thread.depth() >= self.config.max_call_depth {
            return Err(VMError::StackOverflow(self.config.max_call_depth));
        }
        let entry = function
            .entry()
            .ok_or_else(|| VMError::NotCallable(function.qualified_name()))?;
        let context = Context::call(module, function.name.clone(), entry, arg, receiver).with_mode(mode);
        task.thread.push_context(context);
        Ok(Flow::Continue)
    }

    fn return_from(&self, task: &mut Task, value: Entity) -> VMResult<Flow> {
        let context = task.thread.pop_context().ok_or(VMError::StackUnderflow)?;
        let result = match context.mode() {
            ReturnMode::Value => value,
            ReturnMode::Construct(obj) => Entity::Object(obj),
        };
        let depth = task.thread.depth();
        task.thread.adopt_frame_locks(depth);
        match task.thread.current_mut() {
            Some(caller) => {
                caller.push(result);
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Finished(result)),
        }
    }

    /// `RAIS`: raise an error object, or wrap any other value in one.
    fn raise(&self, process: &Process, task: &mut Task, value: Entity) -> VMResult<Flow> {
        let heap = process.heap().as_ref();
        if let Entity::Object(obj) = value {
            if let Some(message) = heap.read(obj, |o| o.as_error().map(|e| e.message.clone()))? {
                return self.throw(process, task, obj, message, Vec::new());
            }
        }
        let message = render_entity(heap, &value)?;
        let error = self.new_error(heap, &message)?;
        self.throw(process, task, error, message, Vec::new())
    }

    /// Turn a runtime failure into a raised `Error`.
    fn raise_error(&self, process: &Process, task: &mut Task, err: VMError) -> VMResult<Flow> {
        let message = err.to_string();
        let error = self.new_error(process.heap().as_ref(), &message)?;
        self.throw(process, task, error, message, Vec::new())
    }

    /// Unwind `task` with `error`. `origin` holds frames that raised it
    /// elsewhere (an async task); they sit innermost in the stacktrace.
    fn throw(
        &self,
        process: &Process,
        task: &mut Task,
        error: ObjectReference,
        message: String,
        origin: Vec<StackLine>,
    ) -> VMResult<Flow> {
        let mut stacktrace = origin;
        stacktrace.extend(task.thread.stacktrace());
        process.heap().write(error, |o| {
            if let Some(NativeObject::Error(exception)) = &mut o.native {
                exception.stacktrace = stacktrace.clone();
            }
        })?;
        let exception = Exception::new(message).with_stacktrace(stacktrace);

        // Unwind to the innermost frame with a handler, releasing the locks
        // of every frame that is dropped.
        loop {
            let context = match task.thread.current_mut() {
                Some(context) => context,
                None => return Err(VMError::Uncaught(exception)),
            };
            if let Some(handler) = context.pop_handler() {
                context.truncate_stack(handler.stack_depth);
                context.push(Entity::Object(error));
                context.set_pc(handler.target);
                return Ok(Flow::Continue);
            }
            task.thread.pop_context();
            let depth = task.thread.depth();
            task.thread.release_frame_locks(process.locks(), depth)?;
        }
    }

    fn builtin_class(&self, name: &str) -> VMResult<Arc<Class>> {
        self.modules.builtin_class(name).ok_or_else(|| {
            VMError::Load(LoadError::UnknownClass {
                module: BUILTIN_MODULE.into(),
                name: name.into(),
            })
        })
    }

    fn new_str(&self, heap: &dyn Heap, text: impl Into<String>) -> VMResult<Entity> {
        let class = self.builtin_class("String")?;
        Ok(Entity::Object(heap.allocate_str(&class, text)?))
    }

    fn new_error(&self, heap: &dyn Heap, message: &str) -> VMResult<ObjectReference> {
        let class = self.builtin_class("Error")?;
        Ok(heap.allocate_native(&class, NativeObject::Error(Exception::new(message)))?)
    }

    fn new_future(&self, heap: &dyn Heap, slot: Arc<FutureSlot>) -> VMResult<Entity> {
        let class = self.builtin_class("Future")?;
        Ok(Entity::Object(heap.allocate_native(&class, NativeObject::Future(slot))?))
    }

    fn string_of(&self, heap: &dyn Heap, value: Entity) -> VMResult<Option<String>> {
        match value {
            Entity::Object(obj) => Ok(heap.read(obj, |o| o.as_str().map(str::to_string))?),
            _ => Ok(None),
        }
    }

    fn is_str(&self, heap: &dyn Heap, value: Entity) -> VMResult<bool> {
        match value {
            Entity::Object(obj) => Ok(heap.read(obj, |o| o.as_str().is_some())?),
            _ => Ok(false),
        }
    }

    /// Named-list key from a stack value
    fn key(&self, heap: &dyn Heap, value: Entity) -> VMResult<Arc<str>> {
        let text = render_entity(heap, &value)?;
        Ok(self.modules.strings().intern(&text))
    }

    fn compare(&self, heap: &dyn Heap, op: Op, a: Entity, b: Entity) -> VMResult<Option<Ordering>> {
        if let (Entity::Primitive(x), Entity::Primitive(y)) = (a, b) {
            return Ok(x.compare(&y));
        }
        match (self.string_of(heap, a)?, self.string_of(heap, b)?) {
            (Some(x), Some(y)) => Ok(Some(x.cmp(&y))),
            _ => Err(VMError::TypeError(format!(
                "{} cannot compare {} and {}",
                op.mnemonic(),
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Primitives compare numerically, strings by content, other objects
    /// by identity.
    fn equals(&self, heap: &dyn Heap, a: Entity, b: Entity) -> VMResult<bool> {
        match (a, b) {
            (Entity::None, Entity::None) => Ok(true),
            (Entity::Primitive(x), Entity::Primitive(y)) => Ok(x.equals(&y)),
            (Entity::Object(x), Entity::Object(y)) if x == y => Ok(true),
            (Entity::Object(_), Entity::Object(_)) => match (self.string_of(heap, a)?, self.string_of(heap, b)?) {
                (Some(x), Some(y)) => Ok(x == y),
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    fn length(&self, heap: &dyn Heap, value: Entity) -> VMResult<usize> {
        let obj = object(Op::Alen, value)?;
        heap.read(obj, |o| match &o.native {
            Some(NativeObject::Str(text)) => Ok(text.len()),
            Some(NativeObject::Array(items)) => Ok(items.len()),
            Some(NativeObject::NamedList(items)) => Ok(items.len()),
            _ => Err(VMError::TypeError(format!("{} has no length", o.class.qualified_name()))),
        })?
    }

    fn is_instance(&self, heap: &dyn Heap, value: Entity, class: Entity) -> VMResult<bool> {
        let class_obj = object(Op::Is, class)?;
        let class = heap
            .read(class_obj, |o| o.as_class().cloned())?
            .ok_or_else(|| VMError::TypeError("IS expects a class".to_string()))?;
        match value {
            Entity::Object(obj) => Ok(heap.get_class(obj)?.is_subclass_of(&class)),
            _ => Ok(false),
        }
    }

    /// New object with the same class, members and payload.
    fn shallow_copy(&self, heap: &dyn Heap, value: Entity) -> VMResult<Entity> {
        let obj = match value {
            Entity::Object(obj) => obj,
            other => return Ok(other),
        };
        let original = heap.read(obj, |o| o.clone())?;
        let copy = match original.native {
            Some(native) => heap.allocate_native(&original.class, native)?,
            None => heap.allocate(&original.class)?,
        };
        heap.write(copy, |o| o.members = original.members)?;
        Ok(Entity::Object(copy))
    }
}

impl std::fmt::Debug for VM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VM")
            .field("modules", &self.modules)
            .field("processes", &self.processes.len())
            .finish()
    }
}

fn frame(task: &mut Task) -> VMResult<&mut Context> {
    task.thread.current_mut().ok_or(VMError::StackUnderflow)
}

/// Pop two values, returning them in push order.
fn pop_pair(task: &mut Task) -> VMResult<(Entity, Entity)> {
    let context = frame(task)?;
    let b = context.pop()?;
    let a = context.pop()?;
    Ok((a, b))
}

fn name_operand(instruction: &Instruction) -> VMResult<&Arc<str>> {
    match &instruction.operand {
        Operand::None => Err(VMError::MissingOperand(instruction.op)),
        operand => operand.text().ok_or(VMError::InvalidOperand {
            op: instruction.op,
            expected: "a name",
        }),
    }
}

fn int_operand(instruction: &Instruction) -> VMResult<i64> {
    match &instruction.operand {
        Operand::None => Err(VMError::MissingOperand(instruction.op)),
        operand => operand.int().ok_or(VMError::InvalidOperand {
            op: instruction.op,
            expected: "an integer",
        }),
    }
}

fn int_operand_or(instruction: &Instruction, default: i64) -> VMResult<i64> {
    match &instruction.operand {
        Operand::None => Ok(default),
        _ => int_operand(instruction),
    }
}

fn primitive(op: Op, value: Entity) -> VMResult<Primitive> {
    value.as_primitive().ok_or_else(|| {
        VMError::TypeError(format!("{} expects a number, found {}", op.mnemonic(), value.type_name()))
    })
}

fn object(op: Op, value: Entity) -> VMResult<ObjectReference> {
    value.as_object().ok_or_else(|| {
        VMError::TypeError(format!("{} expects an object, found {}", op.mnemonic(), value.type_name()))
    })
}

fn index_in(position: Entity, len: usize) -> VMResult<usize> {
    let index = match position {
        Entity::Primitive(Primitive::Float(_)) | Entity::None | Entity::Object(_) => {
            return Err(VMError::TypeError(format!("index must be an integer, found {}", position.type_name())))
        }
        Entity::Primitive(value) => value.as_int(),
    };
    if index < 0 || index as usize >= len {
        return Err(VMError::IndexOutOfBounds { index, len });
    }
    Ok(index as usize)
}
