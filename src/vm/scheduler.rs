use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use crate::entity::Entity;
use crate::vm::{Task, TaskState, VMError, VMResult, VM};

/// How long a parallel worker keeps polling when all of its tasks wait on
/// work owned by other workers.
const PATIENCE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

impl VM {
    /// Run `task` to completion on the calling thread, along with every task
    /// it spawns. Returns the task's result or its uncaught exception.
    pub fn run(&self, task: Task) -> VMResult<Entity> {
        self.schedule(task, false)
    }

    /// Run each task on its own OS thread. Results come back in input order.
    pub fn execute_parallel(&self, tasks: Vec<Task>) -> Vec<VMResult<Entity>> {
        let outcome = crossbeam::scope(|scope| {
            let handles: Vec<_> = tasks
                .into_iter()
                .map(|task| scope.spawn(move |_| self.schedule(task, true)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(VMError::Native("worker thread panicked".to_string())))
                })
                .collect::<Vec<_>>()
        });
        outcome.unwrap_or_else(|_| vec![Err(VMError::Native("worker thread panicked".to_string()))])
    }

    /// Round-robin `main` and the tasks spawned on its process until the
    /// queue drains. A pass with no progress and nothing asleep is a
    /// deadlock, unless `patient` allows waiting on other workers.
    fn schedule(&self, main: Task, patient: bool) -> VMResult<Entity> {
        let process = self.process(main.process_id)?;
        let main_id = main.id;
        let mut queue = VecDeque::from([main]);
        let mut result = None;
        let mut stalled = 0usize;
        let mut patience_started: Option<Instant> = None;

        while let Some(mut task) = queue.pop_front() {
            queue.extend(process.drain_spawned());

            let before = task.steps;
            let state = self.execute_task(&mut task);
            let progressed = task.steps != before || state.is_finished();
            queue.extend(process.drain_spawned());

            if state.is_finished() {
                if task.id == main_id {
                    result = Some(match state {
                        TaskState::Complete(value) => Ok(value),
                        TaskState::Failed(exception) => Err(VMError::Uncaught(exception)),
                        _ => Ok(Entity::None),
                    });
                }
            } else {
                queue.push_back(task);
            }

            if progressed {
                stalled = 0;
                patience_started = None;
                continue;
            }
            stalled += 1;
            if stalled < queue.len() {
                continue;
            }

            // Every queued task took a turn without moving.
            stalled = 0;
            if let Some(wake_at) = earliest_wake(&queue) {
                let now = Instant::now();
                if wake_at > now {
                    std::thread::sleep(wake_at - now);
                }
                continue;
            }
            if patient {
                let started = *patience_started.get_or_insert_with(Instant::now);
                if started.elapsed() < PATIENCE {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }
            let waiting = queue.len();
            warn!(process = process.id(), tasks = waiting, "Deadlock detected");
            for task in queue.iter_mut() {
                task.cancel(process.locks())?;
            }
            return Err(VMError::Deadlock(waiting));
        }

        debug!(process = process.id(), task = main_id, "Scheduler drained");
        result.unwrap_or(Ok(Entity::None))
    }
}

fn earliest_wake(queue: &VecDeque<Task>) -> Option<Instant> {
    queue
        .iter()
        .filter_map(|task| match task.state {
            TaskState::Sleeping(wake_at) => Some(wake_at),
            _ => None,
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::parse_text;
    use crate::runtime::RuntimeConfig;

    fn create_test_vm() -> VM {
        VM::with_config(RuntimeConfig::new().with_capture_output(true)).unwrap()
    }

    #[test]
    fn test_spawned_tasks_run_after_main_finishes() {
        let vm = create_test_vm();
        let text = "PUSH 1\nCALL log\nPUSH 2\nCALL log\nPUSH 0\nEXIT\n@&log\nPRNT\nRET\n";
        let module = vm.modules().load("main", parse_text(text).unwrap()).unwrap();
        let result = vm.run(vm.main_process().spawn_module(module)).unwrap();
        assert_eq!(result, Entity::int(0));
        assert_eq!(vm.main_process().take_output(), "1\n2\n");
    }

    #[test]
    fn test_sleeping_task_is_not_a_deadlock() {
        let vm = create_test_vm();
        let text = "PNIL\nCALL nap\nWAIT\nEXIT\n@~nap\nSLEP 5\nPUSH 3\nRET\n";
        let module = vm.modules().load("main", parse_text(text).unwrap()).unwrap();
        let started = Instant::now();
        let result = vm.run(vm.main_process().spawn_module(module)).unwrap();
        assert_eq!(result, Entity::int(3));
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_time_sliced_tasks_interleave() {
        let vm = VM::with_config(
            RuntimeConfig::new()
                .with_capture_output(true)
                .with_time_slice(Some(2)),
        )
        .unwrap();
        let text = "PUSH \"a\"\nCALL echo\nPUSH \"b\"\nPRNT\nPUSH \"c\"\nPRNT\nPNIL\nEXIT\n@&echo\nPRNT\nPUSH \"x\"\nPRNT\nRET\n";
        let module = vm.modules().load("main", parse_text(text).unwrap()).unwrap();
        vm.run(vm.main_process().spawn_module(module)).unwrap();
        assert_eq!(vm.main_process().take_output(), "a\nb\nx\nc\n");
    }

    #[test]
    fn test_deadlock_cancels_every_task() {
        let vm = create_test_vm();
        let text = "PNIL\nCALL Object\nDUP\nLOCK\nCALL grab\nWAIT\nEXIT\n@~grab\nLOCK\nPNIL\nRET\n";
        let module = vm.modules().load("main", parse_text(text).unwrap()).unwrap();
        let result = vm.run(vm.main_process().spawn_module(module));
        assert!(matches!(result, Err(VMError::Deadlock(2))));
        assert_eq!(vm.main_process().locks().held_by(1), 0);
    }

    #[test]
    fn test_execute_parallel_isolates_processes() {
        let vm = create_test_vm();
        let text = "PUSH 0\nLET i\nPUSH i\nPUSH 1000\nLT\nIFN 5\nPUSH i\nINC\nSET i\nJMP -7\nPUSH i\nEXIT\n";
        let module = vm.modules().load("main", parse_text(text).unwrap()).unwrap();
        let tasks: Vec<Task> = (0..4).map(|_| vm.create_process().spawn_module(module.clone())).collect();
        let results = vm.execute_parallel(tasks);
        assert_eq!(results.len(), 4);
        for result in results {
            assert_eq!(result.unwrap(), Entity::int(1000));
        }
    }

    #[test]
    fn test_parallel_failure_is_reported_per_task() {
        let vm = create_test_vm();
        let good = vm.modules().load("good", parse_text("PUSH 1\nEXIT\n").unwrap()).unwrap();
        let bad = vm.modules().load("bad", parse_text("PUSH \"no\"\nRAIS\n").unwrap()).unwrap();
        let tasks = vec![
            vm.create_process().spawn_module(good),
            vm.create_process().spawn_module(bad),
        ];
        let results = vm.execute_parallel(tasks);
        assert_eq!(results[0].as_ref().unwrap(), &Entity::int(1));
        match &results[1] {
            Err(VMError::Uncaught(exception)) => assert_eq!(exception.message, "no"),
            other => panic!("Expected uncaught exception, got {:?}", other),
        }
    }
}
