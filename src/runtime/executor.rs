use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use crate::bytecode::{to_text, Tape};
use crate::entity::{Entity, Module};
use crate::heap::render_entity;
use crate::runtime::{RuntimeConfig, RuntimeError, RuntimeResult};
use crate::utils::{read_tape, write_tape};
use crate::vm::{VMError, VM};

/// The Runtime is the main entry point for using the bytecode VM
pub struct Runtime {
    vm: VM,
    config: RuntimeConfig,
}

impl Runtime {
    /// Create a new runtime with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate().map_err(RuntimeError::ConfigError)?;
        let vm = VM::with_config(config.clone())?;
        Ok(Self { vm, config })
    }

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Hydrate `tape` as module `name`.
    pub fn load_tape(&self, name: &str, tape: Tape) -> RuntimeResult<Arc<Module>> {
        if self.config.debug_mode {
            debug!(module = name, "Tape listing:\n{}", to_text(&tape));
        }
        Ok(self.vm.modules().load(name, tape)?)
    }

    /// Read a binary tape file and load it as module `name`.
    pub fn load_file<P: AsRef<Path>>(&self, name: &str, path: P) -> RuntimeResult<Arc<Module>> {
        let tape = read_tape(path, self.vm.modules().strings())?;
        self.load_tape(name, tape)
    }

    /// Write `tape` to a file, with source mappings when configured.
    pub fn write_file<P: AsRef<Path>>(&self, tape: &Tape, path: P) -> RuntimeResult<()> {
        write_tape(tape, path, self.config.write_debug_info)?;
        Ok(())
    }

    /// Run a loaded module's top-level code on the main process.
    pub fn execute_module(&self, name: &str) -> RuntimeResult<Entity> {
        let module = self.vm.modules().module(name)?;
        let task = self.vm.main_process().spawn_module(module);
        let result = self.vm.run(task)?;
        info!(module = name, "Module finished");
        Ok(result)
    }

    /// Load a tape file, naming the module after the file stem, and run it.
    pub fn execute_file<P: AsRef<Path>>(&self, path: P) -> RuntimeResult<Entity> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| RuntimeError::ConfigError(format!("cannot name a module after '{}'", path.display())))?;
        self.load_file(name, path)?;
        self.execute_module(name)
    }

    /// Call a top-level function of a loaded module with one argument.
    pub fn call_function(&self, module: &str, function: &str, arg: Entity) -> RuntimeResult<Entity> {
        let loaded = self.vm.modules().module(module)?;
        let target = loaded
            .function(function)
            .ok_or_else(|| VMError::VariableNotFound(format!("{}.{}", module, function).into()))?;
        let process = self.vm.main_process();
        let task = self.vm.spawn_function(&process, target, arg)?;
        Ok(self.vm.run(task)?)
    }

    /// Render a value from the main process the way `PRNT` does.
    pub fn render(&self, value: &Entity) -> RuntimeResult<String> {
        let heap = self.vm.main_process().heap().clone();
        Ok(render_entity(heap.as_ref(), value).map_err(VMError::from)?)
    }

    /// Output captured on the main process since the last call.
    pub fn take_output(&self) -> String {
        self.vm.main_process().take_output()
    }

    /// Collect the main process heap between runs.
    pub fn collect(&self) -> RuntimeResult<usize> {
        let freed = self.vm.collect(self.vm.main_process().id(), &[])?;
        debug!(freed, "Collected main heap");
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};
    use crate::bytecode::parse_text;
    use crate::utils::generate_demo_tape;

    /// Helper function to create a test runtime that captures output
    fn create_test_runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig::new().with_capture_output(true)).expect("Failed to create test runtime")
    }

    #[test]
    fn test_runtime_new() {
        let runtime = Runtime::new();
        assert!(runtime.is_ok(), "Runtime::new() should succeed");
        assert_eq!(runtime.unwrap().vm().main_process().id(), 1);
    }

    #[test]
    fn test_runtime_rejects_bad_config() {
        match Runtime::with_config(RuntimeConfig::new().with_max_call_depth(0)) {
            Err(RuntimeError::ConfigError(_)) => {}
            other => panic!("Expected ConfigError, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_execute_demo_file() {
        let runtime = create_test_runtime();
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.tape");
        runtime.write_file(&generate_demo_tape().unwrap(), &path).unwrap();

        let result = runtime.execute_file(&path).unwrap();
        assert_eq!(result, Entity::int(11));
        assert_eq!(
            runtime.take_output(),
            "tapevm demo\n11\n49\nArithmetic error: Division by zero\n"
        );
        assert!(runtime.vm().modules().get("demo").is_some());
    }

    #[test]
    fn test_execute_invalid_file() {
        let runtime = create_test_runtime();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xff, 0x00]).unwrap();
        file.flush().unwrap();
        match runtime.execute_file(file.path()) {
            Err(RuntimeError::FileError(err)) => assert_eq!(err.operation, "read"),
            other => panic!("Expected FileError, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_unknown_module() {
        let runtime = create_test_runtime();
        match runtime.execute_module("nowhere") {
            Err(RuntimeError::LoadError(_)) => {}
            other => panic!("Expected LoadError, got {:?}", other),
        }
    }

    #[test]
    fn test_uncaught_error_surfaces() {
        let runtime = create_test_runtime();
        runtime.load_tape("main", parse_text("PUSH \"oops\"\nRAIS\n").unwrap()).unwrap();
        match runtime.execute_module("main") {
            Err(RuntimeError::VMError(VMError::Uncaught(exception))) => {
                assert_eq!(exception.message, "oops");
                assert_eq!(exception.stacktrace.len(), 1);
            }
            other => panic!("Expected uncaught exception, got {:?}", other),
        }
    }

    #[test]
    fn test_call_function() {
        let runtime = create_test_runtime();
        runtime
            .load_tape("math", parse_text("@triple\nPUSH 3\nMULT\nRET\n").unwrap())
            .unwrap();
        assert_eq!(runtime.call_function("math", "triple", Entity::int(5)).unwrap(), Entity::int(15));
        match runtime.call_function("math", "missing", Entity::None) {
            Err(RuntimeError::VMError(VMError::VariableNotFound(name))) => assert_eq!(&*name, "math.missing"),
            other => panic!("Expected VariableNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_render_and_collect() {
        let runtime = create_test_runtime();
        runtime.load_tape("main", parse_text("PUSH \"kept\"\nPUSH \"dropped\"\nPOP\nEXIT\n").unwrap()).unwrap();
        let value = runtime.execute_module("main").unwrap();
        assert_eq!(runtime.render(&value).unwrap(), "kept");
        // Nothing roots the result once the task is gone.
        assert_eq!(runtime.collect().unwrap(), 2);
    }
}
