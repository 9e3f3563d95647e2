//! Runtime configuration options

/// Configuration options for the tapevm runtime
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub debug_mode: bool,
    pub stack_trace: bool,
    /// Frames a task may nest before a call raises a stack overflow
    pub max_call_depth: usize,
    /// Instructions per `execute_task` call; `None` runs until suspension
    pub time_slice: Option<usize>,
    /// Initial object table capacity of each process heap
    pub heap_capacity: usize,
    pub write_debug_info: bool,
    /// Buffer `PRNT` output per process instead of writing to stdout
    pub capture_output: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug_mode: false,
            stack_trace: false,
            max_call_depth: 1024,
            time_slice: None,
            heap_capacity: 1024,
            write_debug_info: true,
            capture_output: false,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable debug mode
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Enable or disable per-instruction tracing
    pub fn with_stack_trace(mut self, stack_trace: bool) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_time_slice(mut self, time_slice: Option<usize>) -> Self {
        self.time_slice = time_slice;
        self
    }

    pub fn with_heap_capacity(mut self, capacity: usize) -> Self {
        self.heap_capacity = capacity;
        self
    }

    /// Write the source-mapping section when saving tapes
    pub fn with_write_debug_info(mut self, enabled: bool) -> Self {
        self.write_debug_info = enabled;
        self
    }

    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Reject settings the VM cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_call_depth == 0 {
            return Err("max_call_depth must be at least 1".to_string());
        }
        if self.time_slice == Some(0) {
            return Err("time_slice must be at least 1 instruction".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = RuntimeConfig::new()
            .with_debug_mode(true)
            .with_max_call_depth(8)
            .with_time_slice(Some(100))
            .with_write_debug_info(false);
        assert!(config.debug_mode);
        assert_eq!(config.max_call_depth, 8);
        assert_eq!(config.time_slice, Some(100));
        assert!(!config.write_debug_info);
        assert!(!config.capture_output);
    }

    #[test]
    fn test_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert!(RuntimeConfig::new().with_max_call_depth(0).validate().is_err());
        assert!(RuntimeConfig::new().with_time_slice(Some(0)).validate().is_err());
    }
}
