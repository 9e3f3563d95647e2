use std::fmt;
use std::sync::Arc;
use crate::bytecode::SourceMapping;

/// One frame of a stacktrace.
#[derive(Debug, Clone, PartialEq)]
pub struct StackLine {
    pub module: Arc<str>,
    pub function: Arc<str>,
    pub source: SourceMapping,
}

impl fmt::Display for StackLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}.{} ({})", self.module, self.function, self.source)
    }
}

/// A raised error: message plus the frames active at the raise point,
/// innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub message: String,
    pub stacktrace: Vec<StackLine>,
}

impl Exception {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: Vec::new(),
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: Vec<StackLine>) -> Self {
        self.stacktrace = stacktrace;
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.stacktrace {
            write!(f, "\n    {}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}
