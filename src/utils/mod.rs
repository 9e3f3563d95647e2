//! Utility functions for the tapevm runtime

mod keyed_list;
mod string_pool;

pub use keyed_list::KeyedList;
pub use string_pool::StringPool;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use crate::bytecode::{CodecError, Decoder, Encoder, Instruction, Op, Operand, Tape, TapeError};
use crate::entity::Primitive;

/// A tape file operation that failed, with the path it was working on.
#[derive(Error, Debug)]
#[error("Failed to {operation} '{}': {source}", .path.display())]
pub struct FileError {
    pub path: PathBuf,
    pub operation: &'static str,
    #[source]
    pub source: CodecError,
}

impl FileError {
    fn new(path: &Path, operation: &'static str, source: impl Into<CodecError>) -> Self {
        Self {
            path: path.to_path_buf(),
            operation,
            source: source.into(),
        }
    }
}

/// Writes a tape to a file in the binary format
pub fn write_tape<P: AsRef<Path>>(tape: &Tape, path: P, debug_info: bool) -> Result<(), FileError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| FileError::new(path, "create", e))?;
    let mut writer = BufWriter::new(file);
    Encoder::new()
        .with_debug_info(debug_info)
        .encode(tape, &mut writer)
        .map_err(|e| FileError::new(path, "write", e))?;
    writer.flush().map_err(|e| FileError::new(path, "write", e))?;
    info!(path = %path.display(), instructions = tape.len(), "Wrote tape");
    Ok(())
}

/// Reads a binary tape file, interning its strings into `pool`
pub fn read_tape<P: AsRef<Path>>(path: P, pool: &StringPool) -> Result<Tape, FileError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| FileError::new(path, "open", e))?;
    let mut reader = BufReader::new(file);
    Decoder::new(pool)
        .decode(&mut reader)
        .map_err(|e| FileError::new(path, "read", e))
}

/// Generates a demo tape exercising classes, async calls and exceptions.
///
/// Running it prints four lines and returns the counter's final value, 11.
pub fn generate_demo_tape() -> Result<Tape, TapeError> {
    fn emit(tape: &mut Tape, instruction: Instruction) -> Result<usize, TapeError> {
        let position = tape.append(instruction);
        tape.set_source(position, position as i32 + 1, 1)?;
        Ok(position)
    }

    let mut tape = Tape::new();

    // Module code
    emit(&mut tape, Instruction::new(Op::Push).with_string("tapevm demo"))?;
    emit(&mut tape, Instruction::new(Op::Prnt))?;
    emit(&mut tape, Instruction::new(Op::Push).with_int(10))?;
    emit(&mut tape, Instruction::new(Op::Call).with_identifier("Counter"))?;
    emit(&mut tape, Instruction::new(Op::Dup))?;
    emit(&mut tape, Instruction::new(Op::Pnil))?;
    emit(&mut tape, Instruction::new(Op::Clln).with_identifier("inc"))?;
    emit(&mut tape, Instruction::new(Op::Prnt))?;
    emit(&mut tape, Instruction::new(Op::Push).with_int(7))?;
    emit(&mut tape, Instruction::new(Op::Call).with_identifier("square"))?;
    emit(&mut tape, Instruction::new(Op::Wait))?;
    emit(&mut tape, Instruction::new(Op::Prnt))?;
    let catch = emit(&mut tape, Instruction::new(Op::Ctch))?;
    emit(&mut tape, Instruction::new(Op::Push).with_int(1))?;
    emit(&mut tape, Instruction::new(Op::Push).with_int(0))?;
    emit(&mut tape, Instruction::new(Op::Div))?;
    emit(&mut tape, Instruction::new(Op::Exit))?;
    let handler = emit(&mut tape, Instruction::new(Op::Pnil))?;
    tape.patch(catch, Operand::Primitive(Primitive::Int(handler as i64)))?;
    emit(&mut tape, Instruction::new(Op::Clln).with_identifier("message"))?;
    emit(&mut tape, Instruction::new(Op::Prnt))?;
    emit(&mut tape, Instruction::new(Op::Get).with_identifier("count"))?;
    emit(&mut tape, Instruction::new(Op::Exit))?;

    // async square(x)
    tape.begin_function("~square")?;
    emit(&mut tape, Instruction::new(Op::Dup))?;
    emit(&mut tape, Instruction::new(Op::Mult))?;
    emit(&mut tape, Instruction::new(Op::Ret))?;
    tape.end_function()?;

    tape.begin_class("Counter", Vec::new())?;
    tape.begin_function("new")?;
    emit(&mut tape, Instruction::new(Op::Push).with_identifier("self"))?;
    emit(&mut tape, Instruction::new(Op::Swap))?;
    emit(&mut tape, Instruction::new(Op::Fld).with_identifier("count"))?;
    emit(&mut tape, Instruction::new(Op::Ret))?;
    tape.begin_function("inc")?;
    emit(&mut tape, Instruction::new(Op::Pop))?;
    emit(&mut tape, Instruction::new(Op::Push).with_identifier("self"))?;
    emit(&mut tape, Instruction::new(Op::Get).with_identifier("count"))?;
    emit(&mut tape, Instruction::new(Op::Inc))?;
    emit(&mut tape, Instruction::new(Op::Let).with_identifier("n"))?;
    emit(&mut tape, Instruction::new(Op::Push).with_identifier("self"))?;
    emit(&mut tape, Instruction::new(Op::Push).with_identifier("n"))?;
    emit(&mut tape, Instruction::new(Op::Fld).with_identifier("count"))?;
    emit(&mut tape, Instruction::new(Op::Push).with_identifier("n"))?;
    emit(&mut tape, Instruction::new(Op::Ret))?;
    tape.end_class()?;

    tape.validate()?;
    Ok(tape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tempfile::{tempdir, NamedTempFile};
    use crate::bytecode::to_text;

    #[test]
    fn test_write_and_read_round_trip() {
        let tape = generate_demo_tape().unwrap();
        let file = NamedTempFile::new().unwrap();
        write_tape(&tape, file.path(), true).unwrap();

        let pool = StringPool::new();
        let loaded = read_tape(file.path(), &pool).unwrap();
        assert_eq!(to_text(&loaded), to_text(&tape));
        assert!(pool.len() > 0);
    }

    #[test]
    fn test_round_trip_without_debug_info_drops_mappings() {
        let tape = generate_demo_tape().unwrap();
        let file = NamedTempFile::new().unwrap();
        write_tape(&tape, file.path(), false).unwrap();
        let loaded = read_tape(file.path(), &StringPool::new()).unwrap();
        assert_eq!(loaded.len(), tape.len());
        assert!(!loaded.has_source_mappings());
    }

    #[test]
    fn test_missing_file_reports_path_and_operation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.tape");
        let err = read_tape(&path, &StringPool::new()).unwrap_err();
        assert_eq!(err.operation, "open");
        assert_eq!(err.path, path);
        match &err.source {
            CodecError::IoError(io) => assert_eq!(io.kind(), ErrorKind::NotFound),
            other => panic!("Expected IO error, got {:?}", other),
        }
        assert!(err.to_string().starts_with("Failed to open"));
    }

    #[test]
    fn test_truncated_file_is_a_read_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0x05, b'a']).unwrap();
        file.flush().unwrap();
        let err = read_tape(file.path(), &StringPool::new()).unwrap_err();
        assert_eq!(err.operation, "read");
    }

    #[test]
    fn test_demo_tape_layout() {
        let tape = generate_demo_tape().unwrap();
        assert!(tape.function_entry("~square").is_some());
        let counter = tape.class("Counter").unwrap();
        assert_eq!(counter.methods.len(), 2);
        assert_eq!(counter.end, tape.len());
        assert_eq!(tape.source(0).line, 1);
    }
}
