//! Binary tape format.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! u16 num_strings;   repeat: NUL-terminated UTF-8
//! u16 num_functions; repeat: u16 name_ref, u16 entry
//! u16 num_classes;   repeat: u16 name_ref, u16 start, u16 end,
//!                            u16 num_parents; repeat: u16 parent_ref
//!                            u16 num_methods; repeat: u16 name_ref, u16 entry
//! u16 num_instructions; repeat: u8 opcode, u8 operand_tag, operand
//! [u16 num_mappings; repeat: u16 index, i32 line, i32 column]
//! ```
//!
//! Instruction operands use a reference width of one byte when the string
//! table has at most 255 entries and two bytes otherwise. The trailing debug
//! section is optional and only written on request.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;
use crate::bytecode::{ClassRef, Instruction, Op, Operand, OperandTag, SourceMapping, Tape, TapeError};
use crate::entity::{Primitive, PrimitiveType};
use crate::utils::{KeyedList, StringPool};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Invalid opcode {byte:#04x} at instruction {index}")]
    InvalidOpcode { index: usize, byte: u8 },

    #[error("Invalid operand tag {tag} at instruction {index}")]
    InvalidOperandTag { index: usize, tag: u8 },

    #[error("Invalid primitive type {byte} at instruction {index}")]
    InvalidPrimitiveType { index: usize, byte: u8 },

    #[error("String reference {reference} out of range (table has {count} strings)")]
    StringRefOutOfRange { reference: usize, count: usize },

    #[error("String {0} in the string table is not valid UTF-8")]
    InvalidUtf8(usize),

    #[error("String {0:?} contains a NUL byte and cannot be encoded")]
    NulInString(String),

    #[error("Too many {what}: {count} exceeds the format limit")]
    TooMany { what: &'static str, count: usize },

    #[error("{what} {index} exceeds the format limit")]
    IndexTooLarge { what: &'static str, index: usize },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("Malformed tape: {0}")]
    Tape(#[from] TapeError),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Width of string references inside instruction operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefWidth {
    Byte,
    Word,
}

impl RefWidth {
    pub fn for_table(num_strings: usize) -> Self {
        if num_strings <= u8::MAX as usize {
            RefWidth::Byte
        } else {
            RefWidth::Word
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            RefWidth::Byte => 1,
            RefWidth::Word => 2,
        }
    }
}

fn to_u16(what: &'static str, value: usize) -> CodecResult<u16> {
    u16::try_from(value).map_err(|_| CodecError::IndexTooLarge { what, index: value })
}

fn count_u16(what: &'static str, count: usize) -> CodecResult<u16> {
    u16::try_from(count).map_err(|_| CodecError::TooMany { what, count })
}

/// Deduplicated string table in first-use order.
#[derive(Default)]
struct StringTable<'t> {
    strings: Vec<&'t str>,
    index: FxHashMap<&'t str, usize>,
}

impl<'t> StringTable<'t> {
    fn add(&mut self, value: &'t str) {
        if !self.index.contains_key(value) {
            self.index.insert(value, self.strings.len());
            self.strings.push(value);
        }
    }

    fn get(&self, value: &str) -> CodecResult<usize> {
        self.index
            .get(value)
            .copied()
            .ok_or_else(|| CodecError::StringRefOutOfRange {
                reference: self.strings.len(),
                count: self.strings.len(),
            })
    }

    fn collect(tape: &'t Tape) -> Self {
        let mut table = Self::default();
        for name in tape.functions().keys() {
            table.add(name);
        }
        for (name, class) in tape.classes().iter() {
            table.add(name);
            for parent in &class.parents {
                table.add(parent);
            }
            for method in class.methods.keys() {
                table.add(method);
            }
        }
        for instruction in tape.instructions() {
            if let Some(text) = instruction.operand.text() {
                table.add(text);
            }
        }
        table
    }
}

/// Serializes tapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    debug_info: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the source mapping section after the instructions.
    pub fn with_debug_info(mut self, debug_info: bool) -> Self {
        self.debug_info = debug_info;
        self
    }

    pub fn encode<W: Write>(&self, tape: &Tape, writer: &mut W) -> CodecResult<()> {
        let table = StringTable::collect(tape);
        let width = RefWidth::for_table(table.strings.len());

        writer.write_u16::<BigEndian>(count_u16("strings", table.strings.len())?)?;
        for s in &table.strings {
            if s.as_bytes().contains(&0) {
                return Err(CodecError::NulInString(s.to_string()));
            }
            writer.write_all(s.as_bytes())?;
            writer.write_u8(0)?;
        }

        writer.write_u16::<BigEndian>(count_u16("functions", tape.functions().len())?)?;
        for (name, &entry) in tape.functions().iter() {
            writer.write_u16::<BigEndian>(to_u16("string reference", table.get(name)?)?)?;
            writer.write_u16::<BigEndian>(to_u16("function entry", entry)?)?;
        }

        writer.write_u16::<BigEndian>(count_u16("classes", tape.classes().len())?)?;
        for (name, class) in tape.classes().iter() {
            writer.write_u16::<BigEndian>(to_u16("string reference", table.get(name)?)?)?;
            writer.write_u16::<BigEndian>(to_u16("class start", class.start)?)?;
            writer.write_u16::<BigEndian>(to_u16("class end", class.end)?)?;
            writer.write_u16::<BigEndian>(count_u16("parents", class.parents.len())?)?;
            for parent in &class.parents {
                writer.write_u16::<BigEndian>(to_u16("string reference", table.get(parent)?)?)?;
            }
            writer.write_u16::<BigEndian>(count_u16("methods", class.methods.len())?)?;
            for (method, &entry) in class.methods.iter() {
                writer.write_u16::<BigEndian>(to_u16("string reference", table.get(method)?)?)?;
                writer.write_u16::<BigEndian>(to_u16("method entry", entry)?)?;
            }
        }

        writer.write_u16::<BigEndian>(count_u16("instructions", tape.len())?)?;
        for instruction in tape.instructions() {
            writer.write_u8(instruction.op.to_byte())?;
            writer.write_u8(instruction.operand.tag() as u8)?;
            match &instruction.operand {
                Operand::None => {}
                Operand::Identifier(text) | Operand::String(text) => {
                    let reference = table.get(text)?;
                    match width {
                        RefWidth::Byte => writer.write_u8(reference as u8)?,
                        RefWidth::Word => writer.write_u16::<BigEndian>(to_u16("string reference", reference)?)?,
                    }
                }
                Operand::Primitive(value) => {
                    writer.write_u8(value.primitive_type() as u8)?;
                    match *value {
                        Primitive::Char(c) => writer.write_i8(c)?,
                        Primitive::Int(i) => writer.write_i64::<BigEndian>(i)?,
                        Primitive::Float(f) => writer.write_f64::<BigEndian>(f)?,
                    }
                }
            }
        }

        if self.debug_info {
            let mapped: Vec<(usize, &SourceMapping)> = tape
                .source_mappings()
                .iter()
                .enumerate()
                .filter(|(_, mapping)| mapping.is_known())
                .collect();
            writer.write_u16::<BigEndian>(count_u16("source mappings", mapped.len())?)?;
            for (index, mapping) in mapped {
                writer.write_u16::<BigEndian>(to_u16("instruction index", index)?)?;
                writer.write_i32::<BigEndian>(mapping.line)?;
                writer.write_i32::<BigEndian>(mapping.column)?;
            }
        }

        debug!(
            strings = table.strings.len(),
            instructions = tape.len(),
            ref_width = width.bytes(),
            "Encoded tape"
        );
        Ok(())
    }

    pub fn encode_to_vec(&self, tape: &Tape) -> CodecResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.encode(tape, &mut bytes)?;
        Ok(bytes)
    }
}

/// Deserializes tapes, interning every string once into `pool`.
pub struct Decoder<'p> {
    pool: &'p StringPool,
}

impl<'p> Decoder<'p> {
    pub fn new(pool: &'p StringPool) -> Self {
        Self { pool }
    }

    pub fn decode<R: Read>(&self, reader: &mut R) -> CodecResult<Tape> {
        let num_strings = reader.read_u16::<BigEndian>()? as usize;
        let mut strings = Vec::with_capacity(num_strings);
        for index in 0..num_strings {
            strings.push(self.read_string(reader, index)?);
        }
        let width = RefWidth::for_table(num_strings);
        let string_at = |reference: usize| -> CodecResult<Arc<str>> {
            strings
                .get(reference)
                .cloned()
                .ok_or(CodecError::StringRefOutOfRange { reference, count: num_strings })
        };

        let num_functions = reader.read_u16::<BigEndian>()?;
        let mut functions = KeyedList::with_capacity(num_functions as usize);
        for _ in 0..num_functions {
            let name = string_at(reader.read_u16::<BigEndian>()? as usize)?;
            let entry = reader.read_u16::<BigEndian>()? as usize;
            functions.insert(name.clone(), entry).map_err(|_| TapeError::DuplicateFunction {
                name,
                scope: "module scope".to_string(),
            })?;
        }

        let num_classes = reader.read_u16::<BigEndian>()?;
        let mut classes = KeyedList::with_capacity(num_classes as usize);
        for _ in 0..num_classes {
            let name = string_at(reader.read_u16::<BigEndian>()? as usize)?;
            let start = reader.read_u16::<BigEndian>()? as usize;
            let end = reader.read_u16::<BigEndian>()? as usize;
            let num_parents = reader.read_u16::<BigEndian>()?;
            let mut parents = Vec::with_capacity(num_parents as usize);
            for _ in 0..num_parents {
                parents.push(string_at(reader.read_u16::<BigEndian>()? as usize)?);
            }
            let mut class = ClassRef::new(start, end, parents);
            let num_methods = reader.read_u16::<BigEndian>()?;
            for _ in 0..num_methods {
                let method = string_at(reader.read_u16::<BigEndian>()? as usize)?;
                let entry = reader.read_u16::<BigEndian>()? as usize;
                class.methods.insert(method.clone(), entry).map_err(|_| TapeError::DuplicateFunction {
                    name: method,
                    scope: format!("class '{}'", name),
                })?;
            }
            classes
                .insert(name.clone(), class)
                .map_err(|_| TapeError::DuplicateClass(name))?;
        }

        let num_instructions = reader.read_u16::<BigEndian>()? as usize;
        let mut instructions = Vec::with_capacity(num_instructions);
        for index in 0..num_instructions {
            let byte = reader.read_u8()?;
            let op = Op::from_byte(byte).ok_or(CodecError::InvalidOpcode { index, byte })?;
            let tag = reader.read_u8()?;
            let operand = match OperandTag::from_byte(tag) {
                Some(OperandTag::NoArg) => Operand::None,
                Some(OperandTag::Identifier) => Operand::Identifier(string_at(Self::read_ref(reader, width)?)?),
                Some(OperandTag::String) => Operand::String(string_at(Self::read_ref(reader, width)?)?),
                Some(OperandTag::Primitive) => Operand::Primitive(Self::read_primitive(reader, index)?),
                None => return Err(CodecError::InvalidOperandTag { index, tag }),
            };
            instructions.push(Instruction { op, operand });
        }

        let mut source = vec![SourceMapping::NONE; num_instructions];
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest)?;
        if !rest.is_empty() {
            let mut section = Cursor::new(&rest[..]);
            let count = section.read_u16::<BigEndian>()?;
            for _ in 0..count {
                let index = section.read_u16::<BigEndian>()? as usize;
                let line = section.read_i32::<BigEndian>()?;
                let column = section.read_i32::<BigEndian>()?;
                let slot = source.get_mut(index).ok_or(TapeError::IndexOutOfBounds {
                    index,
                    len: num_instructions,
                })?;
                *slot = SourceMapping::new(line, column);
            }
            let remaining = rest.len() - section.position() as usize;
            if remaining > 0 {
                return Err(CodecError::TrailingBytes(remaining));
            }
        }

        let tape = Tape::from_parts(instructions, source, functions, classes)?;
        debug!(strings = num_strings, instructions = tape.len(), "Decoded tape");
        Ok(tape)
    }

    fn read_string<R: Read>(&self, reader: &mut R, index: usize) -> CodecResult<Arc<str>> {
        let mut bytes = Vec::new();
        loop {
            match reader.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        let text = std::str::from_utf8(&bytes).map_err(|_| CodecError::InvalidUtf8(index))?;
        Ok(self.pool.intern(text))
    }

    fn read_ref<R: Read>(reader: &mut R, width: RefWidth) -> CodecResult<usize> {
        Ok(match width {
            RefWidth::Byte => reader.read_u8()? as usize,
            RefWidth::Word => reader.read_u16::<BigEndian>()? as usize,
        })
    }

    fn read_primitive<R: Read>(reader: &mut R, index: usize) -> CodecResult<Primitive> {
        let byte = reader.read_u8()?;
        match PrimitiveType::from_byte(byte) {
            Some(PrimitiveType::Char) => Ok(Primitive::Char(reader.read_i8()?)),
            Some(PrimitiveType::Int) => Ok(Primitive::Int(reader.read_i64::<BigEndian>()?)),
            Some(PrimitiveType::Float) => Ok(Primitive::Float(reader.read_f64::<BigEndian>()?)),
            None => Err(CodecError::InvalidPrimitiveType { index, byte }),
        }
    }
}

/// Encode without the debug section.
pub fn encode(tape: &Tape) -> CodecResult<Vec<u8>> {
    Encoder::new().encode_to_vec(tape)
}

pub fn decode(bytes: &[u8], pool: &StringPool) -> CodecResult<Tape> {
    let mut cursor = Cursor::new(bytes);
    Decoder::new(pool).decode(&mut cursor)
}
