use std::fmt;
use std::sync::Arc;
use crate::bytecode::Op;
use crate::entity::Primitive;

/// Operand tag byte of the binary tape format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandTag {
    NoArg = 0,
    Identifier = 1,
    String = 2,
    Primitive = 3,
}

impl OperandTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(OperandTag::NoArg),
            1 => Some(OperandTag::Identifier),
            2 => Some(OperandTag::String),
            3 => Some(OperandTag::Primitive),
            _ => None,
        }
    }
}

/// The single operand an instruction carries; the variant is the tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Operand {
    #[default]
    None,
    Identifier(Arc<str>),
    String(Arc<str>),
    Primitive(Primitive),
}

impl Operand {
    pub fn tag(&self) -> OperandTag {
        match self {
            Operand::None => OperandTag::NoArg,
            Operand::Identifier(_) => OperandTag::Identifier,
            Operand::String(_) => OperandTag::String,
            Operand::Primitive(_) => OperandTag::Primitive,
        }
    }

    /// Text of an identifier or string operand
    pub fn text(&self) -> Option<&Arc<str>> {
        match self {
            Operand::Identifier(s) | Operand::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn identifier(&self) -> Option<&Arc<str>> {
        match self {
            Operand::Identifier(s) => Some(s),
            _ => None,
        }
    }

    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            Operand::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    /// Integer view of a primitive operand (jump offsets, counts, targets)
    pub fn int(&self) -> Option<i64> {
        match self {
            Operand::Primitive(Primitive::Float(_)) => None,
            Operand::Primitive(p) => Some(p.as_int()),
            _ => None,
        }
    }
}

/// Represents a single bytecode instruction with its operand
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            operand: Operand::None,
        }
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operand = operand;
        self
    }

    pub fn with_identifier(self, name: impl Into<Arc<str>>) -> Self {
        self.with_operand(Operand::Identifier(name.into()))
    }

    pub fn with_string(self, text: impl Into<Arc<str>>) -> Self {
        self.with_operand(Operand::String(text.into()))
    }

    pub fn with_primitive(self, value: Primitive) -> Self {
        self.with_operand(Operand::Primitive(value))
    }

    pub fn with_int(self, value: i64) -> Self {
        self.with_primitive(Primitive::Int(value))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Identifier(name) => write!(f, " {}", name),
            Operand::String(text) => write!(f, " {:?}", text),
            Operand::Primitive(p) => write!(f, " {}", p),
        }
    }
}
