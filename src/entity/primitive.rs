use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Arithmetic failures on primitive operands
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArithmeticError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("Operation '{op}' requires integer operands, found {found}")]
    NotAnInteger { op: &'static str, found: PrimitiveType },

    #[error("Cannot shift by negative amount {0}")]
    NegativeShift(i64),
}

/// Discriminant of a [`Primitive`], also used as the primitive type byte in
/// the binary tape format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Char = 0,
    Int = 1,
    Float = 2,
}

impl PrimitiveType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PrimitiveType::Char),
            1 => Some(PrimitiveType::Int),
            2 => Some(PrimitiveType::Float),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveType::Char => "char",
            PrimitiveType::Int => "int",
            PrimitiveType::Float => "float",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar value. Integers are 64-bit everywhere, including the wire format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Char(i8),
    Int(i64),
    Float(f64),
}

impl Primitive {
    pub fn primitive_type(&self) -> PrimitiveType {
        match self {
            Primitive::Char(_) => PrimitiveType::Char,
            Primitive::Int(_) => PrimitiveType::Int,
            Primitive::Float(_) => PrimitiveType::Float,
        }
    }

    /// Integer view; floats truncate toward zero.
    pub fn as_int(&self) -> i64 {
        match *self {
            Primitive::Char(c) => c as i64,
            Primitive::Int(i) => i,
            Primitive::Float(f) => f as i64,
        }
    }

    pub fn as_float(&self) -> f64 {
        match *self {
            Primitive::Char(c) => c as f64,
            Primitive::Int(i) => i as f64,
            Primitive::Float(f) => f,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Primitive::Char(c) => c == 0,
            Primitive::Int(i) => i == 0,
            Primitive::Float(f) => f == 0.0,
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, Primitive::Float(_))
    }

    fn integer(&self, op: &'static str) -> Result<i64, ArithmeticError> {
        match *self {
            Primitive::Float(_) => Err(ArithmeticError::NotAnInteger {
                op,
                found: PrimitiveType::Float,
            }),
            other => Ok(other.as_int()),
        }
    }

    pub fn add(self, other: Primitive) -> Primitive {
        if self.is_float() || other.is_float() {
            Primitive::Float(self.as_float() + other.as_float())
        } else {
            Primitive::Int(self.as_int().wrapping_add(other.as_int()))
        }
    }

    pub fn sub(self, other: Primitive) -> Primitive {
        if self.is_float() || other.is_float() {
            Primitive::Float(self.as_float() - other.as_float())
        } else {
            Primitive::Int(self.as_int().wrapping_sub(other.as_int()))
        }
    }

    pub fn mul(self, other: Primitive) -> Primitive {
        if self.is_float() || other.is_float() {
            Primitive::Float(self.as_float() * other.as_float())
        } else {
            Primitive::Int(self.as_int().wrapping_mul(other.as_int()))
        }
    }

    pub fn div(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        if other.is_zero() {
            return Err(ArithmeticError::DivisionByZero);
        }
        if self.is_float() || other.is_float() {
            Ok(Primitive::Float(self.as_float() / other.as_float()))
        } else {
            Ok(Primitive::Int(self.as_int().wrapping_div(other.as_int())))
        }
    }

    pub fn rem(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        if other.is_zero() {
            return Err(ArithmeticError::DivisionByZero);
        }
        if self.is_float() || other.is_float() {
            Ok(Primitive::Float(self.as_float() % other.as_float()))
        } else {
            Ok(Primitive::Int(self.as_int().wrapping_rem(other.as_int())))
        }
    }

    pub fn neg(self) -> Primitive {
        match self {
            Primitive::Char(c) => Primitive::Char(c.wrapping_neg()),
            Primitive::Int(i) => Primitive::Int(i.wrapping_neg()),
            Primitive::Float(f) => Primitive::Float(-f),
        }
    }

    /// Add `delta`, keeping the operand's own type.
    pub fn step(self, delta: i8) -> Primitive {
        match self {
            Primitive::Char(c) => Primitive::Char(c.wrapping_add(delta)),
            Primitive::Int(i) => Primitive::Int(i.wrapping_add(delta as i64)),
            Primitive::Float(f) => Primitive::Float(f + delta as f64),
        }
    }

    pub fn bit_and(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        Ok(Primitive::Int(self.integer("&")? & other.integer("&")?))
    }

    pub fn bit_or(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        Ok(Primitive::Int(self.integer("|")? | other.integer("|")?))
    }

    pub fn bit_xor(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        Ok(Primitive::Int(self.integer("^")? ^ other.integer("^")?))
    }

    pub fn bit_not(self) -> Result<Primitive, ArithmeticError> {
        Ok(Primitive::Int(!self.integer("~")?))
    }

    pub fn shift_left(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        let amount = other.integer("<<")?;
        if amount < 0 {
            return Err(ArithmeticError::NegativeShift(amount));
        }
        let value = self.integer("<<")?;
        // Every bit is shifted out at 64 and beyond.
        Ok(Primitive::Int(if amount >= 64 { 0 } else { value << amount as u32 }))
    }

    pub fn shift_right(self, other: Primitive) -> Result<Primitive, ArithmeticError> {
        let amount = other.integer(">>")?;
        if amount < 0 {
            return Err(ArithmeticError::NegativeShift(amount));
        }
        let value = self.integer(">>")?;
        // Arithmetic shift: only the sign is left at 64 and beyond.
        Ok(Primitive::Int(if amount >= 64 { value >> 63 } else { value >> amount as u32 }))
    }

    /// Numeric comparison with int/float promotion. `None` only for NaN.
    pub fn compare(&self, other: &Primitive) -> Option<Ordering> {
        if self.is_float() || other.is_float() {
            self.as_float().partial_cmp(&other.as_float())
        } else {
            Some(self.as_int().cmp(&other.as_int()))
        }
    }

    /// Numeric equality with promotion, so `Int(1)` equals `Float(1.0)`.
    pub fn equals(&self, other: &Primitive) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Primitive::Char(c) => write!(f, "{}", c as u8 as char),
            Primitive::Int(i) => write!(f, "{}", i),
            Primitive::Float(fl) => write!(f, "{}", fl),
        }
    }
}

impl From<i64> for Primitive {
    fn from(value: i64) -> Self {
        Primitive::Int(value)
    }
}

impl From<f64> for Primitive {
    fn from(value: f64) -> Self {
        Primitive::Float(value)
    }
}

impl From<i8> for Primitive {
    fn from(value: i8) -> Self {
        Primitive::Char(value)
    }
}
