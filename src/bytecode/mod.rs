mod instruction;
mod opcode;
mod tape;
pub mod codec;
pub mod text;

pub use instruction::{Instruction, Operand, OperandTag};
pub use opcode::Op;
pub use tape::{ClassRef, SourceMapping, Tape, TapeError, TapeResult};
pub use codec::{CodecError, CodecResult, Decoder, Encoder, RefWidth};
pub use text::{parse_text, to_text, TextError, TextResult};
