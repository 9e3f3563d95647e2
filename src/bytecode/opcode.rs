/// Opcodes for the VM.
///
/// Discriminants are the opcode bytes of the binary tape format and must stay
/// dense: `Op::BOUND` is the number of real opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Control
    Nop = 0,       // No operation
    Exit = 1,      // Finish the task with the top of the stack

    // Stack manipulation
    Push = 2,      // Push operand (literal, or value bound to an identifier)
    Pnil = 3,      // Push None
    Peek = 4,      // Push copy of the value n slots below the top
    Dup = 5,       // Duplicate top value
    Pop = 6,       // Discard top value
    Swap = 7,      // Swap top two values

    // Locals
    Let = 8,       // Bind a new local from the top value
    Set = 9,       // Reassign an existing local from the top value

    // Logic and comparison
    Not = 10,      // Language negation: None -> 1, anything else -> None
    Notc = 11,     // C negation: zero -> 1, non-zero -> 0
    Gt = 12,
    Lt = 13,
    Eq = 14,
    Neq = 15,
    Gte = 16,
    Lte = 17,
    And = 18,
    Or = 19,
    Xor = 20,

    // Control flow
    If = 21,       // Pop; relative jump when truthy
    Ifn = 22,      // Pop; relative jump when not truthy
    Jmp = 23,      // Relative jump
    Goto = 24,     // Absolute jump

    // Arithmetic
    Add = 25,
    Sub = 26,
    Mult = 27,
    Div = 28,
    Mod = 29,
    Neg = 30,
    Inc = 31,
    Dec = 32,

    // Bitwise
    Band = 33,
    Bor = 34,
    Bxor = 35,
    Bnot = 36,
    Lshf = 37,
    Rshf = 38,

    // Calls
    Call = 39,     // Call function by name, or callee popped from the stack
    Clln = 40,     // Call method on a receiver
    Ret = 41,      // Return top value to the caller

    // Objects
    Get = 42,      // Read member
    Fld = 43,      // Write member
    Is = 44,       // Instance-of test against a class name
    Cls = 45,      // Push class reflection object of a value
    Copy = 46,     // Shallow copy
    Str = 47,      // Render value into a string object

    // Arrays
    Anew = 48,     // New array from the top n values
    Aidx = 49,     // Indexed read
    Aset = 50,     // Indexed write
    Alen = 51,     // Length
    Apsh = 52,     // Append

    // Named lists
    Nlst = 53,     // New empty named list
    Nget = 54,     // Read named entry
    Nset = 55,     // Write named entry

    // Exceptions
    Rais = 56,     // Raise the top value
    Ctch = 57,     // Install (target) or remove (no operand) a catch handler

    // Suspension
    Wait = 58,     // Wait for an async result
    Slep = 59,     // Timed wait in milliseconds
    Lock = 60,     // Acquire the monitor of an object
    Unlk = 61,     // Release the monitor of an object

    // Misc
    Prnt = 62,     // Print top value
    Lmdl = 63,     // Push reflection object of a module
}

const ALL: [Op; Op::BOUND] = [
    Op::Nop, Op::Exit, Op::Push, Op::Pnil, Op::Peek, Op::Dup, Op::Pop, Op::Swap,
    Op::Let, Op::Set, Op::Not, Op::Notc, Op::Gt, Op::Lt, Op::Eq, Op::Neq,
    Op::Gte, Op::Lte, Op::And, Op::Or, Op::Xor, Op::If, Op::Ifn, Op::Jmp,
    Op::Goto, Op::Add, Op::Sub, Op::Mult, Op::Div, Op::Mod, Op::Neg, Op::Inc,
    Op::Dec, Op::Band, Op::Bor, Op::Bxor, Op::Bnot, Op::Lshf, Op::Rshf, Op::Call,
    Op::Clln, Op::Ret, Op::Get, Op::Fld, Op::Is, Op::Cls, Op::Copy, Op::Str,
    Op::Anew, Op::Aidx, Op::Aset, Op::Alen, Op::Apsh, Op::Nlst, Op::Nget, Op::Nset,
    Op::Rais, Op::Ctch, Op::Wait, Op::Slep, Op::Lock, Op::Unlk, Op::Prnt, Op::Lmdl,
];

impl Op {
    /// Sentinel one past the last opcode byte.
    pub const BOUND: usize = 64;

    /// Convert a byte to an opcode
    pub fn from_byte(byte: u8) -> Option<Self> {
        ALL.get(byte as usize).copied()
    }

    /// Convert an opcode to a byte
    pub fn to_byte(&self) -> u8 {
        *self as u8
    }

    pub fn all() -> &'static [Op] {
        &ALL
    }

    /// Assembly mnemonic
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Nop => "NOP",
            Op::Exit => "EXIT",
            Op::Push => "PUSH",
            Op::Pnil => "PNIL",
            Op::Peek => "PEEK",
            Op::Dup => "DUP",
            Op::Pop => "POP",
            Op::Swap => "SWAP",
            Op::Let => "LET",
            Op::Set => "SET",
            Op::Not => "NOT",
            Op::Notc => "NOTC",
            Op::Gt => "GT",
            Op::Lt => "LT",
            Op::Eq => "EQ",
            Op::Neq => "NEQ",
            Op::Gte => "GTE",
            Op::Lte => "LTE",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Xor => "XOR",
            Op::If => "IF",
            Op::Ifn => "IFN",
            Op::Jmp => "JMP",
            Op::Goto => "GOTO",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mult => "MULT",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Neg => "NEG",
            Op::Inc => "INC",
            Op::Dec => "DEC",
            Op::Band => "BAND",
            Op::Bor => "BOR",
            Op::Bxor => "BXOR",
            Op::Bnot => "BNOT",
            Op::Lshf => "LSHF",
            Op::Rshf => "RSHF",
            Op::Call => "CALL",
            Op::Clln => "CLLN",
            Op::Ret => "RET",
            Op::Get => "GET",
            Op::Fld => "FLD",
            Op::Is => "IS",
            Op::Cls => "CLS",
            Op::Copy => "COPY",
            Op::Str => "STR",
            Op::Anew => "ANEW",
            Op::Aidx => "AIDX",
            Op::Aset => "ASET",
            Op::Alen => "ALEN",
            Op::Apsh => "APSH",
            Op::Nlst => "NLST",
            Op::Nget => "NGET",
            Op::Nset => "NSET",
            Op::Rais => "RAIS",
            Op::Ctch => "CTCH",
            Op::Wait => "WAIT",
            Op::Slep => "SLEP",
            Op::Lock => "LOCK",
            Op::Unlk => "UNLK",
            Op::Prnt => "PRNT",
            Op::Lmdl => "LMDL",
        }
    }

    /// Case-insensitive mnemonic lookup
    pub fn from_mnemonic(text: &str) -> Option<Self> {
        ALL.iter().copied().find(|op| op.mnemonic().eq_ignore_ascii_case(text))
    }
}

impl From<Op> for u8 {
    fn from(op: Op) -> Self {
        op.to_byte()
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Op::from_byte(byte).ok_or(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_dense_and_ordered() {
        assert_eq!(Op::all().len(), Op::BOUND);
        for (index, op) in Op::all().iter().enumerate() {
            assert_eq!(op.to_byte() as usize, index, "{:?} is out of place", op);
        }
    }

    #[test]
    fn test_byte_to_opcode_conversion() {
        assert_eq!(Op::from_byte(0), Some(Op::Nop));
        assert_eq!(Op::from_byte(2), Some(Op::Push));
        assert_eq!(Op::from_byte(41), Some(Op::Ret));
        assert_eq!(Op::from_byte(63), Some(Op::Lmdl));
        assert_eq!(Op::from_byte(Op::BOUND as u8), None);
        assert_eq!(Op::from_byte(0xFF), None);
    }

    #[test]
    fn test_try_from_trait() {
        assert_eq!(Op::try_from(56u8), Ok(Op::Rais));
        assert_eq!(Op::try_from(200u8), Err(200));
        let byte: u8 = Op::Ctch.into();
        assert_eq!(byte, 57);
    }

    #[test]
    fn test_mnemonics_round_trip() {
        for op in Op::all() {
            assert_eq!(Op::from_mnemonic(op.mnemonic()), Some(*op));
        }
        assert_eq!(Op::from_mnemonic("push"), Some(Op::Push));
        assert_eq!(Op::from_mnemonic("BOGUS"), None);
    }

    #[test]
    fn test_not_and_notc_are_distinct() {
        assert_ne!(Op::Not, Op::Notc);
        assert_ne!(Op::Not.to_byte(), Op::Notc.to_byte());
    }
}
