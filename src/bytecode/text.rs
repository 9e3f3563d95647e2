//! Textual assembly form of a tape.
//!
//! ```text
//! @main
//! PUSH "hello"  ; line=1, col=5
//! PRNT
//! RET
//! class Point : Shape
//! @new
//! RET
//! endclass
//! ```

use std::fmt::Write as _;
use std::str::Chars;
use std::iter::Peekable;
use std::sync::Arc;
use thiserror::Error;
use crate::bytecode::{Instruction, Op, Operand, Tape, TapeError};
use crate::entity::Primitive;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TextError {
    #[error("line {line}: unknown mnemonic '{text}'")]
    UnknownMnemonic { line: usize, text: String },

    #[error("line {line}: invalid operand: {message}")]
    InvalidOperand { line: usize, message: String },

    #[error("line {line}: unexpected text after operand: '{text}'")]
    TrailingText { line: usize, text: String },

    #[error("line {line}: {source}")]
    Tape { line: usize, source: TapeError },
}

pub type TextResult<T> = Result<T, TextError>;

fn escape_into(out: &mut String, c: char, quote: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\t' => out.push_str("\\t"),
        '\r' => out.push_str("\\r"),
        c if c == quote => {
            out.push('\\');
            out.push(c);
        }
        c if (c as u32) < 0x20 || c as u32 == 0x7f => {
            let _ = write!(out, "\\x{:02x}", c as u32);
        }
        c => out.push(c),
    }
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        ".nan".to_string()
    } else if value.is_infinite() {
        (if value > 0.0 { ".inf" } else { "-.inf" }).to_string()
    } else {
        format!("{:?}", value)
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Identifier(name) => name.to_string(),
        Operand::String(text) => {
            let mut out = String::with_capacity(text.len() + 2);
            out.push('"');
            for c in text.chars() {
                escape_into(&mut out, c, '"');
            }
            out.push('"');
            out
        }
        Operand::Primitive(Primitive::Int(i)) => i.to_string(),
        Operand::Primitive(Primitive::Float(f)) => format_float(*f),
        Operand::Primitive(Primitive::Char(c)) => {
            let byte = *c as u8;
            let mut out = String::from("'");
            if byte.is_ascii() {
                escape_into(&mut out, byte as char, '\'');
            } else {
                let _ = write!(out, "\\x{:02x}", byte);
            }
            out.push('\'');
            out
        }
    }
}

/// Render a tape in assembly form, markers interleaved in index order.
pub fn to_text(tape: &Tape) -> String {
    let mut out = String::new();
    let classes: Vec<_> = tape.classes().iter().collect();
    let mut open: Option<usize> = None;

    for index in 0..=tape.len() {
        if let Some(current) = open {
            if classes[current].1.end == index {
                out.push_str("endclass\n");
                open = None;
            }
        }
        for (position, (name, class)) in classes.iter().enumerate() {
            if class.start != index {
                continue;
            }
            out.push_str("class ");
            out.push_str(name);
            if !class.parents.is_empty() {
                let parents: Vec<&str> = class.parents.iter().map(|p| &**p).collect();
                let _ = write!(out, " : {}", parents.join(", "));
            }
            out.push('\n');
            if class.end == index {
                out.push_str("endclass\n");
            } else {
                open = Some(position);
            }
        }
        if let Some(current) = open {
            for (method, &entry) in classes[current].1.methods.iter() {
                if entry == index {
                    let _ = writeln!(out, "@{}", method);
                }
            }
        } else {
            for (name, &entry) in tape.functions().iter() {
                if entry == index {
                    let _ = writeln!(out, "@{}", name);
                }
            }
        }

        if let Some(instruction) = tape.instruction(index) {
            out.push_str(instruction.op.mnemonic());
            if instruction.operand != Operand::None {
                out.push(' ');
                out.push_str(&format_operand(&instruction.operand));
            }
            let source = tape.source(index);
            if source.is_known() {
                let _ = write!(out, "  ; line={}, col={}", source.line, source.column);
            }
            out.push('\n');
        }
    }
    out
}

struct LineParser<'a> {
    line: usize,
    chars: Peekable<Chars<'a>>,
}

impl<'a> LineParser<'a> {
    fn error(&self, message: impl Into<String>) -> TextError {
        TextError::InvalidOperand {
            line: self.line,
            message: message.into(),
        }
    }

    fn escaped(&mut self) -> TextResult<char> {
        match self.chars.next() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some('x') => {
                let hex: String = self.chars.by_ref().take(2).collect();
                u8::from_str_radix(&hex, 16)
                    .map(|b| b as char)
                    .map_err(|_| self.error(format!("bad hex escape '\\x{}'", hex)))
            }
            Some(c @ ('\\' | '"' | '\'')) => Ok(c),
            Some(c) => Err(self.error(format!("unknown escape '\\{}'", c))),
            None => Err(self.error("unterminated escape")),
        }
    }

    fn string(&mut self) -> TextResult<String> {
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(text),
                Some('\\') => text.push(self.escaped()?),
                Some(c) => text.push(c),
                None => return Err(self.error("unterminated string literal")),
            }
        }
    }

    fn char_literal(&mut self) -> TextResult<i8> {
        let value = match self.chars.next() {
            Some('\\') => self.escaped()?,
            Some(c) => c,
            None => return Err(self.error("unterminated char literal")),
        };
        if self.chars.next() != Some('\'') {
            return Err(self.error("char literal must hold exactly one character"));
        }
        let code = value as u32;
        if code > 0xff {
            return Err(self.error(format!("char '{}' does not fit in a byte", value)));
        }
        Ok(code as u8 as i8)
    }

    fn token(&mut self) -> String {
        let mut token = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || c == ';' {
                break;
            }
            token.push(c);
            self.chars.next();
        }
        token
    }

    fn number(&self, token: &str) -> TextResult<Primitive> {
        match token {
            ".nan" => return Ok(Primitive::Float(f64::NAN)),
            ".inf" => return Ok(Primitive::Float(f64::INFINITY)),
            "-.inf" => return Ok(Primitive::Float(f64::NEG_INFINITY)),
            _ => {}
        }
        if token.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
            token
                .parse::<f64>()
                .map(Primitive::Float)
                .map_err(|_| self.error(format!("bad float '{}'", token)))
        } else {
            token
                .parse::<i64>()
                .map(Primitive::Int)
                .map_err(|_| self.error(format!("bad integer '{}'", token)))
        }
    }

    fn operand(&mut self) -> TextResult<Operand> {
        match self.chars.peek().copied() {
            None | Some(';') => Ok(Operand::None),
            Some('"') => {
                self.chars.next();
                Ok(Operand::String(Arc::from(self.string()?)))
            }
            Some('\'') => {
                self.chars.next();
                Ok(Operand::Primitive(Primitive::Char(self.char_literal()?)))
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let token = self.token();
                Ok(Operand::Primitive(self.number(&token)?))
            }
            Some(_) => Ok(Operand::Identifier(Arc::from(self.token()))),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.peek().map_or(false, |c| c.is_whitespace()) {
            self.chars.next();
        }
    }
}

/// Parse `line=<n>, col=<m>`; other comments are ignored.
fn parse_mapping(comment: &str) -> Option<(i32, i32)> {
    let mut line = None;
    let mut column = None;
    for part in comment.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        match key.trim() {
            "line" => line = value.trim().parse().ok(),
            "col" => column = value.trim().parse().ok(),
            _ => {}
        }
    }
    Some((line?, column?))
}

/// Assemble the textual form back into a tape.
pub fn parse_text(text: &str) -> TextResult<Tape> {
    let mut tape = Tape::new();
    let mut last_line = 0;
    for (number, raw) in text.lines().enumerate() {
        let line = number + 1;
        last_line = line;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let tape_err = |source| TextError::Tape { line, source };

        if let Some(name) = trimmed.strip_prefix('@') {
            let name = name.split(';').next().unwrap_or_default().trim();
            tape.begin_function(name).map_err(tape_err)?;
            continue;
        }
        let header = trimmed.split(';').next().unwrap_or_default().trim();
        if header == "endclass" {
            tape.end_class().map_err(tape_err)?;
            continue;
        }
        if let Some(rest) = header.strip_prefix("class ") {
            let (name, parents) = match rest.split_once(':') {
                Some((name, parents)) => (
                    name.trim(),
                    parents
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(Arc::from)
                        .collect(),
                ),
                None => (rest.trim(), Vec::new()),
            };
            tape.begin_class(name, parents).map_err(tape_err)?;
            continue;
        }

        let mut parser = LineParser {
            line,
            chars: trimmed.chars().peekable(),
        };
        let mnemonic = parser.token();
        let op = Op::from_mnemonic(&mnemonic).ok_or_else(|| TextError::UnknownMnemonic {
            line,
            text: mnemonic.clone(),
        })?;
        parser.skip_whitespace();
        let operand = parser.operand()?;
        parser.skip_whitespace();

        let rest: String = parser.chars.collect();
        let position = tape.append(Instruction { op, operand });
        if rest.is_empty() {
            continue;
        }
        match rest.strip_prefix(';') {
            Some(comment) => {
                if let Some((l, c)) = parse_mapping(comment) {
                    tape.set_source(position, l, c).map_err(tape_err)?;
                }
            }
            None => return Err(TextError::TrailingText { line, text: rest }),
        }
    }
    tape.validate().map_err(|source| TextError::Tape {
        line: last_line,
        source,
    })?;
    Ok(tape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::SourceMapping;

    const SAMPLE: &str = "\
@main
PUSH \"hi; there\\n\"  ; line=1, col=5
PRNT
PUSH 'a'
PUSH '\\''
PUSH -12
PUSH 2.5
PUSH .nan
CALL module.fn
RET
class A
@foo
PUSH self
RET
endclass
class B : A
@bar
PNIL
RET
endclass
";

    #[test]
    fn test_parse_sample() {
        let tape = parse_text(SAMPLE).unwrap();
        assert_eq!(tape.len(), 13);
        assert_eq!(tape.function_entry("main"), Some(0));
        assert_eq!(
            tape.instruction(0).map(|i| i.operand.clone()),
            Some(Operand::String(Arc::from("hi; there\n")))
        );
        assert_eq!(tape.source(0), SourceMapping::new(1, 5));
        assert_eq!(tape.source(1), SourceMapping::NONE);
        assert_eq!(tape.instruction(2).and_then(|i| i.operand.primitive()), Some(Primitive::Char(b'a' as i8)));
        assert_eq!(tape.instruction(3).and_then(|i| i.operand.primitive()), Some(Primitive::Char(b'\'' as i8)));
        assert_eq!(tape.instruction(4).and_then(|i| i.operand.int()), Some(-12));
        assert_eq!(tape.instruction(5).and_then(|i| i.operand.primitive()), Some(Primitive::Float(2.5)));
        assert_eq!(tape.instruction(7).and_then(|i| i.operand.identifier().cloned()), Some(Arc::from("module.fn")));

        let a = tape.class("A").unwrap();
        assert_eq!((a.start, a.end), (9, 11));
        assert_eq!(a.methods.get("foo"), Some(&9));
        let b = tape.class("B").unwrap();
        assert_eq!(b.parents, vec![Arc::from("A")]);
        assert_eq!(b.methods.get("bar"), Some(&11));
    }

    #[test]
    fn test_render_then_parse_is_stable() {
        let tape = parse_text(SAMPLE).unwrap();
        let rendered = to_text(&tape);
        let reparsed = parse_text(&rendered).unwrap();
        assert_eq!(reparsed.functions(), tape.functions());
        assert_eq!(reparsed.classes(), tape.classes());
        assert_eq!(reparsed.source_mappings(), tape.source_mappings());
        assert_eq!(to_text(&reparsed), rendered);
    }

    #[test]
    fn test_render_format() {
        let mut tape = Tape::new();
        tape.begin_function("main").unwrap();
        let at = tape.append(Instruction::new(Op::Push).with_int(1));
        tape.set_source(at, 2, 3).unwrap();
        tape.append(Instruction::new(Op::Push).with_primitive(Primitive::Float(1.0)));
        tape.append(Instruction::new(Op::Ret));
        assert_eq!(
            to_text(&tape),
            "@main\nPUSH 1  ; line=2, col=3\nPUSH 1.0\nRET\n"
        );
    }

    #[test]
    fn test_errors_report_line() {
        assert_eq!(
            parse_text("NOP\nFROB 1\n").unwrap_err(),
            TextError::UnknownMnemonic { line: 2, text: "FROB".to_string() }
        );
        assert!(matches!(
            parse_text("PUSH \"open\n"),
            Err(TextError::InvalidOperand { line: 1, .. })
        ));
        assert!(matches!(
            parse_text("PUSH 1 2\n"),
            Err(TextError::TrailingText { line: 1, .. })
        ));
        assert!(matches!(
            parse_text("class A\nclass B\n"),
            Err(TextError::Tape { line: 2, source: TapeError::NestedClass { .. } })
        ));
        assert!(matches!(
            parse_text("class A\nNOP\n"),
            Err(TextError::Tape { source: TapeError::UnclosedClass(_), .. })
        ));
    }
}
