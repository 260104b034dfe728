//! Opcode and bytecode model
//!
//! Kernel bodies arrive as a flat stream of fixed-width 5-bit tokens in
//! prefix notation. The high 2 bits select the category, the low 3 bits
//! the kind within it:
//!
//! - `00` ARITH: MUL, ADD, FMADD, SUB, DIV, LOAD
//! - `01` MASKED_ARITH: masked MUL, ADD, SUB, DIV
//! - `10` ARGREF: A, B, C, CONSTARG, VARIABLEARG, REG, MASKREG
//! - `11` COMPARE: GT, GE, LT, LE, EQ, NEQ
//!
//! ARGREF tokens for CONSTARG/VARIABLEARG/REG are followed by one extra
//! 5-bit token holding a raw index.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Width of one token in bits
pub const TOKEN_BITS: usize = 5;

/// Operation category (high 2 bits of a token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Arith,
    MaskedArith,
    ArgRef,
    Compare,
}

/// Arithmetic kinds (ARITH and MASKED_ARITH categories)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithKind {
    Mul,
    Add,
    Fmadd,
    Sub,
    Div,
    Load,
}

impl ArithKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ArithKind::Mul),
            1 => Some(ArithKind::Add),
            2 => Some(ArithKind::Fmadd),
            3 => Some(ArithKind::Sub),
            4 => Some(ArithKind::Div),
            5 => Some(ArithKind::Load),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            ArithKind::Mul => 0,
            ArithKind::Add => 1,
            ArithKind::Fmadd => 2,
            ArithKind::Sub => 3,
            ArithKind::Div => 4,
            ArithKind::Load => 5,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ArithKind::Mul => "mul",
            ArithKind::Add => "add",
            ArithKind::Fmadd => "fmadd",
            ArithKind::Sub => "sub",
            ArithKind::Div => "div",
            ArithKind::Load => "load",
        }
    }
}

/// Comparison kinds (COMPARE category)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareKind {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Neq,
}

impl CompareKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompareKind::Gt),
            1 => Some(CompareKind::Ge),
            2 => Some(CompareKind::Lt),
            3 => Some(CompareKind::Le),
            4 => Some(CompareKind::Eq),
            5 => Some(CompareKind::Neq),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            CompareKind::Gt => 0,
            CompareKind::Ge => 1,
            CompareKind::Lt => 2,
            CompareKind::Le => 3,
            CompareKind::Eq => 4,
            CompareKind::Neq => 5,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            CompareKind::Gt => "gt",
            CompareKind::Ge => "ge",
            CompareKind::Lt => "lt",
            CompareKind::Le => "le",
            CompareKind::Eq => "eq",
            CompareKind::Neq => "neq",
        }
    }
}

/// Operand-reference kinds (ARGREF category)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgKind {
    A,
    B,
    C,
    ConstArg,
    VariableArg,
    Reg,
    MaskReg,
}

impl ArgKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ArgKind::A),
            1 => Some(ArgKind::B),
            2 => Some(ArgKind::C),
            3 => Some(ArgKind::ConstArg),
            4 => Some(ArgKind::VariableArg),
            5 => Some(ArgKind::Reg),
            6 => Some(ArgKind::MaskReg),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            ArgKind::A => 0,
            ArgKind::B => 1,
            ArgKind::C => 2,
            ArgKind::ConstArg => 3,
            ArgKind::VariableArg => 4,
            ArgKind::Reg => 5,
            ArgKind::MaskReg => 6,
        }
    }

    /// Does this reference carry a trailing 5-bit index token?
    pub fn has_index(self) -> bool {
        matches!(self, ArgKind::ConstArg | ArgKind::VariableArg | ArgKind::Reg)
    }
}

/// A decoded 5-bit operation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpToken {
    Arith(ArithKind),
    Masked(ArithKind),
    Compare(CompareKind),
    Arg(ArgKind),
}

impl OpToken {
    /// Decode a raw 5-bit code; `position` is used for error reporting only.
    pub fn decode(code: u8, position: usize) -> KernelResult<Self> {
        let kind = code & 0b111;
        match (code >> 3) & 0b11 {
            0b00 => ArithKind::from_code(kind).map(OpToken::Arith),
            0b01 => ArithKind::from_code(kind)
                .filter(|k| !matches!(k, ArithKind::Fmadd | ArithKind::Load))
                .map(OpToken::Masked),
            0b10 => ArgKind::from_code(kind).map(OpToken::Arg),
            _ => CompareKind::from_code(kind).map(OpToken::Compare),
        }
        .ok_or_else(|| {
            KernelError::bytecode(position, format!("invalid opcode {code:#07b}"))
        })
    }

    pub fn encode(self) -> u8 {
        match self {
            OpToken::Arith(k) => k.code(),
            OpToken::Masked(k) => 0b01_000 | k.code(),
            OpToken::Arg(k) => 0b10_000 | k.code(),
            OpToken::Compare(k) => 0b11_000 | k.code(),
        }
    }

    pub fn category(self) -> Category {
        match self {
            OpToken::Arith(_) => Category::Arith,
            OpToken::Masked(_) => Category::MaskedArith,
            OpToken::Arg(_) => Category::ArgRef,
            OpToken::Compare(_) => Category::Compare,
        }
    }

    /// Number of operand subtrees the token consumes.
    ///
    /// FMADD is the one three-operand arithmetic token (accumulator first);
    /// LOAD re-materializes a single operand through a register move.
    pub fn child_count(self) -> usize {
        match self {
            OpToken::Arith(ArithKind::Fmadd) => 3,
            OpToken::Arith(ArithKind::Load) => 1,
            OpToken::Arith(_) | OpToken::Compare(_) => 2,
            OpToken::Masked(_) => 3,
            OpToken::Arg(_) => 0,
        }
    }
}

/// An immutable bytecode buffer: a flat sequence of raw 5-bit codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bytecode {
    codes: Vec<u8>,
}

impl Bytecode {
    /// Build from raw 5-bit codes.
    pub fn from_codes(codes: Vec<u8>) -> KernelResult<Self> {
        for (i, &c) in codes.iter().enumerate() {
            if c >= 1 << TOKEN_BITS {
                return Err(KernelError::bytecode(
                    i,
                    format!("code {c} does not fit in {TOKEN_BITS} bits"),
                ));
            }
        }
        Ok(Self { codes })
    }

    /// Decode the wire format: a binary string of concatenated 5-bit
    /// groups, zero-padded to 5 bits each. Whitespace is ignored.
    pub fn from_bits(bits: &str) -> KernelResult<Self> {
        let compact: String = bits.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() % TOKEN_BITS != 0 {
            return Err(KernelError::bytecode(
                compact.len() / TOKEN_BITS,
                format!("bit length {} is not a multiple of {TOKEN_BITS}", compact.len()),
            ));
        }
        let mut codes = Vec::with_capacity(compact.len() / TOKEN_BITS);
        for (i, group) in compact.as_bytes().chunks(TOKEN_BITS).enumerate() {
            let mut code = 0u8;
            for &bit in group {
                code = (code << 1)
                    | match bit {
                        b'0' => 0,
                        b'1' => 1,
                        other => {
                            return Err(KernelError::bytecode(
                                i,
                                format!("invalid bit character {:?}", other as char),
                            ))
                        }
                    };
            }
            codes.push(code);
        }
        Ok(Self { codes })
    }

    /// Encode back to the wire format.
    pub fn to_bits(&self) -> String {
        self.codes
            .iter()
            .map(|c| format!("{c:05b}"))
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor { codes: &self.codes, pos: 0 }
    }
}

/// An explicit position index over an immutable bytecode buffer.
///
/// The parse consumes the stream left to right; the cursor is the only
/// mutable state.
#[derive(Debug)]
pub struct Cursor<'a> {
    codes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Current token position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Tokens left in the stream.
    pub fn remaining(&self) -> usize {
        self.codes.len() - self.pos
    }

    /// Consume one raw 5-bit code.
    pub fn next_code(&mut self) -> KernelResult<u8> {
        let code = *self
            .codes
            .get(self.pos)
            .ok_or_else(|| KernelError::bytecode(self.pos, "bytecode exhausted mid-parse"))?;
        self.pos += 1;
        Ok(code)
    }

    /// Consume one operation token, plus its index token when the
    /// reference kind carries one.
    pub fn next_op(&mut self) -> KernelResult<(OpToken, Option<u8>)> {
        let at = self.pos;
        let op = OpToken::decode(self.next_code()?, at)?;
        let index = match op {
            OpToken::Arg(kind) if kind.has_index() => Some(self.next_code()?),
            _ => None,
        };
        Ok((op, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_tokens() {
        let tokens = [
            OpToken::Arith(ArithKind::Mul),
            OpToken::Arith(ArithKind::Fmadd),
            OpToken::Arith(ArithKind::Load),
            OpToken::Masked(ArithKind::Add),
            OpToken::Compare(CompareKind::Neq),
            OpToken::Arg(ArgKind::A),
            OpToken::Arg(ArgKind::MaskReg),
        ];
        for tok in tokens {
            assert_eq!(OpToken::decode(tok.encode(), 0).unwrap(), tok);
        }
        assert_eq!(tokens[0].category(), Category::Arith);
        assert_eq!(tokens[3].category(), Category::MaskedArith);
        assert_eq!(tokens[4].category(), Category::Compare);
        assert_eq!(tokens[5].category(), Category::ArgRef);
    }

    #[test]
    fn test_masked_fmadd_rejected() {
        // category 01, kind 2 (FMADD) is not a valid masked op
        let code = 0b01_010;
        assert!(OpToken::decode(code, 0).is_err());
    }

    #[test]
    fn test_bits_roundtrip() {
        // fmadd c a b  ->  00010 10010 10000 10001
        let bc = Bytecode::from_bits("00010 10010 10000 10001").unwrap();
        assert_eq!(bc.len(), 4);
        assert_eq!(bc.to_bits(), "00010100101000010001");

        let mut cur = bc.cursor();
        let (op, idx) = cur.next_op().unwrap();
        assert_eq!(op, OpToken::Arith(ArithKind::Fmadd));
        assert_eq!(idx, None);
        assert_eq!(op.child_count(), 3);
    }

    #[test]
    fn test_argref_consumes_index() {
        // constarg 3
        let bc = Bytecode::from_codes(vec![0b10_011, 3]).unwrap();
        let mut cur = bc.cursor();
        let (op, idx) = cur.next_op().unwrap();
        assert_eq!(op, OpToken::Arg(ArgKind::ConstArg));
        assert_eq!(idx, Some(3));
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_exhausted_index_token() {
        // vararg with no trailing index token
        let bc = Bytecode::from_codes(vec![0b10_100]).unwrap();
        let mut cur = bc.cursor();
        assert!(matches!(
            cur.next_op(),
            Err(KernelError::Bytecode { position: 1, .. })
        ));
    }

    #[test]
    fn test_bad_bit_length() {
        assert!(Bytecode::from_bits("0101").is_err());
    }
}
