//! Textual assembler for kernel bytecode
//!
//! A small front end used by tests, demos and the CLI. Expressions are
//! written prefix-style and assemble to the exact wire bytecode:
//!
//! - `fmadd(c, a, b)`
//! - `add(mul(a, b), const[0])`
//! - `masked_add(gt(a, b), a, var[1])`
//!
//! Leaves are `a`, `b`, `c`, `mask`, `const[i]`, `var[i]`, `reg[i]`.

use logos::Logos;

use crate::error::{KernelError, KernelResult};
use crate::opcode::{ArgKind, ArithKind, Bytecode, CompareKind, OpToken};

/// Token types for the assembler language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u8>().ok())]
    Number(u8),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token(",")]
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
        }
    }
}

/// Assemble a textual kernel expression into wire bytecode.
pub fn assemble(src: &str) -> KernelResult<Bytecode> {
    let mut parser = AsmParser::new(src);
    let mut codes = Vec::new();
    parser.parse_expr(&mut codes)?;
    if parser.current.is_some() {
        return Err(KernelError::asm(format!(
            "trailing input after expression: {:?}",
            parser.current
        )));
    }
    Bytecode::from_codes(codes)
}

struct AsmParser<'source> {
    lexer: logos::Lexer<'source, Token>,
    current: Option<Token>,
}

impl<'source> AsmParser<'source> {
    fn new(source: &'source str) -> Self {
        let mut lexer = Token::lexer(source);
        let current = lexer.next().and_then(Result::ok);
        Self { lexer, current }
    }

    fn advance(&mut self) -> Option<Token> {
        let prev = self.current.take();
        self.current = self.lexer.next().and_then(Result::ok);
        prev
    }

    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    fn expect(&mut self, expected: Token) -> KernelResult<Token> {
        if self.check(&expected) {
            Ok(self.advance().unwrap())
        } else {
            Err(KernelError::asm(format!(
                "expected {:?}, got {:?}",
                expected, self.current
            )))
        }
    }

    /// Parse one expression, appending its prefix token codes.
    fn parse_expr(&mut self, codes: &mut Vec<u8>) -> KernelResult<()> {
        let name = match self.advance() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(KernelError::asm(format!(
                    "expected operation or operand, got {:?}",
                    other
                )))
            }
        };

        if let Some(op) = operation_for(&name) {
            codes.push(op.encode());
            self.expect(Token::LParen)?;
            for i in 0..op.child_count() {
                if i > 0 {
                    self.expect(Token::Comma)?;
                }
                self.parse_expr(codes)?;
            }
            self.expect(Token::RParen)?;
            return Ok(());
        }

        self.parse_leaf(&name, codes)
    }

    fn parse_leaf(&mut self, name: &str, codes: &mut Vec<u8>) -> KernelResult<()> {
        let kind = match name {
            "a" => ArgKind::A,
            "b" => ArgKind::B,
            "c" => ArgKind::C,
            "mask" => ArgKind::MaskReg,
            "const" => ArgKind::ConstArg,
            "var" => ArgKind::VariableArg,
            "reg" => ArgKind::Reg,
            other => {
                return Err(KernelError::asm(format!("unknown operand {:?}", other)))
            }
        };
        codes.push(OpToken::Arg(kind).encode());
        if kind.has_index() {
            self.expect(Token::LBracket)?;
            let index = match self.advance() {
                Some(Token::Number(n)) if n < 32 => n,
                other => {
                    return Err(KernelError::asm(format!(
                        "expected 5-bit index, got {:?}",
                        other
                    )))
                }
            };
            self.expect(Token::RBracket)?;
            codes.push(index);
        }
        Ok(())
    }
}

fn operation_for(name: &str) -> Option<OpToken> {
    match name {
        "mul" => Some(OpToken::Arith(ArithKind::Mul)),
        "add" => Some(OpToken::Arith(ArithKind::Add)),
        "fmadd" => Some(OpToken::Arith(ArithKind::Fmadd)),
        "sub" => Some(OpToken::Arith(ArithKind::Sub)),
        "div" => Some(OpToken::Arith(ArithKind::Div)),
        "load" => Some(OpToken::Arith(ArithKind::Load)),
        "masked_mul" => Some(OpToken::Masked(ArithKind::Mul)),
        "masked_add" => Some(OpToken::Masked(ArithKind::Add)),
        "masked_sub" => Some(OpToken::Masked(ArithKind::Sub)),
        "masked_div" => Some(OpToken::Masked(ArithKind::Div)),
        "gt" => Some(OpToken::Compare(CompareKind::Gt)),
        "ge" => Some(OpToken::Compare(CompareKind::Ge)),
        "lt" => Some(OpToken::Compare(CompareKind::Lt)),
        "le" => Some(OpToken::Compare(CompareKind::Le)),
        "eq" => Some(OpToken::Compare(CompareKind::Eq)),
        "neq" => Some(OpToken::Compare(CompareKind::Neq)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmadd_wire_format() {
        let bc = assemble("fmadd(c, a, b)").unwrap();
        assert_eq!(bc.to_bits(), "00010100101000010001");
    }

    #[test]
    fn test_indexed_leaf() {
        let bc = assemble("add(mul(a, b), const[0])").unwrap();
        let mut cur = bc.cursor();
        let (add, _) = cur.next_op().unwrap();
        assert_eq!(add, OpToken::Arith(ArithKind::Add));
        let (mul, _) = cur.next_op().unwrap();
        assert_eq!(mul, OpToken::Arith(ArithKind::Mul));
        cur.next_op().unwrap(); // a
        cur.next_op().unwrap(); // b
        let (konst, idx) = cur.next_op().unwrap();
        assert_eq!(konst, OpToken::Arg(ArgKind::ConstArg));
        assert_eq!(idx, Some(0));
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_arity_enforced() {
        assert!(assemble("mul(a)").is_err());
        assert!(assemble("fmadd(c, a)").is_err());
    }

    #[test]
    fn test_unknown_names() {
        assert!(assemble("frobnicate(a, b)").is_err());
        assert!(assemble("mul(a, d)").is_err());
    }

    #[test]
    fn test_index_range() {
        assert!(assemble("const[31]").is_ok());
        assert!(assemble("const[32]").is_err());
    }

    #[test]
    fn test_trailing_input() {
        assert!(assemble("mul(a, b) a").is_err());
    }

    #[test]
    fn test_masked_compare_combination() {
        let bc = assemble("masked_add(gt(a, b), a, var[1])").unwrap();
        // masked_add + gt + 4 leaves + 1 index token
        assert_eq!(bc.len(), 7);
    }
}
