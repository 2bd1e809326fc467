//! Step-condition language.
//!
//! A deliberately small boolean expression grammar:
//!
//! ```text
//! or      := and (("or" | "||") and)*
//! and     := unary (("and" | "&&") unary)*
//! unary   := ("not" | "!") unary | compare
//! compare := primary (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") primary)?
//! primary := number | string | "true" | "false" | "null"
//!          | path | "(" or ")" | "[" (or ("," or)*)? "]"
//! path    := ident ("." ident)*
//! number  := "-"? digit (digit | ".")*
//! ```
//!
//! There are no function calls, assignments or loops; evaluating an `Expr`
//! can only read the values handed to it.

use thiserror::Error;

pub const MAX_EXPR_LEN: usize = 1024;
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("expression longer than {MAX_EXPR_LEN} bytes")]
    TooLong,
    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown identifier {0}")]
    UnknownIdentifier(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("condition did not evaluate to a boolean")]
    NotBoolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    AndAnd,
    OrOr,
    Bang,
    Op(CompareOp),
}

/// Parse a condition into an AST.
pub fn parse(source: &str) -> Result<Expr, ConditionError> {
    if source.len() > MAX_EXPR_LEN {
        return Err(ConditionError::TooLong);
    }
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(ConditionError::Parse(format!("unexpected trailing {tok:?}"))),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    (_, true) => CompareOp::Ge,
                    (_, false) => CompareOp::Gt,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    match chars[j].1 {
                        '\\' if j + 1 < chars.len() => {
                            text.push(chars[j + 1].1);
                            j += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        ch => {
                            text.push(ch);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString(offset));
                }
                tokens.push(Token::Str(text));
                i = j;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map_or(source.len(), |(o, _)| *o);
                let literal = &source[offset..end];
                let value: f64 = literal
                    .parse()
                    .map_err(|_| ConditionError::InvalidNumber(literal.to_string()))?;
                tokens.push(Token::Number(value));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                    j += 1;
                }
                let end = chars.get(j).map_or(source.len(), |(o, _)| *o);
                let word = &source[offset..end];
                tokens.push(match word {
                    "in" => Token::Op(CompareOp::In),
                    _ => Token::Ident(word.to_string()),
                });
                i = j;
            }
            other => return Err(ConditionError::UnexpectedChar(other, offset)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), ConditionError> {
        match self.bump() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(ConditionError::Parse(format!("expected {want:?}, found {tok:?}"))),
            None => Err(ConditionError::Parse(format!("expected {want:?}, found end of input"))),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn enter(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConditionError::TooDeep);
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        self.enter()?;
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) || self.is_keyword("or") {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.leave();
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::AndAnd)) || self.is_keyword("and") {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.peek(), Some(Token::Bang)) || self.is_keyword("not") {
            self.bump();
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.bump();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.enter()?;
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        items.push(self.parse_or()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                self.leave();
                Ok(Expr::List(items))
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "and" | "or" | "not" => Err(ConditionError::Parse(format!(
                    "unexpected keyword {word:?}"
                ))),
                _ => {
                    let mut path = vec![word];
                    while matches!(self.peek(), Some(Token::Dot)) {
                        self.bump();
                        match self.bump() {
                            Some(Token::Ident(seg)) => path.push(seg),
                            other => {
                                return Err(ConditionError::Parse(format!(
                                    "expected field name after '.', found {other:?}"
                                )))
                            }
                        }
                    }
                    Ok(Expr::Path(path))
                }
            },
            Some(tok) => Err(ConditionError::Parse(format!("unexpected {tok:?}"))),
            None => Err(ConditionError::Parse("unexpected end of input".to_string())),
        }
    }
}
