//! Recursive-descent parser.
//!
//! ```text
//! expr  := or
//! or    := and ( ( ',' | '||' | 'OR' ) and )*
//! and   := unary ( ( ';' | '&&' | 'AND' ) unary )*
//! unary := '(' expr ')' | field OP value
//! ```
//!
//! A `,` in value position belongs to the tuple/range being parsed, never to
//! the OR separator; the grammar is unambiguous because tuples only appear
//! directly after an operator.

use super::ast::{Comparison, FilterNode, FilterValue, Op};
use super::lexer::{snippet, tokenize, Spanned, Tok};
use super::FilterError;

/// Tuples larger than this are rejected outright.
pub const MAX_TUPLE_LEN: usize = 100;

pub fn parse(raw: &str) -> Result<FilterNode, FilterError> {
    let tokens = tokenize(raw)?;
    let mut parser = Parser { raw, tokens, pos: 0 };
    let node = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error_here());
    }
    Ok(node)
}

struct Parser<'a> {
    raw: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn error_here(&self) -> FilterError {
        let pos = self
            .tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|s| s.pos)
            .unwrap_or(self.raw.len());
        FilterError::Parse(snippet(self.raw, pos))
    }

    fn parse_or(&mut self) -> Result<FilterNode, FilterError> {
        let mut nodes = vec![self.parse_and()?];
        while let Some(tok) = self.peek() {
            let is_or = matches!(tok, Tok::Comma | Tok::OrOr)
                || matches!(tok, Tok::Word(w) if w == "OR");
            if !is_or {
                break;
            }
            self.pos += 1;
            nodes.push(self.parse_and()?);
        }
        Ok(if nodes.len() == 1 { nodes.pop().unwrap() } else { FilterNode::Or(nodes) })
    }

    fn parse_and(&mut self) -> Result<FilterNode, FilterError> {
        let mut nodes = vec![self.parse_unary()?];
        while let Some(tok) = self.peek() {
            let is_and = matches!(tok, Tok::Semicolon | Tok::AndAnd)
                || matches!(tok, Tok::Word(w) if w == "AND");
            if !is_and {
                break;
            }
            self.pos += 1;
            nodes.push(self.parse_unary()?);
        }
        Ok(if nodes.len() == 1 { nodes.pop().unwrap() } else { FilterNode::And(nodes) })
    }

    fn parse_unary(&mut self) -> Result<FilterNode, FilterError> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.peek() {
                Some(Tok::RParen) => {
                    self.pos += 1;
                    Ok(inner)
                }
                _ => Err(self.error_here()),
            }
        } else {
            self.parse_atom()
        }
    }

    fn parse_atom(&mut self) -> Result<FilterNode, FilterError> {
        let field = match self.peek() {
            Some(Tok::Word(w)) => {
                let w = w.clone();
                self.pos += 1;
                w
            }
            _ => return Err(self.error_here()),
        };
        let op = match self.peek() {
            Some(Tok::Op(op)) => {
                let op = op.clone();
                self.pos += 1;
                op
            }
            _ => return Err(self.error_here()),
        };
        let value = self.parse_value()?;
        let value = validate_operand(&op, value).map_err(|_| self.error_here())?;
        Ok(FilterNode::Leaf(Comparison::new(&field, op, value)))
    }

    fn parse_value(&mut self) -> Result<FilterValue, FilterError> {
        match self.peek() {
            Some(Tok::LParen) => {
                self.pos += 1;
                let items = self.parse_value_list(Tok::RParen)?;
                Ok(FilterValue::Tuple(items))
            }
            Some(Tok::LBracket) => {
                self.pos += 1;
                let mut items = self.parse_value_list(Tok::RBracket)?;
                if items.len() != 2 {
                    return Err(self.error_here());
                }
                let hi = items.pop().unwrap();
                let lo = items.pop().unwrap();
                Ok(FilterValue::Range(Box::new(lo), Box::new(hi)))
            }
            _ => self.parse_scalar(),
        }
    }

    fn parse_value_list(&mut self, close: Tok) -> Result<Vec<FilterValue>, FilterError> {
        let mut items = vec![self.parse_scalar()?];
        loop {
            match self.peek() {
                Some(Tok::Comma) => {
                    self.pos += 1;
                    items.push(self.parse_scalar()?);
                    if items.len() > MAX_TUPLE_LEN {
                        return Err(self.error_here());
                    }
                }
                Some(tok) if *tok == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error_here()),
            }
        }
    }

    fn parse_scalar(&mut self) -> Result<FilterValue, FilterError> {
        let value = match self.peek() {
            Some(Tok::Num(n)) => FilterValue::Number(*n),
            Some(Tok::Str(s)) => FilterValue::Str(s.clone()),
            Some(Tok::Word(w)) => match w.as_str() {
                "true" => FilterValue::Bool(true),
                "false" => FilterValue::Bool(false),
                // Unquoted words in value position are string literals; this
                // keeps bare dates and enum-ish values ergonomic.
                other => FilterValue::Str(other.to_owned()),
            },
            _ => return Err(self.error_here()),
        };
        self.pos += 1;
        Ok(value)
    }
}

/// Shape checks the parser cannot express positionally.
fn validate_operand(op: &Op, value: FilterValue) -> Result<FilterValue, ()> {
    match op {
        Op::In | Op::Out => match value {
            FilterValue::Tuple(_) => Ok(value),
            FilterValue::Range(_, _) => Err(()),
            single => Ok(FilterValue::Tuple(vec![single])),
        },
        Op::Between | Op::NotBetween => match value {
            FilterValue::Range(_, _) => Ok(value),
            FilterValue::Tuple(mut items) if items.len() == 2 => {
                let hi = items.pop().unwrap();
                let lo = items.pop().unwrap();
                Ok(FilterValue::Range(Box::new(lo), Box::new(hi)))
            }
            _ => Err(()),
        },
        Op::IsEmpty => match value {
            FilterValue::Bool(_) => Ok(value),
            _ => Err(()),
        },
        Op::Length | Op::MinLength | Op::MaxLength => match value {
            FilterValue::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(value),
            _ => Err(()),
        },
        Op::Regex | Op::IRegex => match value {
            FilterValue::Str(_) => Ok(value),
            _ => Err(()),
        },
        // Ranges never appear outside between-style operators.
        _ => match value {
            FilterValue::Range(_, _) => Err(()),
            other => Ok(other),
        },
    }
}
