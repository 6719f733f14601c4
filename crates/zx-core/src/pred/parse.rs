//! Lexer and recursive-descent parser for predicate strings.
//!
//! ```text
//! ors  ::= ands { ('|' | ':') ands }
//! ands ::= prim { ('&' | ',') prim }
//! prim ::= prune | true | false | name op value | op value
//!        | '!' prim | '(' ors ')' | d | - | c | n
//! ```

use super::{CmpOp, Leaf, Pred};
use crate::error::{ZxError, ZxResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Cmp(CmpOp),
    Not,
    And,
    Or,
    LPar,
    RPar,
    Prune,
    True,
    False,
    Name(String),
}

fn is_punct(c: char) -> bool {
    matches!(
        c,
        '!' | '&' | '|' | '~' | '=' | '(' | ')' | '>' | '<' | '\'' | ',' | ':' | '≈' | '≡' | '≠'
            | '≥' | '≤'
    )
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n')
}

fn err(msg: &str) -> ZxError {
    ZxError::other(msg)
}

struct Lexer {
    text: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(s: &str) -> Self {
        Self {
            text: s.chars().collect(),
            pos: 0,
        }
    }

    fn at(&self, off: usize) -> Option<char> {
        self.text.get(self.pos + off).copied()
    }

    fn peek(&mut self) -> ZxResult<Option<Tok>> {
        let pos = self.pos;
        let t = self.next();
        self.pos = pos;
        t
    }

    fn next(&mut self) -> ZxResult<Option<Tok>> {
        while self.at(0).is_some_and(is_space) {
            self.pos += 1;
        }
        let Some(c) = self.at(0) else {
            return Ok(None);
        };
        let tok = match c {
            '~' if self.at(1) == Some('~') => {
                self.pos += 2;
                Tok::Cmp(CmpOp::Rexp)
            }
            '~' => {
                self.pos += 1;
                Tok::Cmp(CmpOp::Match)
            }
            '(' | ')' | '|' | '&' | ',' | ':' | '≈' | '≡' | '≠' | '≤' | '≥' => {
                self.pos += 1;
                match c {
                    '(' => Tok::LPar,
                    ')' => Tok::RPar,
                    '|' | ':' => Tok::Or,
                    '&' | ',' => Tok::And,
                    '≈' => Tok::Cmp(CmpOp::Rexp),
                    '≡' => Tok::Cmp(CmpOp::Eq),
                    '≠' => Tok::Cmp(CmpOp::Neqs),
                    '≤' => Tok::Cmp(CmpOp::Le),
                    _ => Tok::Cmp(CmpOp::Ge),
                }
            }
            '>' | '<' | '!' | '=' if self.at(1) == Some('=') => {
                self.pos += 2;
                match c {
                    '!' if self.at(0) == Some('=') => {
                        self.pos += 1;
                        Tok::Cmp(CmpOp::Neq)
                    }
                    '!' => Tok::Cmp(CmpOp::Neqs),
                    '=' => Tok::Cmp(CmpOp::Eq),
                    '<' => Tok::Cmp(CmpOp::Le),
                    _ => Tok::Cmp(CmpOp::Ge),
                }
            }
            '>' | '<' | '!' | '=' => {
                self.pos += 1;
                match c {
                    '>' => Tok::Cmp(CmpOp::Gt),
                    '<' => Tok::Cmp(CmpOp::Lt),
                    '=' => Tok::Cmp(CmpOp::Eqs),
                    _ => Tok::Not,
                }
            }
            '"' | '\'' => {
                let start = self.pos + 1;
                let Some(len) = self.text[start..].iter().position(|&x| x == c) else {
                    return Err(err(&format!("{c} expected")));
                };
                self.pos = start + len + 1;
                Tok::Name(self.text[start..start + len].iter().collect())
            }
            _ => {
                let start = self.pos;
                self.pos += 1;
                while self.at(0).is_some_and(|x| !is_punct(x) && !is_space(x)) {
                    self.pos += 1;
                }
                let word: String = self.text[start..self.pos].iter().collect();
                match word.as_str() {
                    "prune" => Tok::Prune,
                    "true" | "t" => Tok::True,
                    "false" | "f" => Tok::False,
                    _ => Tok::Name(word),
                }
            }
        };
        Ok(Some(tok))
    }

    fn name(&mut self) -> ZxResult<String> {
        match self.next() {
            Ok(Some(Tok::Name(v))) => Ok(v),
            _ => Err(err("name expected")),
        }
    }
}

/// Parse a non-empty predicate string.
pub(super) fn parse(s: &str) -> ZxResult<Pred> {
    let mut l = Lexer::new(s);
    let p = parse_ors(&mut l)?;
    if l.next()?.is_some() {
        return Err(err("syntax error"));
    }
    Ok(p)
}

fn parse_ors(l: &mut Lexer) -> ZxResult<Pred> {
    let mut args = vec![parse_ands(l)?];
    while l.peek()? == Some(Tok::Or) {
        l.next()?;
        args.push(parse_ands(l)?);
    }
    Ok(if args.len() == 1 { args.remove(0) } else { Pred::Or(args) })
}

fn parse_ands(l: &mut Lexer) -> ZxResult<Pred> {
    let mut args = vec![parse_prim(l)?];
    while l.peek()? == Some(Tok::And) {
        l.next()?;
        args.push(parse_prim(l)?);
    }
    Ok(if args.len() == 1 { args.remove(0) } else { Pred::And(args) })
}

fn parse_prim(l: &mut Lexer) -> ZxResult<Pred> {
    let Some(t) = l.peek()? else {
        return Err(err("unexpected end of predicate"));
    };
    match t {
        Tok::Prune => {
            l.next()?;
            Ok(Pred::Prune)
        }
        Tok::True => {
            l.next()?;
            Ok(Pred::True)
        }
        Tok::False => {
            l.next()?;
            Ok(Pred::False)
        }
        // `~x`, `=x` and `~~x` apply to the path.
        Tok::Cmp(op @ (CmpOp::Match | CmpOp::Eqs | CmpOp::Rexp)) => {
            l.next()?;
            let v = l.name()?;
            Ok(Pred::Leaf(Leaf::new(op, "path", v)))
        }
        Tok::Name(v1) => {
            l.next()?;
            if matches!(v1.as_str(), "d" | "-" | "c") {
                return Ok(Pred::Leaf(Leaf::new(CmpOp::Eqs, "type", v1)));
            }
            if v1.parse::<i64>().is_ok() {
                return Ok(Pred::Leaf(Leaf::new(CmpOp::Le, "depth", v1)));
            }
            let Ok(Some(Tok::Cmp(op))) = l.next() else {
                return Err(err("op expected"));
            };
            let v2 = l.name()?;
            Ok(Pred::Leaf(Leaf::new(op, v1, v2)))
        }
        Tok::Not => {
            l.next()?;
            Ok(Pred::Not(Box::new(parse_prim(l)?)))
        }
        Tok::LPar => {
            l.next()?;
            let p = parse_ors(l)?;
            match l.next() {
                Ok(Some(Tok::RPar)) => Ok(p),
                _ => Err(err("')' expected")),
            }
        }
        _ => Err(err("not a primary expression")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<Tok> {
        let mut l = Lexer::new(s);
        let mut out = Vec::new();
        while let Some(t) = l.next().unwrap() {
            out.push(t);
        }
        out
    }

    #[test]
    fn test_lex_operators() {
        assert_eq!(
            toks("a!==1 b!=x c==2 d<=3 e>=4 !"),
            vec![
                Tok::Name("a".into()),
                Tok::Cmp(CmpOp::Neq),
                Tok::Name("1".into()),
                Tok::Name("b".into()),
                Tok::Cmp(CmpOp::Neqs),
                Tok::Name("x".into()),
                Tok::Name("c".into()),
                Tok::Cmp(CmpOp::Eq),
                Tok::Name("2".into()),
                Tok::Name("d".into()),
                Tok::Cmp(CmpOp::Le),
                Tok::Name("3".into()),
                Tok::Name("e".into()),
                Tok::Cmp(CmpOp::Ge),
                Tok::Name("4".into()),
                Tok::Not,
            ]
        );
    }

    #[test]
    fn test_lex_aliases_and_quotes() {
        assert_eq!(
            toks("x≈'a b'|y≡\"1\",t:f"),
            vec![
                Tok::Name("x".into()),
                Tok::Cmp(CmpOp::Rexp),
                Tok::Name("a b".into()),
                Tok::Or,
                Tok::Name("y".into()),
                Tok::Cmp(CmpOp::Eq),
                Tok::Name("1".into()),
                Tok::And,
                Tok::True,
                Tok::Or,
                Tok::False,
            ]
        );
        assert!(Lexer::new("'abc").next().is_err());
    }
}
