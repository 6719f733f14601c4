//! Predicates on directory entries, as used by find.
//!
//! A predicate is compiled from text and evaluated at a Dir and its depth.
//! Evaluation returns whether the entry matches and whether the walk may be
//! pruned at that entry.
//!
//! | text | meaning |
//! |---|---|
//! | `attr=v`, `attr!=v` | string equality (`≠` for `!=`) |
//! | `attr==n`, `attr!==n` | numeric equality (`≡` for `==`) |
//! | `attr<n`, `<=`, `>`, `>=` | numeric order (`≤`, `≥`) |
//! | `attr~glob` | glob match, element-wise when the glob is absolute |
//! | `attr~~re` | regexp match (`≈`) |
//! | `~x`, `=x`, `~~x` | same, on `path` |
//! | `d`, `-`, `c` | `type=d` and so on |
//! | `n` | `depth<=n` |
//! | `prune`, `true`, `false` | constants (`t`, `f`) |
//!
//! Combine with `&` (`,`), `|` (`:`), `!` and parentheses. When `path` is
//! compared with a value not starting with `/`, `name` is used instead.
//! Negated name or path matches imply prune when the inner match holds.

mod parse;

use std::fmt;
use std::sync::OnceLock;

use glob::{MatchOptions, Pattern};
use regex::Regex;

use crate::dir::Dir;
use crate::error::{ZxError, ZxResult};
use crate::path;

/// Comparison at a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Neq,
    Ge,
    Gt,
    Eqs,
    Neqs,
    Match,
    Rexp,
}

impl CmpOp {
    fn as_str(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Neq => "!==",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
            CmpOp::Eqs => "=",
            CmpOp::Neqs => "!=",
            CmpOp::Match => "~",
            CmpOp::Rexp => "~~",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(
            self,
            CmpOp::Lt | CmpOp::Le | CmpOp::Eq | CmpOp::Neq | CmpOp::Ge | CmpOp::Gt
        )
    }
}

/// `name op value`
#[derive(Debug, Clone)]
pub struct Leaf {
    pub op: CmpOp,
    pub name: String,
    pub value: String,
    re: OnceLock<Result<Regex, regex::Error>>,
}

impl Leaf {
    pub fn new(op: CmpOp, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op,
            name: name.into(),
            value: value.into(),
            re: OnceLock::new(),
        }
    }

    /// Attribute the leaf looks at: `path` with a relative value means `name`.
    fn attr(&self) -> &str {
        if self.name == "path" && !self.value.is_empty() && !self.value.starts_with('/') {
            "name"
        } else {
            &self.name
        }
    }

    fn on_name_or_path(&self) -> bool {
        self.name == "name" || self.name == "path"
    }

    fn eval(&self, d: &Dir, lvl: usize) -> ZxResult<(bool, bool)> {
        if self.op.is_numeric() {
            return self.eval_num(d, lvl);
        }
        let v = d.get(self.attr());
        match self.op {
            CmpOp::Match => match v {
                Some(v) => path_match(&self.value, v),
                None => Ok((false, false)),
            },
            CmpOp::Rexp => {
                let Some(v) = v else {
                    return Ok((false, false));
                };
                let re = self
                    .re
                    .get_or_init(|| Regex::new(&self.value))
                    .as_ref()
                    .map_err(|e| ZxError::other(e.to_string()))?;
                Ok((re.is_match(v), false))
            }
            CmpOp::Eqs => Ok((v == Some(self.value.as_str()), false)),
            _ => match v {
                None => Ok((true, false)),
                Some(v) => {
                    let eq = v == self.value;
                    Ok((!eq, eq && self.on_name_or_path()))
                }
            },
        }
    }

    fn eval_num(&self, d: &Dir, lvl: usize) -> ZxResult<(bool, bool)> {
        let is_depth = self.name == "depth";
        let n1 = if is_depth {
            lvl as i64
        } else {
            match d.get(&self.name) {
                Some(v) => parse_int(v)?,
                None => return Ok((false, false)),
            }
        };
        let n2 = parse_int(&self.value)?;
        Ok(match self.op {
            CmpOp::Lt => (n1 < n2, is_depth && n1 >= n2 - 1),
            CmpOp::Le => (n1 <= n2, is_depth && n1 >= n2),
            CmpOp::Eq => (n1 == n2, is_depth && n1 >= n2),
            CmpOp::Neq => (n1 != n2, false),
            CmpOp::Ge => (n1 >= n2, false),
            _ => (n1 > n2, false),
        })
    }
}

/// Integer with automatic radix: `0x` hex, `0o` or leading `0` octal,
/// `0b` binary, decimal otherwise.
fn parse_int(s: &str) -> ZxResult<i64> {
    let nan = || ZxError::other("not a number");
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, body) = if let Some(h) = lower.strip_prefix("0x") {
        (16, h)
    } else if let Some(o) = lower.strip_prefix("0o") {
        (8, o)
    } else if let Some(b) = lower.strip_prefix("0b") {
        (2, b)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, &lower[1..])
    } else {
        (10, lower.as_str())
    };
    if body.is_empty() || body.starts_with(['+', '-']) {
        return Err(nan());
    }
    let n = i64::from_str_radix(body, radix).map_err(|_| nan())?;
    Ok(if neg { -n } else { n })
}

fn glob_match(pat: &str, s: &str) -> ZxResult<bool> {
    let opts = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let p = Pattern::new(pat).map_err(|e| ZxError::other(format!("bad pattern: {e}")))?;
    Ok(p.matches_with(s, opts))
}

/// Match `p` against `exp`.
///
/// A relative `exp` is a single glob. An absolute one is matched one element
/// at a time: the walk can be pruned once `p` is deeper than `exp` or an
/// element fails to match.
fn path_match(exp: &str, p: &str) -> ZxResult<(bool, bool)> {
    if !exp.is_empty() && !exp.starts_with('/') {
        return Ok((glob_match(exp, p)?, false));
    }
    let els = path::elems(exp);
    let pels = path::elems(p);
    if pels.len() > els.len() {
        return Ok((false, true));
    }
    for (e, pe) in els.iter().zip(pels.iter()) {
        if !glob_match(e, pe)? {
            return Ok((false, true));
        }
    }
    Ok((pels.len() == els.len(), false))
}

/// A compiled predicate.
#[derive(Debug, Clone)]
pub enum Pred {
    True,
    False,
    Prune,
    Not(Box<Pred>),
    And(Vec<Pred>),
    Or(Vec<Pred>),
    Leaf(Leaf),
}

impl Default for Pred {
    fn default() -> Self {
        Pred::True
    }
}

impl Pred {
    /// Compile a predicate. The empty string matches everything.
    pub fn new(s: &str) -> ZxResult<Pred> {
        if s.trim().is_empty() {
            return Ok(Pred::True);
        }
        parse::parse(s)
    }

    pub fn and(args: Vec<Pred>) -> Pred {
        Pred::And(args)
    }

    pub fn or(args: Vec<Pred>) -> Pred {
        Pred::Or(args)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(arg: Pred) -> Pred {
        Pred::Not(Box::new(arg))
    }

    fn prec(&self) -> u8 {
        match self {
            Pred::Or(_) => 1,
            Pred::And(_) => 2,
            Pred::Not(_) => 3,
            _ => 4,
        }
    }

    /// Evaluate at `d`, which sits at depth `lvl` of the walk.
    ///
    /// Returns `(matches, pruned)`.
    pub fn eval_at(&self, d: &Dir, lvl: usize) -> ZxResult<(bool, bool)> {
        match self {
            Pred::True => Ok((true, false)),
            Pred::False => Ok((false, false)),
            Pred::Prune => Ok((false, true)),
            Pred::Not(arg) => {
                let (m, pruned) = arg.eval_at(d, lvl)?;
                let implies_prune = match arg.as_ref() {
                    Pred::Leaf(l) => {
                        matches!(l.op, CmpOp::Match | CmpOp::Eqs | CmpOp::Rexp)
                            && l.on_name_or_path()
                    }
                    _ => false,
                };
                Ok((!m, if implies_prune { m } else { pruned }))
            }
            Pred::And(args) => {
                for a in args {
                    let (v, pruned) = a.eval_at(d, lvl)?;
                    if !v || pruned {
                        return Ok((v, pruned));
                    }
                }
                Ok((true, false))
            }
            Pred::Or(args) => {
                for a in args {
                    let (v, pruned) = a.eval_at(d, lvl)?;
                    if v || pruned {
                        return Ok((v, pruned));
                    }
                }
                Ok((false, false))
            }
            Pred::Leaf(l) => l.eval(d, lvl),
        }
    }

    /// Compile `pred` and evaluate it at `d`.
    pub fn eval_str(d: &Dir, pred: &str, lvl: usize) -> ZxResult<(bool, bool)> {
        Pred::new(pred)?.eval_at(d, lvl)
    }
}

impl Pred {
    fn fmt_arg(&self, f: &mut fmt::Formatter<'_>, arg: &Pred) -> fmt::Result {
        if arg.prec() < self.prec() {
            write!(f, "({arg})")
        } else {
            write!(f, "{arg}")
        }
    }
}

impl fmt::Display for Pred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pred::True => f.write_str("true"),
            Pred::False => f.write_str("false"),
            Pred::Prune => f.write_str("prune"),
            Pred::Leaf(l) => write!(f, "{} {} {}", l.name, l.op.as_str(), l.value),
            Pred::Not(arg) => {
                f.write_str("!")?;
                self.fmt_arg(f, arg)
            }
            Pred::And(args) | Pred::Or(args) => {
                let sep = if matches!(self, Pred::And(_)) { " & " } else { " | " };
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    self.fmt_arg(f, a)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREDS: &[(&str, Option<&str>)] = &[
        ("name", None),
        ("!name", None),
        ("(name)", None),
        ("t", Some("true")),
        ("4", Some("depth <= 4")),
        ("mtime==555", Some("mtime == 555")),
        ("mtime==555|name!=", None),
        ("mtime==555|name!='*.x'", Some("mtime == 555 | name != *.x")),
        (
            "(mtime==555|name!='*.x')&mtime == 555",
            Some("(mtime == 555 | name != *.x) & mtime == 555"),
        ),
        (
            "!(mtime==555|name!='*.x')&!mtime == 555",
            Some("!(mtime == 555 | name != *.x) & !mtime == 555"),
        ),
        ("name=b&mtime>4", Some("name = b & mtime > 4")),
        ("path~*.c", Some("path ~ *.c")),
        ("prune", Some("prune")),
        ("true", Some("true")),
    ];

    #[test]
    fn test_parse_table() {
        for (src, want) in PREDS {
            let got = Pred::new(src);
            match want {
                None => assert!(got.is_err(), "{src} should fail"),
                Some(w) => {
                    let p = got.unwrap_or_else(|e| panic!("{src}: {e}"));
                    assert_eq!(p.to_string(), *w, "{src}");
                    let again = Pred::new(&p.to_string()).unwrap();
                    assert_eq!(again.to_string(), *w, "reparse of {src}");
                }
            }
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Pred::new("name").unwrap_err().to_string(), "op expected");
        assert_eq!(Pred::new("name=").unwrap_err().to_string(), "name expected");
        assert_eq!(Pred::new("(a=b").unwrap_err().to_string(), "')' expected");
        assert_eq!(Pred::new("a=b)").unwrap_err().to_string(), "syntax error");
    }

    #[test]
    fn test_prune() {
        let p = Pred::new(r#"(path = "/a/b" | path = "/d") & prune | type = d"#).unwrap();
        let d = Dir::from([("path", "/a/b"), ("name", "b"), ("type", "d")]);
        assert_eq!(p.eval_at(&d, 0).unwrap(), (false, true));
        let d = Dir::from([("path", "/a"), ("name", "a"), ("type", "d")]);
        assert_eq!(p.eval_at(&d, 0).unwrap(), (true, false));
    }

    #[test]
    fn test_name() {
        let d = Dir::from([("path", "/a/b"), ("name", "b")]);
        assert_eq!(Pred::eval_str(&d, "name=b", 0).unwrap(), (true, false));
        assert_eq!(Pred::eval_str(&d, "! name=b", 0).unwrap(), (false, true));
        assert_eq!(Pred::eval_str(&d, "name!=b", 0).unwrap(), (false, true));
        assert_eq!(Pred::eval_str(&d, "Foo!=b", 0).unwrap(), (true, false));
        assert_eq!(Pred::eval_str(&d, "Foo=b", 0).unwrap(), (false, false));
    }

    #[test]
    fn test_match() {
        let cases = [
            ("~*.c", "/a/b", false, false),
            ("~*.c", "/a/b/.c", true, false),
            ("~*.c", "/a/b/c", false, false),
            ("~*.c", "/.c", true, false),
            ("~/*.c", "/.c", true, false),
            ("~/*.c", "/.cd", false, true),
            ("~/*b", "/a/b", false, true),
            ("~/*/b/*/*/b", "/a/b", false, false),
            ("~/*/c/*/*/b", "/a/b", false, true),
        ];
        for (pred, p, m, pruned) in cases {
            let d = Dir::from([("path", p), ("name", path::base(p).as_str())]);
            assert_eq!(Pred::eval_str(&d, pred, 0).unwrap(), (m, pruned), "{pred} at {p}");
        }
    }

    #[test]
    fn test_depth() {
        let d = Dir::from([("path", "/a"), ("type", "d")]);
        assert_eq!(Pred::eval_str(&d, "1", 0).unwrap(), (true, false));
        assert_eq!(Pred::eval_str(&d, "1", 1).unwrap(), (true, true));
        assert_eq!(Pred::eval_str(&d, "depth<2", 1).unwrap(), (true, true));
        assert_eq!(Pred::eval_str(&d, "depth>1", 1).unwrap(), (false, false));
    }

    #[test]
    fn test_numbers() {
        let d = Dir::from([("size", "0x10"), ("mode", "0755"), ("Foo", "x")]);
        assert_eq!(Pred::eval_str(&d, "size==16", 0).unwrap(), (true, false));
        assert_eq!(Pred::eval_str(&d, "mode==0755", 0).unwrap(), (true, false));
        assert_eq!(Pred::eval_str(&d, "mtime>0", 0).unwrap(), (false, false));
        let e = Pred::eval_str(&d, "Foo>1", 0).unwrap_err();
        assert_eq!(e.to_string(), "not a number");
        assert_eq!(parse_int("-012").unwrap(), -10);
        assert!(parse_int("0x").is_err());
    }

    #[test]
    fn test_regexp() {
        let d = Dir::from([("path", "/a/b.rs"), ("name", "b.rs")]);
        assert_eq!(Pred::eval_str(&d, r"~~'\.rs$'", 0).unwrap(), (true, false));
        assert_eq!(Pred::eval_str(&d, "path≈^/a/", 0).unwrap().0, true);
        assert!(Pred::eval_str(&d, "name~~'('", 0).is_err());
    }

    #[test]
    fn test_empty_matches_all() {
        let p = Pred::new("").unwrap();
        assert_eq!(p.eval_at(&Dir::new(), 9).unwrap(), (true, false));
    }
}
