//! Run-time flags, set through `/Ctl` writes and listed by `/Ctl` reads.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{ZxError, ZxResult};

/// Shared boolean flag.
#[derive(Debug, Clone, Default)]
pub struct BoolFlag(Arc<AtomicBool>);

impl BoolFlag {
    pub fn new(v: bool) -> Self {
        Self(Arc::new(AtomicBool::new(v)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, v: bool) {
        self.0.store(v, Ordering::Relaxed);
    }
}

/// Shared integer flag.
#[derive(Debug, Clone, Default)]
pub struct IntFlag(Arc<AtomicI64>);

impl IntFlag {
    pub fn new(v: i64) -> Self {
        Self(Arc::new(AtomicI64::new(v)))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }
}

/// Shared string flag.
#[derive(Debug, Clone, Default)]
pub struct StrFlag(Arc<Mutex<String>>);

impl StrFlag {
    pub fn new(v: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(v.into())))
    }

    pub fn get(&self) -> String {
        self.0.lock().clone()
    }

    pub fn set(&self, v: impl Into<String>) {
        *self.0.lock() = v.into();
    }
}

#[derive(Debug, Clone)]
enum Value {
    Bool(BoolFlag),
    Int(IntFlag),
    Str(StrFlag),
    Action,
}

#[derive(Debug, Clone)]
struct Flag {
    value: Value,
    ro: bool,
}

/// An action flag requested by a ctl command, for the owner to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagAction {
    pub name: String,
    pub args: Vec<String>,
}

/// Flag registry, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    flags: IndexMap<String, Flag>,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, value: Value, ro: bool) {
        self.flags.insert(name.to_string(), Flag { value, ro });
    }

    pub fn add_bool(&mut self, name: &str, v: &BoolFlag) {
        self.add(name, Value::Bool(v.clone()), false);
    }

    pub fn add_bool_ro(&mut self, name: &str, v: &BoolFlag) {
        self.add(name, Value::Bool(v.clone()), true);
    }

    pub fn add_int(&mut self, name: &str, v: &IntFlag) {
        self.add(name, Value::Int(v.clone()), false);
    }

    pub fn add_str(&mut self, name: &str, v: &StrFlag) {
        self.add(name, Value::Str(v.clone()), false);
    }

    pub fn add_str_ro(&mut self, name: &str, v: &StrFlag) {
        self.add(name, Value::Str(v.clone()), true);
    }

    /// Register a command, returned by [`Flags::ctl`] for the owner to run.
    pub fn add_action(&mut self, name: &str) {
        self.add(name, Value::Action, false);
    }

    /// Apply a ctl command.
    ///
    /// `name` alone sets a boolean and `noname` clears it; `name v` sets it
    /// when `v` is one of `1 on y yes`. Integer and string flags take a
    /// value. Action flags are returned with their arguments.
    pub fn ctl(&self, cmd: &str) -> ZxResult<Option<FlagAction>> {
        let mut toks: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
        match toks.len() {
            0 => return Err(ZxError::bad_ctl("")),
            1 => match toks[0].strip_prefix("no") {
                Some(rest) if self.flags.contains_key(rest) => {
                    toks[0] = rest.to_string();
                    toks.push("off".to_string());
                }
                _ => toks.push("on".to_string()),
            },
            _ => {}
        }
        let name = toks[0].as_str();
        let Some(flag) = self.flags.get(name) else {
            return Err(ZxError::bad_ctl(name));
        };
        if flag.ro {
            return Err(ZxError::other(format!("{name}: read only flag")));
        }
        match &flag.value {
            Value::Bool(b) => {
                if toks.len() > 2 {
                    return Err(ZxError::other(format!("usage: '{name}' on|off")));
                }
                b.set(matches!(toks[1].as_str(), "on" | "1" | "y" | "yes"));
            }
            Value::Int(i) => {
                let n = match toks.len() {
                    2 => toks[1].parse().ok(),
                    _ => None,
                };
                let n = n.ok_or_else(|| ZxError::other(format!("usage: '{name}' number")))?;
                i.set(n);
            }
            Value::Str(s) => s.set(toks[1..].join(" ")),
            Value::Action => {
                return Ok(Some(FlagAction {
                    name: name.to_string(),
                    args: toks[1..].to_vec(),
                }));
            }
        }
        Ok(None)
    }
}

/// One `name value` line per flag; actions are not listed.
impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, flag) in &self.flags {
            match &flag.value {
                Value::Bool(b) => writeln!(f, "{name} {}", if b.get() { "on" } else { "off" })?,
                Value::Int(i) => writeln!(f, "{name} {}", i.get())?,
                Value::Str(s) => writeln!(f, "{name} {}", s.get())?,
                Value::Action => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> (Flags, BoolFlag, IntFlag, BoolFlag) {
        let debug = BoolFlag::default();
        let ival = IntFlag::new(60);
        let rdonly = BoolFlag::new(true);
        let mut fl = Flags::new();
        fl.add_bool("debug", &debug);
        fl.add_int("ival", &ival);
        fl.add_bool_ro("rdonly", &rdonly);
        fl.add_action("sync");
        (fl, debug, ival, rdonly)
    }

    #[test]
    fn test_bool_forms() {
        let (fl, debug, _, _) = flags();
        fl.ctl("debug").unwrap();
        assert!(debug.get());
        fl.ctl("nodebug").unwrap();
        assert!(!debug.get());
        fl.ctl("debug yes").unwrap();
        assert!(debug.get());
        fl.ctl("debug off").unwrap();
        assert!(!debug.get());
        assert!(fl.ctl("debug on off").is_err());
    }

    #[test]
    fn test_int_and_ro() {
        let (fl, _, ival, _) = flags();
        fl.ctl("ival 5").unwrap();
        assert_eq!(ival.get(), 5);
        assert!(fl.ctl("ival x").is_err());
        let err = fl.ctl("rdonly off").unwrap_err();
        assert_eq!(err.to_string(), "rdonly: read only flag");
        let err = fl.ctl("bogus").unwrap_err();
        assert!(matches!(err, ZxError::BadCtl(_)));
    }

    #[test]
    fn test_action() {
        let (fl, _, _, _) = flags();
        let act = fl.ctl("sync").unwrap().unwrap();
        assert_eq!(act.name, "sync");
        assert_eq!(act.args, vec!["on"]);
    }

    #[test]
    fn test_display() {
        let (fl, _, _, _) = flags();
        assert_eq!(fl.to_string(), "debug off\nival 60\nrdonly on\n");
    }
}
