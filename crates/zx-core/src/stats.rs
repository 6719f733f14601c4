//! Per-operation I/O statistics.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Operations counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumCount)]
#[strum(serialize_all = "lowercase")]
pub enum Op {
    Stat,
    Get,
    Put,
    Wstat,
    Move,
    Link,
    Remove,
    RemoveAll,
    Find,
    FindGet,
    Total,
}

#[derive(Debug, Clone, Copy, Default)]
struct OpStats {
    calls: u64,
    errs: u64,
    msgs: u64,
    bytes: u64,
    min: Duration,
    max: Duration,
    tot: Duration,
}

impl OpStats {
    fn add(&mut self, o: &OpStats, took: Duration) {
        self.calls += o.calls;
        self.errs += o.errs;
        self.msgs += o.msgs;
        self.bytes += o.bytes;
        if self.calls == 1 || took < self.min {
            self.min = took;
        }
        self.max = self.max.max(took);
        self.tot += took;
    }
}

/// Counters for every [`Op`], plus totals.
#[derive(Debug, Default)]
pub struct IoStats {
    ops: Mutex<[OpStats; Op::COUNT]>,
}

/// An operation in progress; record it with [`Call::end`].
#[derive(Debug)]
pub struct Call {
    op: Op,
    start: Instant,
    msgs: u64,
    bytes: u64,
}

impl Call {
    /// Count a message of `n` bytes.
    pub fn sent(&mut self, n: usize) {
        self.msgs += 1;
        self.bytes += n as u64;
    }
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, op: Op) -> Call {
        Call {
            op,
            start: Instant::now(),
            msgs: 0,
            bytes: 0,
        }
    }

    pub fn end(&self, c: Call, failed: bool) {
        let took = c.start.elapsed();
        let one = OpStats {
            calls: 1,
            errs: failed as u64,
            msgs: c.msgs,
            bytes: c.bytes,
            ..Default::default()
        };
        let mut ops = self.ops.lock();
        ops[c.op as usize].add(&one, took);
        if c.op != Op::Total {
            ops[Op::Total as usize].add(&one, took);
        }
    }

    /// Number of calls made to `op`.
    pub fn calls(&self, op: Op) -> u64 {
        self.ops.lock()[op as usize].calls
    }

    pub fn clear(&self) {
        *self.ops.lock() = Default::default();
    }
}

impl fmt::Display for IoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops = *self.ops.lock();
        for op in Op::iter() {
            let s = &ops[op as usize];
            if s.calls == 0 && op != Op::Total {
                continue;
            }
            let avg = s.tot.checked_div(s.calls as u32).unwrap_or_default();
            writeln!(
                f,
                "{op:<10} {:>6} calls {:>4} errs {:>8} msgs {:>10} bytes \
                 {:>8.3?} min {:>8.3?} avg {:>8.3?} max",
                s.calls, s.errs, s.msgs, s.bytes, s.min, avg, s.max
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_clear() {
        let st = IoStats::new();
        let mut c = st.start(Op::Get);
        c.sent(10);
        c.sent(5);
        st.end(c, false);
        st.end(st.start(Op::Stat), true);
        assert_eq!(st.calls(Op::Get), 1);
        assert_eq!(st.calls(Op::Total), 2);
        let s = st.to_string();
        assert!(s.contains("get"));
        assert!(s.lines().any(|l| l.starts_with("stat") && l.contains("1 errs")));
        assert!(!s.contains("wstat"));
        st.clear();
        assert_eq!(st.calls(Op::Total), 0);
    }
}
