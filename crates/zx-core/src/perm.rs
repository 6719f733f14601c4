//! Authenticated identities and permission checks on Dirs.

use std::collections::BTreeSet;

use crate::dir::{Dir, is_usr_attr};
use crate::error::{ZxError, ZxResult};

/// Role that is a member of every group.
pub const ELF: &str = "elf";

const CANT_REMOVE: &str = "attribute cannot be removed";

/// Permission bits checked by [`can`].
pub const READ: u32 = 0o444;
pub const WRITE: u32 = 0o222;
pub const EXEC: u32 = 0o111;

/// Identity established by authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub uid: String,
    pub speaks_for: String,
    pub gids: BTreeSet<String>,
    /// Protocols both peers agreed on.
    pub proto: BTreeSet<String>,
    /// Whether the challenge-response exchange actually ran.
    pub ok: bool,
}

impl AuthInfo {
    pub fn new(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            speaks_for: uid.clone(),
            uid,
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, gids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gids.extend(gids.into_iter().map(Into::into));
        self
    }
}

/// Whether `ai` is a member of `name`. A missing identity belongs to every
/// group and so does the empty name.
pub fn in_group(ai: Option<&AuthInfo>, name: &str) -> bool {
    match ai {
        None => true,
        Some(ai) => name.is_empty() || ai.uid == ELF || ai.uid == name || ai.gids.contains(name),
    }
}

/// Check `what` (one of [`READ`], [`WRITE`], [`EXEC`]) against `d`'s mode.
pub fn can(ai: Option<&AuthInfo>, d: Option<&Dir>, what: u32) -> bool {
    let Some(d) = d else {
        return true;
    };
    let mode = d.mode();
    if in_group(ai, d.attr("Uid")) {
        return mode & what != 0;
    }
    if in_group(ai, d.attr("Gid")) {
        return mode & what & 0o077 != 0;
    }
    mode & what & 0o007 != 0
}

pub fn can_read(ai: Option<&AuthInfo>, d: &Dir) -> bool {
    can(ai, Some(d), READ)
}

pub fn can_write(ai: Option<&AuthInfo>, d: &Dir) -> bool {
    can(ai, Some(d), WRITE)
}

pub fn can_walk(ai: Option<&AuthInfo>, d: &Dir) -> bool {
    can(ai, Some(d), EXEC)
}

/// Attributes a wstat may change. Everything else is ignored.
fn settable(k: &str) -> bool {
    matches!(k, "mode" | "size" | "mtime") || (is_usr_attr(k) && k != "Wuid")
}

/// Check whether `ai` may apply `nd` to the entry `d`.
///
/// Attributes that cannot be set are skipped, but a wstat made only of
/// such attributes is refused.
pub fn can_wstat(ai: Option<&AuthInfo>, d: &Dir, nd: &Dir) -> ZxResult<()> {
    let owner = in_group(ai, d.attr("Uid"));
    let mut some = false;
    let mut cant = None;
    for (k, v) in nd.iter() {
        if !settable(k) {
            if v.is_empty() {
                return Err(ZxError::other(format!("{k}: {CANT_REMOVE}")));
            }
            cant = Some(k);
            continue;
        }
        if k == "size" && d.is_dir() && v != d.attr(k) {
            cant = Some(k);
            continue;
        }
        some = true;
        if v == d.attr(k) {
            continue;
        }
        let reserved = matches!(k, "mode" | "size" | "mtime" | "Uid" | "Gid");
        if reserved && v.is_empty() {
            return Err(ZxError::other(format!("{k}: {CANT_REMOVE}")));
        }
        let ok = match k {
            "mode" => owner,
            "size" => can_write(ai, d),
            "Uid" | "Gid" => owner && (in_group(ai, v) || in_group(ai, ELF)),
            _ => owner || can_write(ai, d),
        };
        if !ok {
            return Err(ZxError::perm(k));
        }
    }
    match cant {
        Some(k) if !some => Err(ZxError::perm(k)),
        _ => Ok(()),
    }
}
