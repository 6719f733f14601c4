//! Path algebra for slash-separated, absolute ZX paths.
//!
//! Prefix and suffix tests are aligned on path elements: `/a` is a prefix of
//! `/a/b` but not of `/ab`.

use std::cmp::Ordering;

use crate::error::{ZxError, ZxResult};

/// Lexically clean a path: collapse slashes, drop `.`, resolve `..`.
///
/// An absolute path never climbs above `/`. The empty path cleans to `.`
/// like a relative path.
pub fn clean(p: &str) -> String {
    if p.is_empty() {
        return ".".to_string();
    }
    let rooted = p.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for el in p.split('/') {
        match el {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|l| *l != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            el => out.push(el),
        }
    }
    let joined = out.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Check that `s` is absolute and return it cleaned.
pub fn abs_path(s: &str) -> ZxResult<String> {
    if !s.starts_with('/') {
        return Err(ZxError::other(format!("'{s}' is not an absolute path")));
    }
    Ok(clean(s))
}

/// Reject names that cannot be a single path element.
pub fn bad_name(elem: &str) -> ZxResult<()> {
    if elem.is_empty() || elem.contains('/') || elem == "." || elem == ".." {
        return Err(ZxError::other(format!("bad element name '{elem}'")));
    }
    Ok(())
}

/// Path elements, empty for `/` and for the empty path.
pub fn elems(p: &str) -> Vec<String> {
    if p.is_empty() || p == "/" {
        return Vec::new();
    }
    let c = clean(p);
    let c = c.strip_prefix('/').unwrap_or(&c);
    if c.is_empty() || c == "." {
        return Vec::new();
    }
    c.split('/').map(str::to_string).collect()
}

/// Build an absolute path from elements.
pub fn elems_path<S: AsRef<str>>(els: &[S]) -> String {
    let mut p = String::new();
    for el in els {
        p.push('/');
        p.push_str(el.as_ref());
    }
    if p.is_empty() { "/".to_string() } else { clean(&p) }
}

/// Last element of `p`; `/` for the root.
pub fn base(p: &str) -> String {
    let c = clean(p);
    if c == "/" {
        return c;
    }
    match c.rfind('/') {
        Some(i) => c[i + 1..].to_string(),
        None => c,
    }
}

/// Parent of `p`; `/` for the root and for top-level names.
pub fn parent(p: &str) -> String {
    let c = clean(p);
    match c.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => c[..i].to_string(),
    }
}

/// Join `suffix` under `pref`, never returning an empty path.
pub fn join(pref: &str, suffix: &str) -> String {
    if suffix.is_empty() || suffix == "/" {
        return if pref.is_empty() { "/".to_string() } else { clean(pref) };
    }
    let p = clean(&format!("{pref}/{suffix}"));
    if p.starts_with('/') { p } else { format!("/{p}") }
}

/// Whether `pref` is an element-aligned prefix of `name`.
pub fn has_prefix(name: &str, pref: &str) -> bool {
    if name == pref {
        return true;
    }
    if pref == "/" || pref.is_empty() {
        return name.starts_with('/');
    }
    name.len() > pref.len() && name.starts_with(pref) && name.as_bytes()[pref.len()] == b'/'
}

/// Whether `suff` is an element-aligned suffix of `name`.
pub fn has_suffix(name: &str, suff: &str) -> bool {
    let name = if name.is_empty() { "/" } else { name };
    let suff = if suff == "/" { "" } else { suff };
    if suff.is_empty() || name == suff {
        return true;
    }
    if name.len() <= suff.len() {
        return false;
    }
    name.ends_with(suff)
        && (suff.starts_with('/') || name.as_bytes()[name.len() - suff.len() - 1] == b'/')
}

/// The part of `name` below `pref`.
///
/// Returns `/` when both are equal and the empty string when `pref` is not
/// a prefix of `name`.
pub fn suffix(name: &str, pref: &str) -> String {
    if !has_prefix(name, pref) {
        return String::new();
    }
    if name == pref {
        return "/".to_string();
    }
    if pref == "/" || pref.is_empty() {
        return name.to_string();
    }
    name[pref.len()..].to_string()
}

/// Elements of the common ancestor of both paths.
pub fn common_elems(p0: &str, p1: &str) -> Vec<String> {
    let e0 = elems(p0);
    let e1 = elems(p1);
    e0.iter()
        .zip(e1.iter())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.clone())
        .collect()
}

/// Compare paths one element at a time, so `/a/b` sorts before `/a.b`.
pub fn path_cmp(p0: &str, p1: &str) -> Ordering {
    let e0 = elems(p0);
    let e1 = elems(p1);
    for (a, b) in e0.iter().zip(e1.iter()) {
        match a.cmp(b) {
            Ordering::Equal => {}
            o => return o,
        }
    }
    e0.len().cmp(&e1.len())
}
