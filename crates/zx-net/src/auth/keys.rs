//! Key files: `~/.ssh/clive.<domain>`.
//!
//! Each entry is two lines, `uid [group...]` and the hex key. A user listed
//! without groups is a member of its own group only.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use zx_core::{ZxError, ZxResult};

use super::crypto::derive_key;

pub const DEFAULT_DOMAIN: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub uid: String,
    pub gids: Vec<String>,
    pub key: Vec<u8>,
}

/// Directory holding key files.
pub fn key_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")).join(".ssh")
}

pub fn key_file(dir: &Path, domain: &str) -> PathBuf {
    let domain = if domain.is_empty() { DEFAULT_DOMAIN } else { domain };
    dir.join(format!("clive.{domain}"))
}

fn io_err(p: &Path, e: std::io::Error) -> ZxError {
    ZxError::from_io(&p.display().to_string(), e)
}

/// Parse key file text.
pub fn parse_keys(text: &str) -> ZxResult<Vec<Key>> {
    let mut keys = Vec::new();
    let mut lines = text.lines();
    while let Some(users) = lines.next() {
        let mut toks = users.split_whitespace();
        let Some(uid) = toks.next() else { break };
        let mut gids: Vec<String> = toks.map(str::to_string).collect();
        if gids.is_empty() {
            gids.push(uid.to_string());
        }
        let hex_key = lines
            .next()
            .ok_or_else(|| ZxError::other(format!("{uid}: missing key")))?;
        let key = hex::decode(hex_key.trim())
            .map_err(|e| ZxError::other(format!("{uid}: bad key: {e}")))?;
        keys.push(Key {
            uid: uid.to_string(),
            gids,
            key,
        });
    }
    Ok(keys)
}

/// Keys in the key file for `domain`; the first one is used when dialling.
pub fn load_key(dir: &Path, domain: &str) -> ZxResult<Vec<Key>> {
    let file = key_file(dir, domain);
    let text = std::fs::read_to_string(&file).map_err(|e| io_err(&file, e))?;
    let keys = parse_keys(&text)?;
    if keys.is_empty() {
        return Err(ZxError::other(format!("{}: no keys", file.display())));
    }
    Ok(keys)
}

/// The entry for `uid`.
pub fn key_for<'a>(keys: &'a [Key], uid: &str) -> Option<&'a Key> {
    keys.iter().find(|k| k.uid == uid)
}

/// Add or replace the key for `user`, derived from `secret`.
pub fn save_key(dir: &Path, domain: &str, user: &str, secret: &str, groups: &[&str]) -> ZxResult<()> {
    let file = key_file(dir, domain);
    let mut keys: Vec<Key> = load_key(dir, domain)
        .unwrap_or_default()
        .into_iter()
        .filter(|k| k.uid != user)
        .collect();
    keys.push(Key {
        uid: user.to_string(),
        gids: groups.iter().map(|g| g.to_string()).collect(),
        key: derive_key(secret),
    });
    let mut text = String::new();
    for k in &keys {
        text.push_str(&k.uid);
        for g in k.gids.iter().filter(|g| groups_written(k, g)) {
            text.push(' ');
            text.push_str(g);
        }
        text.push('\n');
        text.push_str(&hex::encode(&k.key));
        text.push('\n');
    }
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let res = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&file)
        .and_then(|mut f| f.write_all(text.as_bytes()));
    if let Err(e) = res {
        let _ = std::fs::remove_file(&file);
        return Err(io_err(&file, e));
    }
    Ok(())
}

/// A lone own-group entry is implied and not written back.
fn groups_written(k: &Key, g: &str) -> bool {
    !(k.gids.len() == 1 && g == k.uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        save_key(tmp.path(), "", "nemo", "secret", &[]).unwrap();
        save_key(tmp.path(), "", "elf", "other", &["sys", "nemo"]).unwrap();
        save_key(tmp.path(), "", "nemo", "secret2", &[]).unwrap();

        let file = key_file(tmp.path(), "");
        assert!(file.ends_with("clive.default"));
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let keys = load_key(tmp.path(), "default").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].uid, "elf");
        assert_eq!(keys[0].gids, vec!["sys", "nemo"]);
        assert_eq!(keys[1].uid, "nemo");
        assert_eq!(keys[1].gids, vec!["nemo"]);
        assert_eq!(keys[1].key, derive_key("secret2"));
        assert_eq!(key_for(&keys, "elf").unwrap().key, derive_key("other"));
        assert!(key_for(&keys, "nobody").is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_keys("nemo\n").is_err());
        assert!(parse_keys("nemo\nzz\n").is_err());
        assert!(load_key(Path::new("/nonexistent"), "x").unwrap_err().is_not_exist());
    }
}
