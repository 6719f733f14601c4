//! Host metadata as Dirs.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};
use parking_lot::Mutex;

use zx_core::Dir;

use crate::sidecar::SIDECAR;

/// Cache of host user and group names.
#[derive(Debug, Default)]
pub struct Names {
    users: Mutex<HashMap<u32, String>>,
    groups: Mutex<HashMap<u32, String>>,
}

impl Names {
    pub fn user(&self, uid: u32) -> String {
        self.users
            .lock()
            .entry(uid)
            .or_insert_with(|| match User::from_uid(Uid::from_raw(uid)) {
                Ok(Some(u)) => u.name,
                _ => uid.to_string(),
            })
            .clone()
    }

    pub fn group(&self, gid: u32) -> String {
        self.groups
            .lock()
            .entry(gid)
            .or_insert_with(|| match Group::from_gid(Gid::from_raw(gid)) {
                Ok(Some(g)) => g.name,
                _ => gid.to_string(),
            })
            .clone()
    }
}

fn type_of(md: &Metadata) -> &'static str {
    let ft = md.file_type();
    if ft.is_dir() {
        "d"
    } else if ft.is_symlink() {
        "l"
    } else if ft.is_fifo() || ft.is_socket() {
        "p"
    } else if ft.is_char_device() || ft.is_block_device() {
        "c"
    } else {
        "-"
    }
}

/// Entries in the host directory `p`, not counting the sidecar.
pub async fn dir_size(p: &Path) -> i64 {
    let Ok(mut rd) = tokio::fs::read_dir(p).await else {
        return 0;
    };
    let mut n = 0;
    while let Ok(Some(ent)) = rd.next_entry().await {
        if ent.file_name() != SIDECAR {
            n += 1;
        }
    }
    n
}

/// The Dir for `path` from its host metadata. Directory sizes are left to
/// the caller.
pub fn meta_dir(path: &str, md: &Metadata, names: &Names) -> Dir {
    let mut d = Dir::new();
    d.set("name", zx_core::path::base(path));
    d.set("path", path);
    d.set("type", type_of(md));
    d.set_mode(md.mode());
    d.set_size(md.len() as i64);
    d.set_mtime(md.mtime() * 1_000_000_000 + md.mtime_nsec());
    let uid = names.user(md.uid());
    d.set("Uid", uid.as_str());
    d.set("Gid", names.group(md.gid()));
    d.set("Wuid", uid);
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_meta_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("f");
        std::fs::write(&f, b"hello").unwrap();
        std::fs::write(tmp.path().join(SIDECAR), b"").unwrap();
        let names = Names::default();

        let md = std::fs::symlink_metadata(&f).unwrap();
        let d = meta_dir("/f", &md, &names);
        assert_eq!(d.name(), "f");
        assert_eq!(d.typ(), "-");
        assert_eq!(d.size(), 5);
        assert_eq!(d.attr("Uid"), names.user(md.uid()));
        assert_eq!(d.attr("Wuid"), d.attr("Uid"));

        let md = std::fs::symlink_metadata(tmp.path()).unwrap();
        assert_eq!(meta_dir("/", &md, &names).name(), "/");
        assert_eq!(dir_size(tmp.path()).await, 1);
    }

    #[test]
    fn test_types() {
        let tmp = tempfile::tempdir().unwrap();
        let l = tmp.path().join("l");
        std::os::unix::fs::symlink("nowhere", &l).unwrap();
        let md = std::fs::symlink_metadata(&l).unwrap();
        assert_eq!(type_of(&md), "l");
        let md = std::fs::symlink_metadata(tmp.path()).unwrap();
        assert_eq!(type_of(&md), "d");
    }
}
