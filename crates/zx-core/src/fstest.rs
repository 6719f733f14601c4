//! The standard test tree and change sets, shared by the crates' tests.
//!
//! ```text
//! /1  /2  /a/a1  /a/a2  /a/b/c/c3  /d  /e/f
//! ```

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use filetime::FileTime;

use crate::dir::Dir;
use crate::error::ZxResult;
use crate::fs::Fs;
use crate::util;

/// Directories in the standard tree, parents first.
pub const DIRS: [&str; 6] = ["/a", "/a/b", "/a/b/c", "/d", "/e", "/e/f"];

/// Files in the standard tree.
pub const FILES: [&str; 5] = ["/1", "/a/a1", "/a/a2", "/a/b/c/c3", "/2"];

/// Contents of the i-th file: `i*1024` numbered lines.
pub fn file_data(i: usize) -> Vec<u8> {
    let name = FILES[i];
    let mut data = Vec::new();
    for k in 0..i * 1024 {
        data.extend_from_slice(format!("{name} {k}\n").as_bytes());
    }
    data
}

/// Contents of the standard file at `path`.
pub fn data_for(path: &str) -> Option<Vec<u8>> {
    FILES.iter().position(|f| *f == path).map(file_data)
}

/// Hands out predictable modification times, one second apart.
#[derive(Debug, Default)]
pub struct Clock {
    next: i64,
}

impl Clock {
    pub fn tick(&mut self) -> i64 {
        let t = self.next;
        self.next += 1_000_000_000;
        t
    }

    /// Set a predictable mtime on a host file.
    pub fn touch(&mut self, p: &Path) -> io::Result<()> {
        let t = self.tick();
        let ft = FileTime::from_unix_time(t / 1_000_000_000, (t % 1_000_000_000) as u32);
        filetime::set_file_times(p, ft, ft)
    }

    /// Set a predictable mtime through a tree.
    pub async fn touch_zx(&mut self, fs: &dyn Fs, path: &str) -> ZxResult<Dir> {
        let t = self.tick();
        fs.wstat(path, Dir::new().with("mtime", t.to_string())).await
    }
}

fn host(root: &Path, p: &str) -> std::path::PathBuf {
    root.join(p.trim_start_matches('/'))
}

fn set_mode(p: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(p, std::fs::Permissions::from_mode(mode))
}

/// Build the standard tree under the host directory `root`, which is
/// made mode 0755.
pub fn mk_tree(root: &Path) -> io::Result<Clock> {
    let mut clock = Clock::default();
    std::fs::create_dir_all(root)?;
    set_mode(root, 0o755)?;
    for d in DIRS {
        let p = host(root, d);
        std::fs::create_dir_all(&p)?;
        set_mode(&p, 0o755)?;
    }
    for (i, f) in FILES.iter().enumerate() {
        let p = host(root, f);
        std::fs::write(&p, file_data(i))?;
        set_mode(&p, 0o644)?;
    }
    for f in FILES {
        clock.touch(&host(root, f))?;
    }
    for d in DIRS.iter().rev() {
        clock.touch(&host(root, d))?;
    }
    Ok(clock)
}

/// Build the standard tree through a tree.
pub async fn mk_zx_tree(fs: &dyn Fs) -> ZxResult<Clock> {
    let mut clock = Clock::default();
    for d in DIRS {
        util::mkdir_all(fs, d, Dir::from([("mode", "0755")])).await?;
    }
    for (i, f) in FILES.iter().enumerate() {
        let d = Dir::from([("type", "-"), ("mode", "0644")]);
        util::put_all(fs, f, d, &file_data(i)).await?;
    }
    for f in FILES {
        clock.touch_zx(fs, f).await?;
    }
    for d in DIRS {
        clock.touch_zx(fs, d).await?;
    }
    Ok(clock)
}

/// Change the host tree: touch /a/a1, chmod /a/a2, remove /a/b/c, and
/// create /a/n/m/m1.
pub fn mk_chgs(root: &Path, clock: &mut Clock) -> io::Result<()> {
    clock.touch(&host(root, "/a/a1"))?;
    set_mode(&host(root, "/a/a2"), 0o750)?;
    std::fs::remove_dir_all(host(root, "/a/b/c"))?;
    std::fs::create_dir_all(host(root, "/a/n/m"))?;
    set_mode(&host(root, "/a/n"), 0o750)?;
    set_mode(&host(root, "/a/n/m"), 0o750)?;
    let m1 = host(root, "/a/n/m/m1");
    std::fs::write(&m1, b"a new file\n")?;
    set_mode(&m1, 0o640)?;
    for p in ["/a/n/m/m1", "/a/n/m", "/a/n", "/a"] {
        clock.touch(&host(root, p))?;
    }
    Ok(())
}

/// Change the host tree: replace the file /2 with the dir /2/n2 and
/// truncate /1.
pub fn mk_chgs2(root: &Path, clock: &mut Clock) -> io::Result<()> {
    std::fs::remove_file(host(root, "/2"))?;
    std::fs::create_dir_all(host(root, "/2/n2"))?;
    set_mode(&host(root, "/2"), 0o750)?;
    set_mode(&host(root, "/2/n2"), 0o750)?;
    clock.touch(&host(root, "/2/n2"))?;
    clock.touch(&host(root, "/2"))?;
    let f = std::fs::OpenOptions::new().write(true).open(host(root, "/1"))?;
    f.set_len(50)?;
    drop(f);
    clock.touch(&host(root, "/1"))
}

fn dmode(mode: &str) -> Dir {
    Dir::from([("mode", mode)])
}

/// Same as [`mk_chgs`], through a tree.
pub async fn mk_zx_chgs(fs: &dyn Fs, clock: &mut Clock) -> ZxResult<()> {
    clock.touch_zx(fs, "/a/a1").await?;
    fs.wstat("/a/a2", dmode("0750")).await?;
    fs.remove_all("/a/b/c").await?;
    let _ = util::mkdir(fs, "/a", dmode("0750")).await;
    let _ = util::mkdir(fs, "/a/n", dmode("0750")).await;
    util::mkdir(fs, "/a/n/m", dmode("0750")).await?;
    let d = Dir::from([("type", "-"), ("mode", "0640")]);
    util::put_all(fs, "/a/n/m/m1", d, b"a new file\n").await?;
    for p in ["/a/n/m/m1", "/a/n/m", "/a/n", "/a"] {
        clock.touch_zx(fs, p).await?;
    }
    Ok(())
}

/// Same as [`mk_chgs2`], through a tree.
pub async fn mk_zx_chgs2(fs: &dyn Fs, clock: &mut Clock) -> ZxResult<()> {
    fs.remove("/2").await?;
    let _ = util::mkdir(fs, "/2", dmode("0750")).await;
    util::mkdir(fs, "/2/n2", dmode("0750")).await?;
    clock.touch_zx(fs, "/2/n2").await?;
    clock.touch_zx(fs, "/2").await?;
    fs.wstat("/1", Dir::from([("size", "50")])).await?;
    clock.touch_zx(fs, "/1").await?;
    Ok(())
}
