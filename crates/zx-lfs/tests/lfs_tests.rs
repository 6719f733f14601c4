//! The standard tree scenarios against a host directory.

use std::sync::Arc;

use tempfile::TempDir;
use zx_core::chg::diffs;
use zx_core::fs::FindItem;
use zx_core::{Dir, Fs, fstest, util};
use zx_lfs::Lfs;

fn tree() -> (Arc<dyn Fs>, TempDir, fstest::Clock) {
    let tmp = TempDir::new().unwrap();
    let clock = fstest::mk_tree(tmp.path()).unwrap();
    let fs: Arc<dyn Fs> = Arc::new(Lfs::new(tmp.path(), false).unwrap());
    (fs, tmp, clock)
}

fn paths(ds: &[Dir]) -> Vec<&str> {
    ds.iter().map(|d| d.path()).collect()
}

#[tokio::test]
async fn stat_standard_files() {
    let (fs, tmp, _) = tree();
    let d = fs.stat("/a/a1").await.unwrap();
    assert_eq!(d.size(), 10154);
    assert_eq!(d.attr("mode"), "0644");
    assert_eq!(d.typ(), "-");
    assert_eq!(d.name(), "a1");
    assert_eq!(
        d.attr("addr"),
        format!("lfs!{}!/a/a1", tmp.path().canonicalize().unwrap().display())
    );
    assert_eq!(fs.stat("/a").await.unwrap().size(), 3);
    assert_eq!(fs.stat("/a/b/c").await.unwrap().size(), 1);
    assert_eq!(fs.stat("/a/b/c/c3").await.unwrap().size(), 44970);
    assert!(fs.stat("/xxx").await.unwrap_err().is_not_exist());
    assert_eq!(fs.stat("/Ctl").await.unwrap().typ(), "c");
}

#[tokio::test]
async fn get_files_and_dirs() {
    let (fs, _tmp, _) = tree();
    for f in fstest::FILES {
        let data = util::get_all(fs.as_ref(), f).await.unwrap();
        assert_eq!(data, fstest::data_for(f).unwrap(), "{f}");
    }
    let ds = util::get_dir(fs.as_ref(), "/").await.unwrap();
    assert_eq!(paths(&ds), ["/Ctl", "/1", "/2", "/a", "/d", "/e"]);
    let ds = util::unpack_dirs(util::recv_all(fs.get("/", 1, 2)).await.unwrap()).unwrap();
    assert_eq!(paths(&ds), ["/1", "/2"]);
}

#[tokio::test]
async fn find_table() {
    let (fs, _tmp, _) = tree();
    let all = util::find_all(fs.as_ref(), "/", "", "", "", 0).await.unwrap();
    assert_eq!(
        paths(&all),
        [
            "/", "/Ctl", "/1", "/2", "/a", "/a/a1", "/a/a2", "/a/b", "/a/b/c", "/a/b/c/c3", "/d",
            "/e", "/e/f"
        ]
    );

    let none = util::find_all(fs.as_ref(), "/a", "name=blah", "", "", 0).await.unwrap();
    assert!(none.is_empty());
    assert!(util::find_all(fs.as_ref(), "/xxx", "", "", "", 0).await.is_err());

    let ds = util::find_all(fs.as_ref(), "/", "type=d&depth>1", "", "", 0).await.unwrap();
    assert_eq!(paths(&ds), ["/a/b", "/a/b/c", "/e/f"]);

    let ds = util::find_all(fs.as_ref(), "/a/b", "depth<=1", "/a", "/x/y", 0).await.unwrap();
    assert_eq!(paths(&ds), ["/x/y/b", "/x/y/b/c"]);

    let ds = util::find_all(fs.as_ref(), "/a/b", "depth<=1", "/a/b", "/c", 0).await.unwrap();
    assert_eq!(paths(&ds), ["/c", "/c/c"]);
}

#[tokio::test]
async fn find_prune() {
    let (fs, _tmp, _) = tree();
    let ds = util::find_all(fs.as_ref(), "/", "path=/a/b & prune", "", "", 0).await.unwrap();
    assert_eq!(paths(&ds), ["/a/b"]);
    assert_eq!(ds[0].err(), Some("pruned"));
}

#[tokio::test]
async fn find_get_files() {
    let (fs, _tmp, _) = tree();
    let items = util::recv_all(fs.find_get("/a", "type=-", "", "", 0)).await.unwrap();
    let mut got = Vec::new();
    let mut cur: Option<(String, Vec<u8>)> = None;
    for it in items {
        match it {
            FindItem::Dir(d) => cur = Some((d.path().to_string(), Vec::new())),
            FindItem::Bytes(b) => cur.as_mut().unwrap().1.extend(b),
            FindItem::End => got.push(cur.take().unwrap()),
        }
    }
    let names: Vec<&str> = got.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(names, ["/a/a1", "/a/a2", "/a/b/c/c3"]);
    for (p, data) in &got {
        assert_eq!(data, &fstest::data_for(p).unwrap());
    }
}

#[tokio::test]
async fn put_get_and_move() {
    let (fs, _tmp, _) = tree();
    let d = Dir::from([("type", "-"), ("mode", "0640")]);
    util::put_all(fs.as_ref(), "/n", d, b"hola").await.unwrap();
    assert_eq!(util::get_all(fs.as_ref(), "/n").await.unwrap(), b"hola");

    fs.mv("/2", "/n2").await.unwrap();
    assert_eq!(fs.stat("/n2").await.unwrap().size(), 31658);
    assert!(fs.stat("/2").await.unwrap_err().is_not_exist());
    fs.mv("/a", "/d/a").await.unwrap();
    assert_eq!(fs.stat("/d/a/b/c/c3").await.unwrap().size(), 44970);
}

#[tokio::test]
async fn mkdir_into_mkdir() {
    let (fs, _tmp, _) = tree();
    util::mkdir(fs.as_ref(), "/d/x", Dir::new()).await.unwrap();
    util::mkdir(fs.as_ref(), "/d/x/y", Dir::new()).await.unwrap();
    assert!(fs.stat("/d/x/y").await.unwrap().is_dir());
    assert!(util::mkdir(fs.as_ref(), "/", Dir::new()).await.is_err());
}

async fn listing(fs: &dyn Fs) -> Vec<String> {
    let ds = util::find_all(fs, "/", "", "", "", 0).await.unwrap();
    ds.iter()
        .map(|d| match d.typ() {
            "-" => format!("{} {}", d.fmt(), d.mtime()),
            _ => d.fmt(),
        })
        .collect()
}

#[tokio::test]
async fn changes_through_the_tree_match_host_changes() {
    let (fs1, _t1, mut c1) = tree();
    let (fs2, t2, mut c2) = tree();
    assert!(diffs(fs1.as_ref(), fs2.as_ref(), "/").await.unwrap().is_empty());

    fstest::mk_zx_chgs(fs1.as_ref(), &mut c1).await.unwrap();
    fstest::mk_zx_chgs2(fs1.as_ref(), &mut c1).await.unwrap();
    let chgs = diffs(fs1.as_ref(), fs2.as_ref(), "/").await.unwrap();
    assert!(!chgs.is_empty());

    fstest::mk_chgs(t2.path(), &mut c2).unwrap();
    fstest::mk_chgs2(t2.path(), &mut c2).unwrap();
    assert_eq!(listing(fs1.as_ref()).await, listing(fs2.as_ref()).await);
    assert_eq!(fs1.stat("/2/n2").await.unwrap().attr("mode"), "0750");
    assert_eq!(fs1.stat("/1").await.unwrap().size(), 50);
}

#[tokio::test]
async fn user_attrs_survive_reopen() {
    let (fs, tmp, _) = tree();
    fs.wstat("/a/a1", Dir::from([("Color", "red")])).await.unwrap();
    fs.wstat("/", Dir::from([("Color", "blue")])).await.unwrap();
    fs.close().await.unwrap();

    let fs: Arc<dyn Fs> = Arc::new(Lfs::new(tmp.path(), false).unwrap());
    assert_eq!(fs.stat("/a/a1").await.unwrap().attr("Color"), "red");
    assert_eq!(fs.stat("/").await.unwrap().attr("Color"), "blue");
    let ds = util::get_dir(fs.as_ref(), "/a").await.unwrap();
    assert!(ds.iter().all(|d| d.name() != zx_lfs::SIDECAR));
    assert_eq!(fs.stat("/a").await.unwrap().size(), 3);
}
