//! Clients and servers talking over in-process pipes and real sockets.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use zx_core::fs::FindItem;
use zx_core::{
    Dir, FindGetter, Fs, Getter, Linker, Mover, Remover, Stater, Wstater, fstest, util,
};
use zx_lfs::Lfs;
use zx_net::auth::{Key, derive_key};
use zx_net::{AuthConfig, Data, TlsConfig, pipe_pair};
use zx_rzx::{Client, DialOpts, Dialer, Server, ServerConfig};

fn tree() -> (Arc<dyn Fs>, TempDir) {
    let tmp = TempDir::new().unwrap();
    fstest::mk_tree(tmp.path()).unwrap();
    std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    let fs: Arc<dyn Fs> = Arc::new(Lfs::new(tmp.path(), false).unwrap());
    (fs, tmp)
}

fn noauth() -> ServerConfig {
    ServerConfig {
        noauth: true,
        ..Default::default()
    }
}

async fn pipe_client(srv: &Server, tree: &str, opts: &DialOpts) -> zx_core::ZxResult<Client> {
    let (s, c) = pipe_pair();
    srv.serve_mux(s);
    Client::start(c, "pipe", tree, opts).await
}

async fn served(cfg: ServerConfig) -> (Server, Client, TempDir) {
    let (fs, tmp) = tree();
    let srv = Server::new("pipe", cfg);
    srv.serve("main", fs).unwrap();
    let c = pipe_client(&srv, "main", &DialOpts::default()).await.unwrap();
    (srv, c, tmp)
}

fn paths(ds: &[Dir]) -> Vec<&str> {
    ds.iter().map(|d| d.path()).collect()
}

#[tokio::test]
async fn stat_and_get() {
    let (_srv, c, _tmp) = served(noauth()).await;
    let d = c.stat("/a/a1").await.unwrap();
    assert_eq!(d.size(), 10154);
    assert_eq!(d.attr("addr"), "zx!pipe!main!/a/a1");
    assert!(c.stat("/xxx").await.unwrap_err().is_not_exist());

    for f in fstest::FILES {
        let data = util::get_all(&c, f).await.unwrap();
        assert_eq!(data, fstest::data_for(f).unwrap(), "{f}");
    }
    let ds = util::get_dir(&c, "/").await.unwrap();
    assert_eq!(paths(&ds), ["/Ctl", "/1", "/2", "/a", "/d", "/e"]);
    assert!(ds.iter().all(|d| d.attr("addr").starts_with("zx!pipe!main!/")));

    let part = util::recv_all(c.get("/a/a1", 10, 5)).await.unwrap().concat();
    assert_eq!(part, fstest::data_for("/a/a1").unwrap()[10..15]);
}

#[tokio::test]
async fn find_and_find_get() {
    let (_srv, c, _tmp) = served(noauth()).await;
    let ds = util::find_all(&c, "/", "type=d&depth>1", "", "", 0).await.unwrap();
    assert_eq!(paths(&ds), ["/a/b", "/a/b/c", "/e/f"]);
    let ds = util::find_all(&c, "/a/b", "depth<=1", "/a", "/x/y", 0).await.unwrap();
    assert_eq!(paths(&ds), ["/x/y/b", "/x/y/b/c"]);
    assert!(util::find_all(&c, "/xxx", "", "", "", 0).await.is_err());

    let items = util::recv_all(c.find_get("/a", "type=-", "", "", 0)).await.unwrap();
    let mut files = Vec::new();
    let mut cur: Option<(String, Vec<u8>)> = None;
    for it in items {
        match it {
            FindItem::Dir(d) => cur = Some((d.path().to_string(), Vec::new())),
            FindItem::Bytes(b) => cur.as_mut().unwrap().1.extend(b),
            FindItem::End => files.push(cur.take().unwrap()),
        }
    }
    assert_eq!(files.len(), 3);
    for (p, data) in files {
        assert_eq!(data, fstest::data_for(&p).unwrap(), "{p}");
    }
}

#[tokio::test]
async fn put_wstat_move_remove() {
    let (_srv, c, _tmp) = served(noauth()).await;
    let d = util::put_all(&c, "/n", Dir::from([("type", "-"), ("mode", "0640")]), b"hola")
        .await
        .unwrap();
    assert_eq!(d.attr("addr"), "zx!pipe!main!/n");
    assert_eq!(util::get_all(&c, "/n").await.unwrap(), b"hola");
    let big = fstest::file_data(3);
    util::put_all(&c, "/big", Dir::from([("type", "-")]), &big).await.unwrap();
    assert_eq!(util::get_all(&c, "/big").await.unwrap(), big);

    let d = c.wstat("/n", Dir::from([("mode", "0600"), ("Color", "red")])).await.unwrap();
    assert_eq!(d.attr("mode"), "0600");
    assert_eq!(c.stat("/n").await.unwrap().attr("Color"), "red");

    util::mkdir(&c, "/nd", Dir::new()).await.unwrap();
    c.mv("/n", "/nd/n").await.unwrap();
    assert_eq!(c.stat("/nd/n").await.unwrap().attr("Color"), "red");
    c.link("/nd/n", "/ln").await.unwrap();
    assert_eq!(util::get_all(&c, "/ln").await.unwrap(), b"hola");

    assert!(c.remove("/nd").await.unwrap_err().is_not_empty());
    c.remove_all("/nd").await.unwrap();
    assert!(c.stat("/nd").await.unwrap_err().is_not_exist());
    assert!(c.remove_all("/").await.unwrap_err().is_perm());
}

#[tokio::test]
async fn ctl_through_the_wire() {
    let (_srv, c, _tmp) = served(noauth()).await;
    let txt = String::from_utf8(util::get_all(&c, "/Ctl").await.unwrap()).unwrap();
    assert!(txt.starts_with("lfs "));
    util::put_all(&c, "/Ctl", Dir::new(), b"debug on").await.unwrap();
    let txt = String::from_utf8(util::get_all(&c, "/Ctl").await.unwrap()).unwrap();
    assert!(txt.contains("debug on"));
    let err = util::put_all(&c, "/Ctl", Dir::new(), b"bogus").await.unwrap_err();
    assert!(err.to_string().contains("bogus"));
}

#[tokio::test]
async fn read_only_server() {
    let cfg = ServerConfig {
        rdonly: true,
        ..noauth()
    };
    let (srv, c, _tmp) = served(cfg).await;
    assert_eq!(c.stat("/2").await.unwrap().size(), 31658);
    let err = util::put_all(&c, "/n", Dir::from([("type", "-")]), b"x").await.unwrap_err();
    assert!(err.is_read_only());
    assert!(c.remove("/1").await.unwrap_err().is_read_only());
    assert!(c.mv("/1", "/n1").await.unwrap_err().is_read_only());
    assert!(srv.status().contains("server rdonly on"));
}

#[tokio::test]
async fn several_trees_on_one_connection() {
    let (fs1, _t1) = tree();
    let (fs2, _t2) = tree();
    let srv = Server::new("pipe", noauth());
    srv.serve("one", fs1).unwrap();
    srv.serve("two", fs2.clone()).unwrap();
    assert!(srv.serve("two", fs2).unwrap_err().is_exists());

    let one = pipe_client(&srv, "one", &DialOpts::default()).await.unwrap();
    assert_eq!(one.trees(), ["main", "one", "two"]);
    let two = one.fsys("two").unwrap();
    util::put_all(&two, "/only2", Dir::from([("type", "-")]), b"x").await.unwrap();
    assert!(one.stat("/only2").await.unwrap_err().is_not_exist());
    assert_eq!(two.stat("/only2").await.unwrap().attr("addr"), "zx!pipe!two!/only2");

    // the default tree is the first one served
    let main = one.fsys("main").unwrap();
    assert!(main.stat("/only2").await.unwrap_err().is_not_exist());
    assert!(one.fsys("three").is_err());
    assert!(pipe_client(&srv, "three", &DialOpts::default()).await.is_err());
}

#[tokio::test]
async fn concurrent_calls() {
    let (_srv, c, _tmp) = served(noauth()).await;
    let mut tasks = Vec::new();
    for i in 0..20 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move {
            let p = format!("/f{i}");
            let data = fstest::file_data(i % 4);
            util::put_all(&c, &p, Dir::from([("type", "-")]), &data).await.unwrap();
            assert_eq!(util::get_all(&c, &p).await.unwrap(), data);
            util::find_all(&c, "/", "", "", "", 0).await.unwrap();
        }));
    }
    let all = async {
        for t in tasks {
            t.await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(30), all).await.unwrap();
    let ds = util::find_all(&c, "/", "name~~f[0-9]", "", "", 0).await.unwrap();
    assert_eq!(ds.len(), 20);
}

#[tokio::test]
async fn hangup_ends_calls() {
    let (srv, c, _tmp) = served(noauth()).await;
    assert_eq!(srv.clients().len(), 1);
    c.ping(Duration::from_secs(5)).await.unwrap();
    c.close();
    tokio::time::timeout(Duration::from_secs(5), c.hup().cancelled()).await.unwrap();
    assert!(c.stat("/").await.is_err());
}

#[tokio::test]
async fn undecodable_request_drops_the_connection() {
    let (fs, _tmp) = tree();
    let srv = Server::new("pipe", noauth());
    srv.serve("main", fs).unwrap();
    let (sm, cm) = pipe_pair();
    srv.serve_mux(sm);
    let c = Client::start(cm.clone(), "pipe", "main", &DialOpts::default()).await.unwrap();
    assert!(c.stat("/nope").await.unwrap_err().is_not_exist());
    assert_eq!(c.stat("/a/a1").await.unwrap().size(), 10154);

    let mut call = cm.rpc().unwrap();
    call.send(Data::Msg(vec![0xff, 0, 0])).await.unwrap();
    assert!(call.recv().await.unwrap().is_err());
    tokio::time::timeout(Duration::from_secs(5), cm.hup().cancelled()).await.unwrap();
    assert!(c.stat("/a/a1").await.is_err());
    let gone = async {
        while !srv.clients().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), gone).await.unwrap();
}

fn keys() -> Vec<Key> {
    ["nemo", "elf"]
        .into_iter()
        .map(|u| Key {
            uid: u.to_string(),
            gids: vec![u.to_string()],
            key: derive_key(&format!("{u} secret")),
        })
        .collect()
}

#[tokio::test]
async fn authenticated_users_get_their_view() {
    let (fs, _tmp) = tree();
    let srv = Server::new(
        "pipe",
        ServerConfig {
            auth: AuthConfig::with_keys(keys()),
            ..Default::default()
        },
    );
    srv.serve("main", fs).unwrap();

    let nemo = DialOpts {
        auth: AuthConfig::with_keys(keys()[..1].to_vec()),
        tls: None,
    };
    let c = pipe_client(&srv, "main", &nemo).await.unwrap();
    assert!(c.auth_info().unwrap().ok);
    assert_eq!(util::get_all(&c, "/a/a2").await.unwrap(), fstest::data_for("/a/a2").unwrap());
    let err = util::put_all(&c, "/a/a2", Dir::new(), b"x").await.unwrap_err();
    assert!(err.is_perm());
    assert!(srv.clients().iter().any(|u| u.starts_with("nemo ")));

    let bad = DialOpts {
        auth: AuthConfig::with_keys(vec![Key {
            uid: "nemo".into(),
            gids: vec![],
            key: derive_key("wrong"),
        }]),
        tls: None,
    };
    assert!(pipe_client(&srv, "main", &bad).await.is_err());
}

#[tokio::test]
async fn dial_over_unix_socket() {
    let (fs, _tmp) = tree();
    let sock = TempDir::new().unwrap();
    let addr = format!("unix!local!{}", sock.path().join("zx.sock").display());
    let srv = Server::listen(&addr, noauth()).await.unwrap();
    srv.serve("main", fs).unwrap();

    let dialer = Dialer::new(DialOpts::default());
    let c1 = dialer.dial(&addr).await.unwrap();
    let c2 = dialer.dial(&format!("{addr}!main")).await.unwrap();
    assert_eq!(dialer.addrs(), [addr.clone()]);
    assert_eq!(c1.stat("/a").await.unwrap().size(), 3);
    assert_eq!(c2.stat("/a/b/c/c3").await.unwrap().size(), 44970);

    dialer.close_all();
    assert!(dialer.addrs().is_empty());
    let c3 = dialer.dial(&addr).await.unwrap();
    assert_eq!(c3.stat("/2").await.unwrap().size(), 31658);
    srv.close();
}

#[tokio::test]
async fn dial_over_tls() {
    let (fs, _tmp) = tree();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let tls = TlsConfig::from_pem(
        cert.cert.pem().as_bytes(),
        cert.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    let cfg = ServerConfig {
        tls: Some(tls),
        ..noauth()
    };
    let srv = Server::listen("tls!localhost!0", cfg).await.unwrap();
    srv.serve("main", fs).unwrap();
    let port = srv.addr().rsplit('!').next().unwrap().to_string();

    let opts = DialOpts {
        tls: Some(
            TlsConfig::client_only()
                .unwrap()
                .with_roots(cert.cert.pem().as_bytes())
                .unwrap(),
        ),
        ..Default::default()
    };
    let c = Client::dial(&format!("tls!localhost!{port}!main"), &opts).await.unwrap();
    assert_eq!(util::get_all(&c, "/a/a1").await.unwrap(), fstest::data_for("/a/a1").unwrap());
    c.close();
    srv.close();
}
