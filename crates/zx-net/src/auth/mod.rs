//! Challenge-response authentication on a fresh call.
//!
//! Both peers send an [`AuthMsg`] carrying a random challenge, agree on a
//! protocol set and, when both have auth enabled, return each other's
//! challenge encrypted with the shared key. The whole exchange runs under a
//! timeout; any failure ends the call with the error in both directions.

mod crypto;
mod keys;

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, warn};

use zx_core::codec::Reader;
use zx_core::{AuthInfo, ZxError, ZxResult};

use crate::frame::Data;
use crate::mux::Conn;

pub use crypto::{CHALLENGE_LEN, derive_key, encrypt};
pub use keys::{DEFAULT_DOMAIN, Key, key_dir, key_file, key_for, load_key, parse_keys, save_key};

/// Error text when only one side has auth enabled.
pub const AUTH_DISABLED: &str = "auth disabled";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol offered by default.
pub const DEFAULT_PROTO: &str = "zx";

/// True for the error reported when the peers disagree on enabling auth.
pub fn is_auth_disabled(e: &ZxError) -> bool {
    e.to_string().ends_with(AUTH_DISABLED)
}

/// One side's settings for the exchange.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Our user when auth is disabled or when serving.
    pub user: String,
    pub speaks_for: String,
    /// Keys known to us; a client uses the first one.
    pub keys: Vec<Key>,
    pub protos: Vec<String>,
    pub timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl AuthConfig {
    /// Auth disabled, running as the current user.
    pub fn disabled() -> Self {
        let user = whoami::username();
        Self {
            enabled: false,
            speaks_for: user.clone(),
            user,
            keys: Vec::new(),
            protos: vec![DEFAULT_PROTO.to_string()],
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Auth enabled with the given keys.
    pub fn with_keys(keys: Vec<Key>) -> Self {
        let mut cfg = Self::disabled();
        if let Some(k) = keys.first() {
            cfg.user = k.uid.clone();
            cfg.speaks_for = k.uid.clone();
        }
        cfg.enabled = true;
        cfg.keys = keys;
        cfg
    }

    /// Auth enabled with the keys for `domain` in the user's key directory.
    pub fn load(domain: &str) -> ZxResult<Self> {
        Ok(Self::with_keys(load_key(&key_dir(), domain)?))
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = t;
        self
    }
}

/// What each side sends first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMsg {
    pub enabled: bool,
    pub user: String,
    pub speaks_for: String,
    pub protos: Vec<String>,
    pub challenge: [u8; CHALLENGE_LEN],
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn get_cstr(r: &mut Reader<'_>) -> ZxResult<String> {
    let mut b = Vec::new();
    loop {
        match r.u8()? {
            0 => break,
            c => b.push(c),
        }
    }
    String::from_utf8(b).map_err(|_| ZxError::auth("auth: bad string"))
}

impl AuthMsg {
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_cstr(&mut buf, if self.enabled { "auth" } else { "noauth" });
        put_cstr(&mut buf, &self.user);
        put_cstr(&mut buf, &self.speaks_for);
        buf.push(self.protos.len() as u8);
        for p in &self.protos {
            put_cstr(&mut buf, p);
        }
        buf.extend_from_slice(&self.challenge);
        buf
    }

    pub fn unpack(b: &[u8]) -> ZxResult<Self> {
        let mut r = Reader::new(b);
        let enabled = match get_cstr(&mut r)?.as_str() {
            "auth" => true,
            "noauth" => false,
            s => return Err(ZxError::auth(format!("auth: bad header '{s}'"))),
        };
        let user = get_cstr(&mut r)?;
        let speaks_for = get_cstr(&mut r)?;
        let n = r.u8()?;
        let mut protos = Vec::with_capacity(n as usize);
        for _ in 0..n {
            protos.push(get_cstr(&mut r)?);
        }
        let ch = r.bytes(CHALLENGE_LEN)?;
        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(ch);
        Ok(Self {
            enabled,
            user,
            speaks_for,
            protos,
            challenge,
        })
    }
}

/// Authenticate the dialling side of `conn`.
pub async fn at_client(conn: &mut Conn, cfg: &AuthConfig) -> ZxResult<AuthInfo> {
    run(conn, cfg, false).await
}

/// Authenticate the accepting side of `conn`; the result describes the peer.
pub async fn at_server(conn: &mut Conn, cfg: &AuthConfig) -> ZxResult<AuthInfo> {
    run(conn, cfg, true).await
}

async fn run(conn: &mut Conn, cfg: &AuthConfig, server: bool) -> ZxResult<AuthInfo> {
    let res = match tokio::time::timeout(cfg.timeout, exchange(conn, cfg, server)).await {
        Ok(r) => r,
        Err(_) => Err(ZxError::timeout("auth timed out")),
    };
    match res {
        Ok(ai) => {
            debug!(tag = %conn.tag, uid = %ai.uid, ok = ai.ok, "auth done");
            Ok(ai)
        }
        Err(e) => {
            if !is_auth_disabled(&e) {
                warn!(tag = %conn.tag, error = %e, "auth failed");
            }
            conn.fail(e.clone()).await;
            conn.rx.close();
            Err(e)
        }
    }
}

async fn recv_raw(conn: &mut Conn) -> ZxResult<Vec<u8>> {
    match conn.recv().await {
        Some(Ok(Data::Raw(b))) => Ok(b),
        Some(Ok(d)) => Err(ZxError::auth(format!("auth: unexpected {}", d.describe()))),
        Some(Err(e)) => Err(e),
        None => Err(ZxError::closed("auth: peer hung up")),
    }
}

async fn exchange(conn: &mut Conn, cfg: &AuthConfig, server: bool) -> ZxResult<AuthInfo> {
    let mine = AuthMsg {
        enabled: cfg.enabled,
        user: cfg.user.clone(),
        speaks_for: cfg.speaks_for.clone(),
        protos: cfg.protos.clone(),
        challenge: crypto::challenge(),
    };
    conn.send(Data::Raw(mine.pack())).await?;
    let peer = AuthMsg::unpack(&recv_raw(conn).await?)?;

    let ours: BTreeSet<&String> = mine.protos.iter().collect();
    let proto: BTreeSet<String> = peer
        .protos
        .iter()
        .filter(|p| ours.contains(p))
        .cloned()
        .collect();
    if proto.is_empty() {
        return Err(ZxError::auth("no shared protocol"));
    }
    let mut ai = if server {
        AuthInfo::new(peer.user.clone())
    } else {
        AuthInfo::new(mine.user.clone())
    };
    ai.speaks_for = if server { peer.speaks_for.clone() } else { mine.speaks_for.clone() };
    ai.proto = proto;

    match (mine.enabled, peer.enabled) {
        (false, false) => return Ok(ai),
        (true, true) => {}
        _ => return Err(ZxError::auth(AUTH_DISABLED)),
    }

    let key = if server {
        key_for(&cfg.keys, &peer.user)
    } else {
        cfg.keys.first()
    }
    .ok_or_else(|| ZxError::auth("wrong user/key"))?;
    ai.gids.extend(key.gids.iter().cloned());

    conn.send(Data::Raw(encrypt(&key.key, &peer.challenge)?)).await?;
    let reply = recv_raw(conn).await?;
    if reply.is_empty() {
        return Err(ZxError::auth("auth failed: empty reply"));
    }
    if reply != encrypt(&key.key, &mine.challenge)? {
        return Err(ZxError::auth("auth failed: bad reply"));
    }
    ai.ok = true;
    Ok(ai)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::pipe_pair;

    fn keys(user: &str, secret: &str, groups: &[&str]) -> Vec<Key> {
        let mut gids: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        if gids.is_empty() {
            gids.push(user.to_string());
        }
        vec![Key {
            uid: user.to_string(),
            gids,
            key: derive_key(secret),
        }]
    }

    async fn pair(cli: AuthConfig, srv: AuthConfig) -> (ZxResult<AuthInfo>, ZxResult<AuthInfo>) {
        let (sm, cm) = pipe_pair();
        let server = tokio::spawn(async move {
            let mut c = sm.accept().await.expect("no call");
            at_server(&mut c, &srv).await
        });
        let mut c = cm.rpc().unwrap();
        let cr = at_client(&mut c, &cli).await;
        (cr, server.await.unwrap())
    }

    #[test]
    fn test_msg_pack() {
        let m = AuthMsg {
            enabled: true,
            user: "nemo".into(),
            speaks_for: "elf".into(),
            protos: vec!["zx".into(), "tls".into()],
            challenge: [3; CHALLENGE_LEN],
        };
        let b = m.pack();
        assert!(b.starts_with(b"auth\0nemo\0elf\0\x02zx\0tls\0"));
        assert_eq!(AuthMsg::unpack(&b).unwrap(), m);
        assert!(AuthMsg::unpack(&b[..b.len() - 1]).is_err());
        assert!(AuthMsg::unpack(b"what\0").is_err());
    }

    #[tokio::test]
    async fn test_auth_ok() {
        let cli = AuthConfig::with_keys(keys("nemo", "secret", &[]));
        let mut skeys = keys("nemo", "secret", &["nemo", "sys"]);
        skeys.extend(keys("elf", "x", &[]));
        let srv = AuthConfig::with_keys(skeys);
        let (cr, sr) = pair(cli, srv).await;
        let ci = cr.unwrap();
        let si = sr.unwrap();
        assert!(ci.ok && si.ok);
        assert_eq!(si.uid, "nemo");
        assert!(si.gids.contains("sys"));
        assert_eq!(ci.uid, "nemo");
        assert!(si.proto.contains("zx"));
    }

    #[tokio::test]
    async fn test_bad_key() {
        let cli = AuthConfig::with_keys(keys("nemo", "secret", &[]));
        let srv = AuthConfig::with_keys(keys("nemo", "other", &[]));
        let (cr, sr) = pair(cli, srv).await;
        assert!(cr.is_err());
        assert_eq!(sr.unwrap_err().to_string(), "auth failed: bad reply");
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let cli = AuthConfig::with_keys(keys("nemo", "secret", &[]));
        let srv = AuthConfig::with_keys(keys("elf", "secret", &[]));
        let (cr, sr) = pair(cli, srv).await;
        assert_eq!(sr.unwrap_err().to_string(), "wrong user/key");
        assert!(cr.is_err());
    }

    #[tokio::test]
    async fn test_disabled() {
        let (cr, sr) = pair(AuthConfig::disabled(), AuthConfig::disabled()).await;
        assert!(!cr.unwrap().ok);
        assert!(!sr.unwrap().ok);

        let cli = AuthConfig::with_keys(keys("nemo", "secret", &[]));
        let (cr, sr) = pair(cli, AuthConfig::disabled()).await;
        assert!(is_auth_disabled(&cr.unwrap_err()));
        assert!(is_auth_disabled(&sr.unwrap_err()));
    }

    #[tokio::test]
    async fn test_no_shared_protocol() {
        let mut cli = AuthConfig::disabled();
        cli.protos = vec!["other".into()];
        let (cr, sr) = pair(cli, AuthConfig::disabled()).await;
        assert_eq!(cr.unwrap_err().to_string(), "no shared protocol");
        assert!(sr.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let (sm, cm) = pipe_pair();
        let _hold = tokio::spawn(async move {
            let _c = sm.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let mut c = cm.rpc().unwrap();
        let cfg = AuthConfig::disabled().timeout(Duration::from_millis(100));
        let err = at_client(&mut c, &cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "auth timed out");
    }
}
