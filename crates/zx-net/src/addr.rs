//! Network addresses: `net!host!port[!tree[!path]]`.

use std::fmt;
use std::str::FromStr;

use zx_core::{ZxError, ZxResult};

/// Port used when an address names none.
pub const DEFAULT_SVC: &str = "zx";
/// Tree used when an address names none.
pub const DEFAULT_TREE: &str = "main";

/// Well-known service names.
const SERVICES: [(&str, u16); 3] = [("ns", 8000), ("sns", 8001), ("zx", 8002)];

/// Complete a short address.
///
/// `host` becomes `tcp!host!zx!main`, `host!port` becomes
/// `tcp!host!port!main` and `net!host!port` gets the `main` tree.
pub fn fill_addr(addr: &str) -> String {
    let toks: Vec<&str> = addr.split('!').collect();
    match toks.len() {
        1 => format!("tcp!{addr}!{DEFAULT_SVC}!{DEFAULT_TREE}"),
        2 => format!("tcp!{addr}!{DEFAULT_TREE}"),
        3 => format!("{addr}!{DEFAULT_TREE}"),
        _ => addr.to_string(),
    }
}

/// Numeric port for a service name.
pub fn port_number(svc: &str) -> ZxResult<u16> {
    if let Some((_, p)) = SERVICES.iter().find(|(n, _)| *n == svc) {
        return Ok(*p);
    }
    svc.parse()
        .map_err(|_| ZxError::other(format!("{svc}: unknown service")))
}

/// Unix socket path for a service.
pub fn unix_path(svc: &str) -> String {
    if svc.starts_with('/') {
        svc.to_string()
    } else {
        format!("/tmp/zx.{svc}")
    }
}

/// True for names meaning this machine.
pub fn is_local(host: &str) -> bool {
    match host {
        "" => false,
        "*" | "localhost" | "local" | "127.0.0.1" | "::1" => true,
        _ => hostname::get()
            .map(|h| h.to_string_lossy() == host)
            .unwrap_or(false),
    }
}

/// A parsed, completed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub net: String,
    pub host: String,
    pub port: String,
    pub tree: String,
    pub path: String,
}

impl Addr {
    /// Parse after completing with [`fill_addr`].
    pub fn parse(addr: &str) -> ZxResult<Self> {
        let full = fill_addr(addr);
        let toks: Vec<&str> = full.splitn(5, '!').collect();
        if toks.len() < 4 || toks[..3].iter().any(|t| t.is_empty()) {
            return Err(ZxError::other(format!("{addr}: bad address")));
        }
        let tree = if toks[3].is_empty() { DEFAULT_TREE } else { toks[3] };
        let path = toks.get(4).copied().unwrap_or("/");
        Ok(Self {
            net: toks[0].to_string(),
            host: toks[1].to_string(),
            port: toks[2].to_string(),
            tree: tree.to_string(),
            path: zx_core::path::clean(if path.is_empty() { "/" } else { path }),
        })
    }

    /// `net!host!port`, the part naming the transport.
    pub fn dial_addr(&self) -> String {
        format!("{}!{}!{}", self.net, self.host, self.port)
    }

    /// Host name usable by the socket layer.
    pub fn sock_host(&self) -> &str {
        match self.host.as_str() {
            "*" | "local" | "localhost" => "127.0.0.1",
            h => h,
        }
    }
}

impl FromStr for Addr {
    type Err = ZxError;

    fn from_str(s: &str) -> ZxResult<Self> {
        Addr::parse(s)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.dial_addr(), self.tree)?;
        if self.path != "/" {
            write!(f, "!{}", self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_addr() {
        assert_eq!(fill_addr("h"), "tcp!h!zx!main");
        assert_eq!(fill_addr("h!9000"), "tcp!h!9000!main");
        assert_eq!(fill_addr("unix!h!zx"), "unix!h!zx!main");
        assert_eq!(fill_addr("tcp!h!zx!other"), "tcp!h!zx!other");
    }

    #[test]
    fn test_parse() {
        let a = Addr::parse("tcp!localhost!zx!t!/a/b").unwrap();
        assert_eq!(a.net, "tcp");
        assert_eq!(a.sock_host(), "127.0.0.1");
        assert_eq!(a.tree, "t");
        assert_eq!(a.path, "/a/b");
        assert_eq!(a.to_string(), "tcp!localhost!zx!t!/a/b");
        assert_eq!(Addr::parse("h").unwrap().to_string(), "tcp!h!zx!main");
        assert!(Addr::parse("!!").is_err());
    }

    #[test]
    fn test_ports() {
        assert_eq!(port_number("zx").unwrap(), 8002);
        assert_eq!(port_number("9999").unwrap(), 9999);
        assert!(port_number("nope").is_err());
        assert_eq!(unix_path("zx"), "/tmp/zx.zx");
        assert_eq!(unix_path("/run/x.sock"), "/run/x.sock");
    }

    proptest::proptest! {
        #[test]
        fn prop_display_reparses(
            net in "[a-z]{1,5}",
            host in "[a-z0-9.]{1,12}",
            port in "[a-z0-9]{1,5}",
            tree in "[a-z]{1,6}",
            path in "(/[a-z]{1,4}){0,3}",
        ) {
            let a = Addr::parse(&format!("{net}!{host}!{port}!{tree}!{path}")).unwrap();
            proptest::prop_assert_eq!(Addr::parse(&a.to_string()).unwrap(), a);
        }
    }
}
