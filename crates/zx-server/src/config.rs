//! Command line and config file.
//!
//! The config file is TOML. Command line values win over file values;
//! boolean switches can only turn things on, and a `NAME=DIR` argument
//! replaces a file tree with the same name.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

use crate::constants::{CONFIG_FILE, DEFAULT_ADDR};

/// Serve local directories as zx trees.
#[derive(Parser, Debug, Default)]
#[command(name = "zxserve")]
#[command(about = "Serve local directories as zx trees")]
pub struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/zx/server.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address, network!host!port
    #[arg(long)]
    pub addr: Option<String>,

    /// Do not authenticate clients
    #[arg(long)]
    pub noauth: bool,

    /// Refuse every change to the served trees
    #[arg(long)]
    pub rdonly: bool,

    /// Key file domain used to authenticate clients
    #[arg(long)]
    pub domain: Option<String>,

    /// Server certificate (PEM)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Put a write-back cache in front of each tree
    #[arg(long)]
    pub cache: bool,

    /// Trees to serve
    #[arg(value_name = "NAME=DIR", value_parser = parse_tree)]
    pub trees: Vec<TreeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeConfig {
    pub name: String,
    pub path: PathBuf,
    /// Refuse changes to this tree only.
    #[serde(default)]
    pub rdonly: bool,
}

/// Contents of `server.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub noauth: bool,
    pub rdonly: bool,
    pub domain: Option<String>,
    pub cache: bool,
    pub tls: Option<TlsFiles>,
    #[serde(rename = "tree")]
    pub trees: Vec<TreeConfig>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Where the config file lives unless `--config` says otherwise.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("zx").join(CONFIG_FILE))
}

fn parse_tree(s: &str) -> Result<TreeConfig, String> {
    let Some((name, dir)) = s.split_once('=') else {
        return Err(format!("{s}: want NAME=DIR"));
    };
    if name.is_empty() || dir.is_empty() {
        return Err(format!("{s}: want NAME=DIR"));
    }
    Ok(TreeConfig {
        name: name.to_string(),
        path: PathBuf::from(dir),
        rdonly: false,
    })
}

fn expand(p: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
}

/// Everything zxserve needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub addr: String,
    pub noauth: bool,
    pub rdonly: bool,
    pub domain: String,
    pub cache: bool,
    pub tls: Option<TlsFiles>,
    pub trees: Vec<TreeConfig>,
}

impl Settings {
    /// Read the config file named by `args` (or the default one, if it
    /// exists) and apply the command line on top.
    pub fn load(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(p) => FileConfig::load(&expand(p))?,
            None => match default_config_path() {
                Some(p) if p.exists() => FileConfig::load(&p)?,
                _ => FileConfig::default(),
            },
        };
        Self::merge(file, args)
    }

    pub fn merge(file: FileConfig, args: &Args) -> Result<Self> {
        let tls = match (&args.tls_cert, &args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => file.tls,
        };
        let mut trees = file.trees;
        for t in &args.trees {
            match trees.iter_mut().find(|old| old.name == t.name) {
                Some(old) => *old = t.clone(),
                None => trees.push(t.clone()),
            }
        }
        if trees.is_empty() {
            bail!("no trees to serve");
        }
        for (i, t) in trees.iter().enumerate() {
            if trees[..i].iter().any(|o| o.name == t.name) {
                bail!("tree {} given twice", t.name);
            }
        }
        for t in &mut trees {
            t.path = expand(&t.path);
        }
        Ok(Self {
            addr: args
                .addr
                .clone()
                .or(file.addr)
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            noauth: args.noauth || file.noauth,
            rdonly: args.rdonly || file.rdonly,
            domain: args.domain.clone().or(file.domain).unwrap_or_default(),
            cache: args.cache || file.cache,
            tls: tls.map(|t| TlsFiles {
                cert: expand(&t.cert),
                key: expand(&t.key),
            }),
            trees,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
addr = "tcp!*!8003"
noauth = true
domain = "lab"

[tls]
cert = "/etc/zx/server.pem"
key = "/etc/zx/server.key"

[[tree]]
name = "main"
path = "/srv/zx"

[[tree]]
name = "dump"
path = "/srv/dump"
rdonly = true
"#;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("zxserve").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_file() {
        let f = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(f.addr.as_deref(), Some("tcp!*!8003"));
        assert!(f.noauth);
        assert!(!f.cache);
        assert_eq!(f.trees.len(), 2);
        assert!(f.trees[1].rdonly);
        assert_eq!(f.tls.unwrap().key, PathBuf::from("/etc/zx/server.key"));

        assert!(FileConfig::parse("bogus = 1").is_err());
        assert_eq!(FileConfig::parse("").unwrap(), FileConfig::default());
    }

    #[test]
    fn test_command_line_wins() {
        let f = FileConfig::parse(SAMPLE).unwrap();
        let a = args(&["--addr", "tcp!localhost!9000", "--cache", "main=/tmp/zx", "x=/tmp/x"]);
        let s = Settings::merge(f, &a).unwrap();
        assert_eq!(s.addr, "tcp!localhost!9000");
        assert!(s.noauth && s.cache && !s.rdonly);
        assert_eq!(s.domain, "lab");
        let trees: Vec<(&str, &Path)> = s.trees.iter().map(|t| (t.name.as_str(), t.path.as_path())).collect();
        assert_eq!(
            trees,
            [
                ("main", Path::new("/tmp/zx")),
                ("dump", Path::new("/srv/dump")),
                ("x", Path::new("/tmp/x"))
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let s = Settings::merge(FileConfig::default(), &args(&["main=/srv"])).unwrap();
        assert_eq!(s.addr, DEFAULT_ADDR);
        assert_eq!(s.domain, "");
        assert!(s.tls.is_none());

        let err = Settings::merge(FileConfig::default(), &args(&[])).unwrap_err();
        assert_eq!(err.to_string(), "no trees to serve");
        let err = Settings::merge(FileConfig::default(), &args(&["a=/x", "a=/y"])).unwrap_err();
        assert_eq!(err.to_string(), "tree a given twice");
    }

    #[test]
    fn test_tree_args() {
        assert!(Args::try_parse_from(["zxserve", "nodir"]).is_err());
        assert!(Args::try_parse_from(["zxserve", "=/x"]).is_err());
        assert!(Args::try_parse_from(["zxserve", "--tls-cert", "c.pem", "a=/x"]).is_err());
        let a = args(&["--tls-cert", "c.pem", "--tls-key", "k.pem", "a=/x"]);
        let s = Settings::merge(FileConfig::default(), &a).unwrap();
        assert_eq!(s.tls.unwrap().cert, PathBuf::from("c.pem"));
    }

    #[test]
    fn test_tilde_expansion() {
        let Some(home) = dirs::home_dir() else { return };
        let s = Settings::merge(FileConfig::default(), &args(&["main=~/zx"])).unwrap();
        assert_eq!(s.trees[0].path, home.join("zx"));
    }

    #[test]
    fn test_missing_config_file() {
        let a = args(&["--config", "/nonexistent/zx/server.toml", "main=/srv"]);
        let err = Settings::load(&a).unwrap_err();
        assert!(format!("{err:#}").contains("reading /nonexistent/zx/server.toml"));
    }
}
