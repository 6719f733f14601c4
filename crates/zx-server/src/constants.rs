//! Defaults for zxserve.

/// Listen address when neither the command line nor the config file names one.
pub const DEFAULT_ADDR: &str = "tcp!*!zx";

/// Config file name under `$XDG_CONFIG_HOME/zx/`.
pub const CONFIG_FILE: &str = "server.toml";

/// Log filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG: &str = "info";
