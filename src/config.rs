//! Startup configuration: the TOML equivalent of the original's
//! `ConfigParser`-based `.ini` file, with the cross-field checks the
//! original only discovers at runtime.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tap::TapConfig;

#[derive(Debug, Deserialize)]
struct RawConfig {
    tap: RawTap,
    im: RawIm,
    #[serde(default)]
    config: RawProcess,
}

#[derive(Debug, Deserialize)]
struct RawTap {
    devnum: String,
    ip: String,
    mask: String,
}

#[derive(Debug, Deserialize)]
struct RawIm {
    account: String,
    password: String,
    ip: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProcess {
    #[serde(default = "default_user")]
    user: String,
    #[serde(default = "default_group")]
    group: String,
    #[serde(default)]
    debug: bool,
    #[serde(default = "default_pid_path")]
    pid_path: String,
}

fn default_user() -> String {
    "nobody".to_string()
}
fn default_group() -> String {
    "nogroup".to_string()
}
fn default_pid_path() -> String {
    "/var/run/l2overlay.pid".to_string()
}

/// Fully validated startup configuration, ready to hand to the components
/// that need each piece of it.
#[derive(Debug, Clone)]
pub struct Config {
    pub tap: TapConfig,
    pub account: String,
    pub password: String,
    /// Present iff this node announces itself as externally reachable for
    /// direct-link dial-in.
    pub external: Option<SocketAddr>,
    pub process_user: String,
    pub process_group: String,
    pub debug: bool,
    pub pid_path: PathBuf,
}

/// Search order used when `--config` is not given, matching the original's
/// `~/.xtunnelrc` then `/etc/xtunnel.conf` discovery.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        out.push(PathBuf::from(home).join(".l2overlay.toml"));
    }
    out.push(PathBuf::from("/etc/l2overlay.toml"));
    out
}

/// Loads and validates configuration from `explicit_path` if given,
/// otherwise the first of [`default_search_paths`] that exists.
pub fn load(explicit_path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => default_search_paths()
            .into_iter()
            .find(|candidate| candidate.exists())
            .ok_or_else(|| {
                ConfigError::NotFound(
                    default_search_paths()
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect(),
                )
            })?,
    };

    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    parse(raw)
}

fn parse(raw: RawConfig) -> Result<Config, ConfigError> {
    let ip: Ipv4Addr = raw
        .tap
        .ip
        .parse()
        .map_err(|_| ConfigError::InvalidIpv4(raw.tap.ip.clone(), "tap.ip"))?;
    let mask: Ipv4Addr = raw
        .tap
        .mask
        .parse()
        .map_err(|_| ConfigError::InvalidIpv4(raw.tap.mask.clone(), "tap.mask"))?;

    let external = match (raw.im.ip, raw.im.port) {
        (Some(host), Some(port)) => {
            let host: Ipv4Addr = host
                .parse()
                .map_err(|_| ConfigError::InvalidIpv4(host.clone(), "im.ip"))?;
            Some(SocketAddr::new(host.into(), port))
        }
        (Some(_), None) => return Err(ConfigError::ExternalPortMissing),
        (None, _) => None,
    };

    Ok(Config {
        tap: TapConfig {
            devnum: raw.tap.devnum,
            ip,
            mask,
            owner_user: raw.config.user.clone(),
        },
        account: raw.im.account,
        password: raw.im.password,
        external,
        process_user: raw.config.user,
        process_group: raw.config.group,
        debug: raw.config.debug,
        pid_path: PathBuf::from(raw.config.pid_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toml_internal() -> &'static str {
        r#"
        [tap]
        devnum = "0"
        ip = "10.0.0.1"
        mask = "255.255.255.0"

        [im]
        account = "user@example.com"
        password = "secret"

        [config]
        user = "nobody"
        group = "nogroup"
        debug = true
        pid_path = "/var/run/l2overlay.pid"
        "#
    }

    #[test]
    fn parses_internal_config_without_external_address() {
        let raw: RawConfig = toml::from_str(toml_internal()).unwrap();
        let cfg = parse(raw).unwrap();
        assert_eq!(cfg.tap.ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert!(cfg.external.is_none());
        assert!(cfg.debug);
    }

    #[test]
    fn parses_external_config_with_ip_and_port() {
        let text = format!(
            "{}\n",
            toml_internal().replace(
                "password = \"secret\"",
                "password = \"secret\"\nip = \"203.0.113.9\"\nport = 18080"
            )
        );
        let raw: RawConfig = toml::from_str(&text).unwrap();
        let cfg = parse(raw).unwrap();
        assert_eq!(cfg.external, Some("203.0.113.9:18080".parse().unwrap()));
    }

    /// §6: `im.ip` without `im.port` is a fatal config error.
    #[test]
    fn external_ip_without_port_is_rejected() {
        let text = toml_internal().replace(
            "password = \"secret\"",
            "password = \"secret\"\nip = \"203.0.113.9\"",
        );
        let raw: RawConfig = toml::from_str(&text).unwrap();
        assert!(matches!(parse(raw), Err(ConfigError::ExternalPortMissing)));
    }

    #[test]
    fn invalid_ip_is_rejected() {
        let text = toml_internal().replace("10.0.0.1", "not-an-ip");
        let raw: RawConfig = toml::from_str(&text).unwrap();
        assert!(matches!(parse(raw), Err(ConfigError::InvalidIpv4(_, "tap.ip"))));
    }

    #[test]
    fn defaults_fill_in_missing_process_section() {
        let text = r#"
        [tap]
        devnum = "0"
        ip = "10.0.0.1"
        mask = "255.255.255.0"

        [im]
        account = "user@example.com"
        password = "secret"
        "#;
        let raw: RawConfig = toml::from_str(text).unwrap();
        let cfg = parse(raw).unwrap();
        assert_eq!(cfg.process_user, "nobody");
        assert_eq!(cfg.pid_path, PathBuf::from("/var/run/l2overlay.pid"));
    }
}
