//! Load config from file and environment, and the pack catalog it points at.

use std::path::{Path, PathBuf};

use anyhow::Context;
use pack_core::{Catalog, PackConfig, PackDescriptor};
use serde::Deserialize;

/// Host configuration. File: ~/.config/packfetch/config.toml or /etc/packfetch/config.toml.
/// Env overrides: PACKFETCH_REMOTE_URL, PACKFETCH_CATALOG, PACKFETCH_OUTPUT_DIR, PACKFETCH_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Catalog file listing published packs (default "packs.toml").
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,
    /// Mounted entries are written to `output_dir/<pack>/<entry>`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Milliseconds between ticks (default 50).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Per HTTP request timeout (default 30 s).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Serve mounted entries to peers on this TCP port.
    #[serde(default)]
    pub peer_port: Option<u16>,
    /// Packs fetched when none are named on the command line.
    #[serde(default)]
    pub packs: Vec<String>,
    #[serde(default)]
    pub delivery: PackConfig,
}

fn default_catalog() -> PathBuf {
    PathBuf::from("packs.toml")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("packs")
}
fn default_tick_ms() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            output_dir: default_output_dir(),
            tick_ms: default_tick_ms(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
            peer_port: None,
            packs: Vec::new(),
            delivery: PackConfig::default(),
        }
    }
}

pub fn parse(s: &str) -> anyhow::Result<Config> {
    toml::from_str(s).context("invalid config")
}

/// Overlay environment values. Unparsable numbers are ignored.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("PACKFETCH_REMOTE_URL") {
        c.delivery.remote_url = url;
    }
    if let Some(path) = lookup("PACKFETCH_CATALOG") {
        c.catalog = PathBuf::from(path);
    }
    if let Some(path) = lookup("PACKFETCH_OUTPUT_DIR") {
        c.output_dir = PathBuf::from(path);
    }
    if let Some(ms) = lookup("PACKFETCH_TICK_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.tick_ms = ms.max(1);
    }
}

/// Load config: default, then `explicit` or the first config file found, then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading config {}", p.display()))?;
            parse(&s).with_context(|| format!("in {}", p.display()))?
        }
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/packfetch/config.toml"));
    }
    out.push(PathBuf::from("/etc/packfetch/config.toml"));
    out
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    packs: Vec<PackDescriptor>,
}

pub fn parse_catalog(s: &str) -> anyhow::Result<Catalog> {
    let file: CatalogFile = toml::from_str(s).context("invalid catalog")?;
    Ok(Catalog::from_descriptors(file.packs)?)
}

pub fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    parse_catalog(&s).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_is_all_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.catalog, PathBuf::from("packs.toml"));
        assert_eq!(c.tick_ms, 50);
        assert_eq!(c.request_timeout_secs, 30);
        assert_eq!(c.peer_port, None);
        assert_eq!(c.delivery, PackConfig::default());
    }

    #[test]
    fn delivery_table_is_nested() {
        let c = parse(
            r#"
            output_dir = "/tmp/out"
            packs = ["base"]

            [delivery]
            remote_url = "https://cdn.example.com/packs"
            chunk_size = 65536
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(c.packs, vec!["base".to_string()]);
        assert_eq!(c.delivery.remote_url, "https://cdn.example.com/packs");
        assert_eq!(c.delivery.chunk_size, 65536);
        assert_eq!(c.delivery.max_attempts, 5);
        assert_eq!(c.delivery.pack_suffix, ".pack");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
        assert!(parse("[delivery]\nretries = 2").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("PACKFETCH_REMOTE_URL", "http://mirror.local/packs"),
            ("PACKFETCH_OUTPUT_DIR", "out"),
            ("PACKFETCH_TICK_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut c = parse("tick_ms = 20").unwrap();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.delivery.remote_url, "http://mirror.local/packs");
        assert_eq!(c.output_dir, PathBuf::from("out"));
        assert_eq!(c.tick_ms, 20);
        assert_eq!(c.catalog, PathBuf::from("packs.toml"));
    }

    #[test]
    fn catalog_file_parses_descriptors() {
        let catalog = parse_catalog(
            r#"
            [[packs]]
            name = "base"

            [[packs]]
            name = "level1"
            archive_checksum = 305419896
            dependencies = ["base"]
            "#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 2);
        let level = catalog.get("level1").unwrap();
        assert_eq!(level.archive_checksum, Some(0x1234_5678));
        assert_eq!(level.dependencies, vec!["base".to_string()]);
    }

    #[test]
    fn catalog_with_unknown_dependency_fails() {
        let err = parse_catalog(
            r#"
            [[packs]]
            name = "level1"
            dependencies = ["base"]
            "#,
        );
        assert!(err.is_err());
    }
}
