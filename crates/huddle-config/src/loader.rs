// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::BrokerConfig;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/huddle/broker.yaml"));
    paths.push(PathBuf::from("/etc/huddle/broker.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/huddle/broker.yaml"));
        paths.push(home.join(".config/huddle/broker.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".huddle/broker.yaml"));
    paths.push(PathBuf::from(".huddle/broker.yml"));
    paths.push(PathBuf::from("huddle.yaml"));
    paths.push(PathBuf::from("huddle.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (the `--config` flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<BrokerConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    // Deserialize the merged YAML value into BrokerConfig, falling back to
    // defaults when no config file was found at all.
    let config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        BrokerConfig::default()
    } else {
        serde_yaml::from_value(merged).context("invalid broker configuration")?
    };
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_overrides() {
        let mut dst = val("port: 9170\nhost: 127.0.0.1");
        merge_yaml(&mut dst, val("port: 8000"));
        assert_eq!(dst["port"], val("8000"));
        assert_eq!(dst["host"], val("127.0.0.1"));
    }

    #[test]
    fn merge_nested_mapping_is_deep() {
        let mut dst = val("session:\n  heartbeat_interval_seconds: 30\n  idle_timeout_seconds: 120");
        merge_yaml(&mut dst, val("session:\n  idle_timeout_seconds: 60"));
        assert_eq!(dst["session"]["heartbeat_interval_seconds"], val("30"));
        assert_eq!(dst["session"]["idle_timeout_seconds"], val("60"));
    }

    #[test]
    fn merge_list_replaces_wholesale() {
        let mut dst = val("session:\n  require_approval_for: [shell_execute]");
        merge_yaml(&mut dst, val("session:\n  require_approval_for: [deploy]"));
        assert_eq!(dst["session"]["require_approval_for"], val("[deploy]"));
    }

    #[test]
    fn explicit_file_is_loaded() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port: 4242").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.port, 4242);
    }

    #[test]
    fn bad_explicit_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port: [this, is, not, a, port]").unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
