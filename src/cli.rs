// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// The huddle session broker.
///
/// Humans and agents connect over WebSocket at `/ws`, exchange typed
/// protocol envelopes, and gate irreversible agent actions behind
/// explicit human approval.
#[derive(Parser, Debug)]
#[command(name = "huddle", version, about)]
pub struct Cli {
    /// Port to listen on (overrides the config file).
    #[arg(long)]
    pub port: Option<u16>,

    /// Interface to bind (overrides the config file).
    #[arg(long)]
    pub host: Option<String>,

    /// Path to an explicit broker config file (YAML).  Merged over the
    /// standard search path layers.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (default: info; RUST_LOG overrides).
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_and_host_overrides() {
        let cli = Cli::parse_from(["huddle", "--port", "4242", "--host", "0.0.0.0"]);
        assert_eq!(cli.port, Some(4242));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn defaults_to_no_overrides() {
        let cli = Cli::parse_from(["huddle"]);
        assert!(cli.port.is_none());
        assert!(cli.host.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn short_config_flag_works() {
        let cli = Cli::parse_from(["huddle", "-c", "/tmp/broker.yaml"]);
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/broker.yaml"))
        );
    }
}
