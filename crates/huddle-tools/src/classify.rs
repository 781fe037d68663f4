// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Risk classification of shell commands.
//!
//! Classification is a priority-ordered list of regex rules over the
//! literal command string; the first matching rule wins.  The table is
//! built once and shared immutably — classifying the same string twice
//! always yields the same record.
//!
//! Rule order is load-bearing: blocked rules are checked before
//! destructive, destructive before write, write before read.  A command
//! that matches nothing defaults to write / medium / approval required —
//! the safe default for anything we have never seen.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use huddle_protocol::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandCategory {
    Read,
    Write,
    Destructive,
    Blocked,
}

/// The classification record for one command string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandClass {
    pub category: CommandCategory,
    pub risk: RiskLevel,
    pub requires_approval: bool,
    pub reason: &'static str,
}

impl CommandClass {
    pub fn is_blocked(&self) -> bool {
        self.category == CommandCategory::Blocked
    }

    /// Category-default execution timeout in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        match self.category {
            CommandCategory::Read => 30,
            CommandCategory::Write | CommandCategory::Destructive => 120,
            CommandCategory::Blocked => 0,
        }
    }

    /// Category-default per-stream output cap in bytes.
    pub fn default_max_buffer_bytes(&self) -> usize {
        match self.category {
            CommandCategory::Read => 1024 * 1024,
            _ => 4 * 1024 * 1024,
        }
    }
}

struct Rule {
    pattern: Regex,
    category: CommandCategory,
    risk: RiskLevel,
    requires_approval: bool,
    reason: &'static str,
}

impl Rule {
    fn new(
        pattern: &str,
        category: CommandCategory,
        risk: RiskLevel,
        requires_approval: bool,
        reason: &'static str,
    ) -> Self {
        Self {
            // Patterns are static and tested; a bad one is a programming
            // error caught by the table test below.
            pattern: Regex::new(pattern).expect("invalid classifier pattern"),
            category,
            risk,
            requires_approval,
            reason,
        }
    }
}

fn rules() -> &'static Vec<Rule> {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(build_rules)
}

fn build_rules() -> Vec<Rule> {
    use CommandCategory::*;
    use RiskLevel::*;

    let blocked = |p, reason| Rule::new(p, Blocked, Critical, true, reason);
    let destructive = |p, risk, reason| Rule::new(p, Destructive, risk, true, reason);
    let write = |p, risk, reason| Rule::new(p, Write, risk, true, reason);
    let read = |p, reason| Rule::new(p, Read, Safe, false, reason);

    vec![
        // ── Blocked: unambiguously catastrophic ───────────────────────────────
        blocked(
            r"rm\s+(--no-preserve-root\s+)?-[a-zA-Z]*[rR][a-zA-Z]*\s+/(\s|$|\*)",
            "recursive delete of the filesystem root",
        ),
        blocked(
            r"\bdd\b.*\bof=/dev/(sd|hd|nvme|mmcblk|vd|xvd|disk)",
            "raw write to a block device",
        ),
        blocked(r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem creation"),
        blocked(
            r"\b(fdisk|parted|sfdisk|gdisk)\b.*\s/dev/",
            "disk partitioning",
        ),
        blocked(
            r"\b(shutdown|halt|poweroff|reboot)\b|\binit\s+[06]\b",
            "system shutdown",
        ),
        blocked(
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "fork bomb",
        ),
        // ── Destructive: recoverable only with effort ─────────────────────────
        destructive(
            r"\brm\s+(-[a-zA-Z]+\s+)*-[a-zA-Z]*[rRf][a-zA-Z]*\b",
            High,
            "recursive or forced deletion",
        ),
        destructive(r"^rm\s|\srm\s", Medium, "file deletion"),
        destructive(r"\b(killall|pkill)\b", High, "bulk process kill"),
        destructive(r"\bkill\s+(-\S+\s+)?\d", Medium, "process kill"),
        destructive(
            r"\b(docker|podman)\s+(stop|kill|rm|down)\b",
            High,
            "container stop/remove",
        ),
        destructive(
            r"\bsystemctl\s+(stop|disable|mask)\b|\bservice\s+\S+\s+stop\b",
            High,
            "service stop",
        ),
        destructive(
            r"\bgit\s+(reset\s+--hard|clean\s+-[a-zA-Z]*f)",
            High,
            "hard git reset",
        ),
        destructive(
            r">{1,2}\s*/dev/(sd|hd|nvme|mmcblk|disk)",
            High,
            "redirect to a block device",
        ),
        // ── Write: mutates files, packages, or remote state ───────────────────
        write(
            r"\b(npm|pnpm|yarn)\s+(install|add|i)\b|\bpip3?\s+install\b|\bcargo\s+(install|add)\b|\bgem\s+install\b|\bgo\s+install\b",
            Medium,
            "package install",
        ),
        write(
            r"\b(apt|apt-get|dnf|yum|pacman|brew|apk)\s+(-\S+\s+)*(install|add|upgrade|-S)\b",
            Medium,
            "system package install",
        ),
        write(
            r"\bcurl\b.*(\s-X\s*(POST|PUT|PATCH|DELETE)|\s--data\b|\s-d\s|\s-F\s|\s--form\b|\s--upload-file\b)",
            Medium,
            "mutating HTTP request",
        ),
        write(r"\b(chmod|chown|chgrp)\b", Medium, "permission change"),
        write(r"\bsed\s+(-[a-zA-Z]+\s+)*-i\b", Medium, "in-place file edit"),
        write(r"\b(mv|cp|ln)\s", Low, "file move/copy/link"),
        write(r"\b(mkdir|touch|tee)\b", Low, "file creation"),
        write(r"\bgit\s+(add|commit|push|merge|rebase|tag|apply)\b", Low, "repository mutation"),
        write(r">{1,2}\s*[A-Za-z0-9_./~-]", Low, "redirection to a file"),
        // ── Read: inspection only ─────────────────────────────────────────────
        read(
            r"^\s*(ls|pwd|whoami|id|uname|hostname|date|uptime|env|printenv|echo|printf)\b",
            "environment inspection",
        ),
        read(
            r"^\s*(cat|head|tail|less|more|wc|file|stat|du|df|tree|md5sum|sha256sum)\b",
            "file inspection",
        ),
        read(
            r"^\s*(grep|rg|egrep|fgrep|find|fd|locate|which|whereis|type)\b",
            "search",
        ),
        read(
            r"^\s*(ps|top|free|vmstat|iostat|lsof|netstat|ss|uptime)\b",
            "process/resource inspection",
        ),
        read(
            r"^\s*git\s+(status|log|diff|show|branch|remote|blame|describe)\b",
            "repository inspection",
        ),
        read(r"^\s*(curl|wget)\b", "read-only HTTP request"),
    ]
}

/// The fallback for commands no rule matches.
const UNMATCHED: CommandClass = CommandClass {
    category: CommandCategory::Write,
    risk: RiskLevel::Medium,
    requires_approval: true,
    reason: "unrecognized command",
};

/// Classify a shell command string.  Pure: same input, same record.
pub fn classify(command: &str) -> CommandClass {
    let normalized = strip_null_redirects(command);
    for rule in rules() {
        if rule.pattern.is_match(&normalized) {
            return CommandClass {
                category: rule.category,
                risk: rule.risk,
                requires_approval: rule.requires_approval,
                reason: rule.reason,
            };
        }
    }
    UNMATCHED.clone()
}

/// Remove throwaway redirections before matching so that `foo 2>&1` or
/// `foo > /dev/null` is classified by `foo`, not by the redirect.
fn strip_null_redirects(command: &str) -> String {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    let re = STRIP.get_or_init(|| {
        Regex::new(r"(\d?>{1,2}\s*/dev/(null|stdout|stderr)|\d>&\d|&>\s*/dev/null)").unwrap()
    });
    re.replace_all(command, " ").into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Blocked ───────────────────────────────────────────────────────────────

    #[test]
    fn rm_rf_root_is_blocked() {
        for cmd in ["rm -rf /", "rm -rf /*", "sudo rm -rf /", "rm -fr /", "rm --no-preserve-root -rf /"] {
            let c = classify(cmd);
            assert_eq!(c.category, CommandCategory::Blocked, "{cmd}");
            assert_eq!(c.risk, RiskLevel::Critical, "{cmd}");
        }
    }

    #[test]
    fn rm_rf_subdirectory_is_not_blocked() {
        let c = classify("rm -rf ./build");
        assert_eq!(c.category, CommandCategory::Destructive);
        assert_eq!(c.risk, RiskLevel::High);
        assert!(c.requires_approval);
    }

    #[test]
    fn dd_to_device_is_blocked() {
        let c = classify("dd if=/dev/zero of=/dev/sda bs=1M");
        assert_eq!(c.category, CommandCategory::Blocked);
    }

    #[test]
    fn dd_to_file_is_not_blocked() {
        let c = classify("dd if=/dev/zero of=./disk.img bs=1M count=10");
        assert_ne!(c.category, CommandCategory::Blocked);
    }

    #[test]
    fn mkfs_and_partitioning_are_blocked() {
        assert!(classify("mkfs.ext4 /dev/sdb1").is_blocked());
        assert!(classify("fdisk /dev/sda").is_blocked());
    }

    #[test]
    fn shutdown_family_is_blocked() {
        assert!(classify("shutdown -h now").is_blocked());
        assert!(classify("sudo reboot").is_blocked());
        assert!(classify("init 0").is_blocked());
    }

    #[test]
    fn fork_bomb_is_blocked() {
        assert!(classify(":(){ :|:& };:").is_blocked());
    }

    // ── Destructive ───────────────────────────────────────────────────────────

    #[test]
    fn kill_families_are_destructive() {
        assert_eq!(classify("pkill -f node").category, CommandCategory::Destructive);
        assert_eq!(classify("kill -9 1234").category, CommandCategory::Destructive);
        assert_eq!(classify("kill -9 1234").risk, RiskLevel::Medium);
        assert_eq!(classify("killall python").risk, RiskLevel::High);
    }

    #[test]
    fn container_and_service_stop_are_destructive() {
        assert_eq!(classify("docker stop db").category, CommandCategory::Destructive);
        assert_eq!(classify("systemctl stop nginx").category, CommandCategory::Destructive);
    }

    #[test]
    fn git_hard_reset_is_destructive() {
        let c = classify("git reset --hard HEAD~3");
        assert_eq!(c.category, CommandCategory::Destructive);
        assert!(c.requires_approval);
    }

    // ── Write ─────────────────────────────────────────────────────────────────

    #[test]
    fn package_installs_are_write_medium() {
        for cmd in ["npm install lodash", "pip install requests", "cargo add serde", "apt-get install jq"] {
            let c = classify(cmd);
            assert_eq!(c.category, CommandCategory::Write, "{cmd}");
            assert_eq!(c.risk, RiskLevel::Medium, "{cmd}");
            assert!(c.requires_approval, "{cmd}");
        }
    }

    #[test]
    fn mutating_http_is_write() {
        let c = classify("curl -X POST -d '{}' http://localhost:3000/api");
        assert_eq!(c.category, CommandCategory::Write);
    }

    #[test]
    fn readonly_http_is_read() {
        let c = classify("curl http://localhost:3000/health");
        assert_eq!(c.category, CommandCategory::Read);
        assert!(!c.requires_approval);
    }

    #[test]
    fn redirection_to_file_is_write() {
        let c = classify("echo hi > notes.txt");
        assert_eq!(c.category, CommandCategory::Write);
    }

    #[test]
    fn null_redirect_does_not_force_write() {
        let c = classify("ls -la > /dev/null 2>&1");
        assert_eq!(c.category, CommandCategory::Read);
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    #[test]
    fn inspection_commands_are_safe_reads() {
        for cmd in ["ls -la", "cat README.md", "git status", "ps aux", "grep -rn foo src"] {
            let c = classify(cmd);
            assert_eq!(c.category, CommandCategory::Read, "{cmd}");
            assert_eq!(c.risk, RiskLevel::Safe, "{cmd}");
            assert!(!c.requires_approval, "{cmd}");
        }
    }

    // ── Default and determinism ───────────────────────────────────────────────

    #[test]
    fn unmatched_defaults_to_write_medium_with_approval() {
        let c = classify("./deploy-the-thing --now");
        assert_eq!(c.category, CommandCategory::Write);
        assert_eq!(c.risk, RiskLevel::Medium);
        assert!(c.requires_approval);
    }

    #[test]
    fn classification_is_deterministic() {
        for cmd in ["ls", "rm -rf /", "npm install x", "mystery --flag"] {
            assert_eq!(classify(cmd), classify(cmd), "{cmd}");
        }
    }

    #[test]
    fn category_defaults_scale_with_category() {
        assert!(classify("ls").default_timeout_secs() < classify("npm install x").default_timeout_secs());
        assert!(classify("ls").default_max_buffer_bytes() < classify("npm install x").default_max_buffer_bytes());
    }

    #[test]
    fn table_compiles_and_is_ordered_blocked_first() {
        let rules = rules();
        let first_non_blocked = rules
            .iter()
            .position(|r| r.category != CommandCategory::Blocked)
            .unwrap();
        assert!(rules[..first_non_blocked]
            .iter()
            .all(|r| r.category == CommandCategory::Blocked));
    }
}
