//! Immutable execution policy and the pure gate checks derived from it.
//!
//! The network gate is a coarse text heuristic over command tokens. It catches
//! honest mistakes by a decision provider; it is not a security boundary and a
//! determined adversary can evade it. Real isolation belongs to an OS-level
//! sandbox around the whole process.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::BlockReason;

pub const DEFAULT_COMMAND_ALLOWLIST: [&str; 9] = [
    "file", "strings", "xxd", "hexdump", "unzip", "7z", "tar", "jq", "python3",
];

pub const DEFAULT_INSTALL_ALLOWLIST: [&str; 6] = [
    "binwalk",
    "exiftool",
    "foremost",
    "steghide",
    "tshark",
    "p7zip-full",
];

/// Matched anywhere in the lower-cased command text.
pub const NETWORK_SUBSTRINGS: [&str; 10] = [
    "curl", "wget", "netcat", "telnet", "nmap", "ssh", "ftp", "http", "socket", "rsync",
];

/// Matched only as whole words; as substrings they hit ordinary text
/// (`encode`, `concat`).
pub const NETWORK_WORDS: [&str; 3] = ["nc", "ncat", "scp"];

/// Execution policy fixed at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub allow_network: bool,
    pub allow_install: bool,
    /// Executable basenames that may be spawned.
    pub command_allowlist: BTreeSet<String>,
    pub install_allowlist: BTreeSet<String>,
    pub max_steps: u32,
    /// Cap on inventory entries scanned from the challenge root.
    pub max_files: usize,
    /// Upper bound on bytes returned by `read_file_head`.
    pub max_file_size_bytes: u64,
    pub default_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub install_timeout_secs: u64,
    /// Bytes of stdout/stderr kept per process; the rest is drained and dropped.
    pub output_limit_bytes: usize,
    /// Interpreter used for `run_script` bodies (`<interpreter> -c <body>`).
    pub script_interpreter: String,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_network: false,
            allow_install: false,
            command_allowlist: DEFAULT_COMMAND_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            install_allowlist: DEFAULT_INSTALL_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_steps: 80,
            max_files: 2000,
            max_file_size_bytes: 200_000,
            default_timeout_secs: 10,
            extract_timeout_secs: 20,
            install_timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            script_interpreter: "python3".to_string(),
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.max_files == 0 {
            return Err(anyhow!("max_files must be > 0"));
        }
        if self.max_file_size_bytes == 0 {
            return Err(anyhow!("max_file_size_bytes must be > 0"));
        }
        if self.default_timeout_secs == 0
            || self.extract_timeout_secs == 0
            || self.install_timeout_secs == 0
        {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.script_interpreter.trim().is_empty() {
            return Err(anyhow!("script_interpreter must be non-empty"));
        }
        if self
            .command_allowlist
            .iter()
            .chain(&self.install_allowlist)
            .any(|entry| entry.trim().is_empty())
        {
            return Err(anyhow!("allowlist entries must be non-empty"));
        }
        Ok(())
    }

    /// Allowlist gate on the basename of the first token.
    pub fn check_binary(&self, command: &[String]) -> Result<(), BlockReason> {
        let binary = command
            .first()
            .map(|first| basename(first))
            .unwrap_or_default();
        if binary.is_empty() || !self.command_allowlist.contains(&binary) {
            return Err(BlockReason::CommandNotAllowed { binary });
        }
        Ok(())
    }

    /// Allowlist gate followed by the network gate.
    ///
    /// A refused binary that is itself a network tool (`curl`, `wget`, ...)
    /// reports the network gate, which names the actual problem.
    pub fn check_command(&self, command: &[String]) -> Result<(), BlockReason> {
        let network = if self.allow_network {
            None
        } else {
            network_indicator(command)
        };
        match self.check_binary(command) {
            Err(BlockReason::CommandNotAllowed { binary })
                if network.is_some() && network_indicator(&[binary.clone()]).is_some() =>
            {
                Err(BlockReason::NetworkBlocked {
                    token: network.unwrap_or_default().to_string(),
                })
            }
            Err(reason) => Err(reason),
            Ok(()) => match network {
                Some(token) => Err(BlockReason::NetworkBlocked {
                    token: token.to_string(),
                }),
                None => Ok(()),
            },
        }
    }

    /// Install gate: all-or-nothing against the install allowlist.
    pub fn check_packages(&self, packages: &[String]) -> Result<(), BlockReason> {
        if !self.allow_install {
            return Err(BlockReason::InstallNotAllowed);
        }
        if let Some(package) = packages
            .iter()
            .find(|package| !self.install_allowlist.contains(package.as_str()))
        {
            return Err(BlockReason::PackageNotAllowed {
                package: package.clone(),
            });
        }
        Ok(())
    }

    pub fn timeout_or_default(&self, requested: Option<u64>) -> Duration {
        Duration::from_secs(requested.unwrap_or(self.default_timeout_secs))
    }
}

/// First network indicator found in the joined command text, if any.
pub fn network_indicator(command: &[String]) -> Option<&'static str> {
    let joined = command.join(" ").to_lowercase();
    if let Some(token) = NETWORK_SUBSTRINGS
        .iter()
        .find(|token| joined.contains(*token))
    {
        return Some(token);
    }
    let words: Vec<&str> = joined
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    NETWORK_WORDS
        .iter()
        .find(|token| words.contains(token))
        .copied()
}

fn basename(token: &str) -> String {
    Path::new(token)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allowlist_uses_basename_of_first_token() {
        let policy = Policy::default();
        assert!(policy.check_binary(&tokens(&["/usr/bin/strings", "a"])).is_ok());
        assert_eq!(
            policy.check_binary(&tokens(&["../../bin/rm", "-rf", "/"])),
            Err(BlockReason::CommandNotAllowed {
                binary: "rm".to_string()
            })
        );
        assert!(matches!(
            policy.check_binary(&[]),
            Err(BlockReason::CommandNotAllowed { .. })
        ));
    }

    #[test]
    fn allowlist_is_checked_before_network() {
        let policy = Policy::default();
        assert_eq!(
            policy.check_command(&tokens(&["rm", "http://evil"])),
            Err(BlockReason::CommandNotAllowed {
                binary: "rm".to_string()
            })
        );
    }

    #[test]
    fn refused_network_tools_report_the_network_gate() {
        let policy = Policy::default();
        assert_eq!(
            policy.check_command(&tokens(&["curl", "http://evil"])),
            Err(BlockReason::NetworkBlocked {
                token: "curl".to_string()
            })
        );

        let open = Policy {
            allow_network: true,
            ..Policy::default()
        };
        assert_eq!(
            open.check_command(&tokens(&["curl", "http://evil"])),
            Err(BlockReason::CommandNotAllowed {
                binary: "curl".to_string()
            })
        );
    }

    #[test]
    fn network_tokens_block_allowlisted_binaries() {
        let policy = Policy::default();
        let err = policy
            .check_command(&tokens(&[
                "python3",
                "-c",
                "import urllib.request; urllib.request.urlopen('HTTPS://x')",
            ]))
            .unwrap_err();
        assert_eq!(
            err,
            BlockReason::NetworkBlocked {
                token: "http".to_string()
            }
        );
        assert!(matches!(
            policy.check_command(&tokens(&["python3", "-c", "import os; os.system('nc -l 1')"])),
            Err(BlockReason::NetworkBlocked { .. })
        ));
    }

    #[test]
    fn network_tokens_pass_when_allowed() {
        let policy = Policy {
            allow_network: true,
            ..Policy::default()
        };
        assert!(
            policy
                .check_command(&tokens(&["python3", "-c", "print('http://ok')"]))
                .is_ok()
        );
    }

    #[test]
    fn short_tokens_match_whole_words_only() {
        assert_eq!(
            network_indicator(&tokens(&["python3", "-c", "print('a'.encode())"])),
            None
        );
        assert_eq!(
            network_indicator(&tokens(&["python3", "-c", "concat = 1"])),
            None
        );
        assert_eq!(
            network_indicator(&tokens(&["sh", "-c", "nc 10.0.0.1 80"])),
            Some("nc")
        );
    }

    #[test]
    fn packages_are_all_or_nothing() {
        let disabled = Policy::default();
        assert_eq!(
            disabled.check_packages(&tokens(&["binwalk"])),
            Err(BlockReason::InstallNotAllowed)
        );

        let enabled = Policy {
            allow_install: true,
            ..Policy::default()
        };
        assert!(enabled.check_packages(&tokens(&["binwalk", "exiftool"])).is_ok());
        assert_eq!(
            enabled.check_packages(&tokens(&["binwalk", "metasploit"])),
            Err(BlockReason::PackageNotAllowed {
                package: "metasploit".to_string()
            })
        );
    }

    #[test]
    fn validate_rejects_zero_limits() {
        assert!(Policy::default().validate().is_ok());
        let bad = Policy {
            max_steps: 0,
            ..Policy::default()
        };
        assert!(bad.validate().is_err());
        let mut bad = Policy::default();
        bad.command_allowlist.insert(" ".to_string());
        assert!(bad.validate().is_err());
    }
}
