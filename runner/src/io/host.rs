//! Best-effort host detection, used to pick a package manager.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

/// What we could learn about the machine we run on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostEnv {
    /// `linux`, `macos`, `windows`, ...
    pub os: String,
    pub is_wsl: bool,
    /// `ID` from `/etc/os-release`, lower-cased.
    pub distro: String,
    /// `ID_LIKE` entries from `/etc/os-release`.
    pub distro_like: Vec<String>,
}

impl HostEnv {
    pub fn label(&self) -> String {
        if self.distro.is_empty() {
            self.os.clone()
        } else {
            format!("{}/{}", self.os, self.distro)
        }
    }
}

pub fn detect_host() -> HostEnv {
    let os = std::env::consts::OS.to_string();
    let mut host = HostEnv {
        os,
        ..HostEnv::default()
    };
    if host.os == "linux" {
        host.is_wsl = fs::read_to_string("/proc/version")
            .map(|text| {
                let text = text.to_lowercase();
                text.contains("microsoft") || text.contains("wsl")
            })
            .unwrap_or(false);
        if let Ok(text) = fs::read_to_string(Path::new("/etc/os-release")) {
            let (distro, like) = parse_os_release(&text);
            host.distro = distro;
            host.distro_like = like;
        }
    }
    debug!(os = %host.os, wsl = host.is_wsl, distro = %host.distro, "host detected");
    host
}

/// Extract `ID` and `ID_LIKE` from os-release text.
pub fn parse_os_release(text: &str) -> (String, Vec<String>) {
    let mut id = String::new();
    let mut like = Vec::new();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_lowercase();
        match key.trim() {
            "ID" => id = value,
            "ID_LIKE" => like = value.split_whitespace().map(str::to_string).collect(),
            _ => {}
        }
    }
    (id, like)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Apk,
    Brew,
}

impl PackageManager {
    pub fn for_host(host: &HostEnv) -> Option<Self> {
        match host.os.as_str() {
            "macos" => return Some(PackageManager::Brew),
            "linux" => {}
            _ => return None,
        }
        std::iter::once(host.distro.as_str())
            .chain(host.distro_like.iter().map(String::as_str))
            .find_map(|id| match id {
                "debian" | "ubuntu" | "kali" | "linuxmint" | "pop" => Some(PackageManager::Apt),
                "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => Some(PackageManager::Dnf),
                "arch" | "manjaro" | "endeavouros" => Some(PackageManager::Pacman),
                "alpine" => Some(PackageManager::Apk),
                _ => None,
            })
    }

    /// Non-interactive install line. Never elevated; run as the current user.
    pub fn install_command(self, packages: &[String]) -> Vec<String> {
        let prefix: &[&str] = match self {
            PackageManager::Apt => &["apt-get", "install", "-y"],
            PackageManager::Dnf => &["dnf", "install", "-y"],
            PackageManager::Pacman => &["pacman", "-S", "--noconfirm"],
            PackageManager::Apk => &["apk", "add"],
            PackageManager::Brew => &["brew", "install"],
        };
        prefix
            .iter()
            .map(|s| s.to_string())
            .chain(packages.iter().cloned())
            .collect()
    }
}
