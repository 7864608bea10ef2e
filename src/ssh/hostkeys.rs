//! Persisted known-hosts state: spec §6.4. One record per line:
//! `{host, port, keyType, fingerprint, firstSeen}`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
struct HostKey {
    host: String,
    port: u16,
    key_type: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Pin {
    host: String,
    port: u16,
    key_type: String,
    fingerprint: String,
    first_seen: i64,
}

pub struct KnownHosts {
    path: PathBuf,
    pins: HashMap<HostKey, Pin>,
}

impl KnownHosts {
    pub fn load(path_override: &str) -> Result<Self> {
        let path = if path_override.is_empty() {
            default_path()?
        } else {
            PathBuf::from(path_override)
        };

        let mut pins = HashMap::new();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(pin) = serde_json::from_str::<Pin>(line) {
                    pins.insert(
                        HostKey {
                            host: pin.host.clone(),
                            port: pin.port,
                            key_type: pin.key_type.clone(),
                        },
                        pin,
                    );
                }
            }
        }

        Ok(Self { path, pins })
    }

    pub fn lookup(&self, host: &str, port: u16, key_type: &str) -> Option<&str> {
        self.pins
            .get(&HostKey {
                host: host.to_string(),
                port,
                key_type: key_type.to_string(),
            })
            .map(|p| p.fingerprint.as_str())
    }

    /// Records a new pin and appends it to the persisted file (TOFU path).
    pub fn pin(&mut self, host: &str, port: u16, key_type: &str, fingerprint: &str, now: i64) -> Result<()> {
        let key = HostKey {
            host: host.to_string(),
            port,
            key_type: key_type.to_string(),
        };
        let pin = Pin {
            host: host.to_string(),
            port,
            key_type: key_type.to_string(),
            fingerprint: fingerprint.to_string(),
            first_seen: now,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&pin)?)
            .map_err(GatewayError::Io)?;

        self.pins.insert(key, pin);
        Ok(())
    }
}

fn default_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("com", "sessiongate", "sessiongate")
        .ok_or_else(|| GatewayError::Anyhow(anyhow::anyhow!("no project dirs available")))?;
    let dir = proj.data_local_dir();
    std::fs::create_dir_all(dir)?;
    Ok(dir.join("known_hosts.jsonl"))
}

pub fn fingerprint(key_bytes: &[u8]) -> String {
    let hash = blake3::hash(key_bytes);
    format!("SHA256:{}", hash.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hosts_at(dir: &Path) -> KnownHosts {
        KnownHosts::load(dir.join("known_hosts.jsonl").to_str().unwrap()).unwrap()
    }

    #[test]
    fn pin_then_lookup_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut hosts = hosts_at(dir.path());
        assert!(hosts.lookup("example.com", 22, "ssh-ed25519").is_none());
        hosts.pin("example.com", 22, "ssh-ed25519", "SHA256:abc", 1000).unwrap();
        assert_eq!(hosts.lookup("example.com", 22, "ssh-ed25519"), Some("SHA256:abc"));
    }

    #[test]
    fn persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts.jsonl");
        {
            let mut hosts = KnownHosts::load(path.to_str().unwrap()).unwrap();
            hosts.pin("h", 22, "ssh-rsa", "SHA256:xyz", 1).unwrap();
        }
        let reloaded = KnownHosts::load(path.to_str().unwrap()).unwrap();
        assert_eq!(reloaded.lookup("h", 22, "ssh-rsa"), Some("SHA256:xyz"));
    }
}
