//! Environment configuration.
//!
//! Everything is read from `BATCHWORK_*` variables. Missing or malformed
//! values fall back to defaults with a warning; nothing here fails.

use std::path::PathBuf;

use tracing::warn;

use batchwork_core::JobNumId;

use crate::ipc::{self, IpcKey};

pub const ENV_DAEMON_RUNNING: &str = "BATCHWORK_DAEMON_RUNNING";
pub const ENV_SHM_SIZE: &str = "BATCHWORK_SHM_SIZE";
pub const ENV_SHM_PERMS: &str = "BATCHWORK_SHM_PERMS";
pub const ENV_SHM_NAMESPACE: &str = "BATCHWORK_SHM_NAMESPACE";
pub const ENV_IPC_IDENTITY: &str = "BATCHWORK_IPC_IDENTITY";
pub const ENV_MAX_MESSAGE_BYTES: &str = "BATCHWORK_MAX_MESSAGE_BYTES";
pub const ENV_FAILURE_DIR: &str = "BATCHWORK_FAILURE_DIR";

const DEFAULT_SHM_SIZE: usize = 1024 * 1024;
const DEFAULT_PERMS: u32 = 0o666;
const DEFAULT_NAMESPACE: char = 'b';
const DEFAULT_IDENTITY: &str = "batchwork";
const DEFAULT_MAX_MESSAGE_BYTES: usize = 8192;

/// SysV IPC tuning shared by the shared-memory storage and the message queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcSettings {
    /// Stable source identity keys are derived from.
    pub identity: String,
    /// Single-character namespace separating independent deployments on one host.
    pub namespace: char,
    /// Byte size of the configuration segment.
    pub shm_size: usize,
    /// Permission bits for every IPC object created.
    pub perms: u32,
    /// Largest payload sent inline on a queue; larger items go through a file.
    pub max_message_bytes: usize,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            namespace: DEFAULT_NAMESPACE,
            shm_size: DEFAULT_SHM_SIZE,
            perms: DEFAULT_PERMS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl IpcSettings {
    /// Key of the configuration segment and its semaphore.
    pub fn config_key(&self) -> IpcKey {
        ipc::derive_key(&format!("{}:config", self.identity), self.namespace)
    }

    /// Key of the item queue dedicated to `job_id`.
    pub fn channel_key(&self, job_id: JobNumId) -> IpcKey {
        ipc::derive_key(&format!("{}:queue:{}", self.identity, job_id), self.namespace)
    }
}

/// Resolved process settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Whether a daemon is advertised as running (selects the IPC backends).
    pub daemon_running: bool,
    pub ipc: IpcSettings,
    /// Directory receiving per-process failure files.
    pub failure_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daemon_running: false,
            ipc: IpcSettings::default(),
            failure_dir: default_failure_dir(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through an arbitrary lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = IpcSettings::default();

        let daemon_running = lookup(ENV_DAEMON_RUNNING)
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let shm_size = parse_or(&lookup, ENV_SHM_SIZE, defaults.shm_size, |v| {
            v.parse::<usize>().ok().filter(|size| *size > 8)
        });

        let perms = parse_or(&lookup, ENV_SHM_PERMS, defaults.perms, |v| {
            u32::from_str_radix(v.trim_start_matches("0o"), 8)
                .ok()
                .filter(|p| *p <= 0o777)
        });

        let namespace = parse_or(&lookup, ENV_SHM_NAMESPACE, defaults.namespace, |v| {
            let mut chars = v.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphanumeric() => Some(c),
                _ => None,
            }
        });

        let max_message_bytes = parse_or(
            &lookup,
            ENV_MAX_MESSAGE_BYTES,
            defaults.max_message_bytes,
            |v| v.parse::<usize>().ok().filter(|n| *n > 0),
        );

        let identity = lookup(ENV_IPC_IDENTITY)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.identity);

        let failure_dir = lookup(ENV_FAILURE_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_failure_dir);

        Self {
            daemon_running,
            ipc: IpcSettings {
                identity,
                namespace,
                shm_size,
                perms,
                max_message_bytes,
            },
            failure_dir,
        }
    }
}

pub fn default_failure_dir() -> PathBuf {
    std::env::temp_dir().join("batchwork-failures")
}

/// Boolean-like environment value: `1`, `true`, `yes`, `on`.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<T, L, P>(lookup: &L, key: &str, default: T, parse: P) -> T
where
    T: core::fmt::Debug,
    L: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match parse(raw.trim()) {
            Some(value) => value,
            None => {
                warn!(variable = key, value = %raw, default = ?default, "invalid value; using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings(&[]);
        assert!(!s.daemon_running);
        assert_eq!(s.ipc, IpcSettings::default());
        assert_eq!(s.failure_dir, default_failure_dir());
    }

    #[test]
    fn reads_overrides() {
        let s = settings(&[
            (ENV_DAEMON_RUNNING, "TRUE"),
            (ENV_SHM_SIZE, "4096"),
            (ENV_SHM_PERMS, "0600"),
            (ENV_SHM_NAMESPACE, "q"),
            (ENV_IPC_IDENTITY, "billing"),
            (ENV_MAX_MESSAGE_BYTES, "1024"),
            (ENV_FAILURE_DIR, "/var/lib/batchwork"),
        ]);
        assert!(s.daemon_running);
        assert_eq!(s.ipc.shm_size, 4096);
        assert_eq!(s.ipc.perms, 0o600);
        assert_eq!(s.ipc.namespace, 'q');
        assert_eq!(s.ipc.identity, "billing");
        assert_eq!(s.ipc.max_message_bytes, 1024);
        assert_eq!(s.failure_dir, PathBuf::from("/var/lib/batchwork"));
    }

    #[test]
    fn malformed_values_fall_back() {
        let s = settings(&[
            (ENV_DAEMON_RUNNING, "maybe"),
            (ENV_SHM_SIZE, "lots"),
            (ENV_SHM_PERMS, "999"),
            (ENV_SHM_NAMESPACE, "ab"),
        ]);
        assert!(!s.daemon_running);
        assert_eq!(s.ipc.shm_size, DEFAULT_SHM_SIZE);
        assert_eq!(s.ipc.perms, DEFAULT_PERMS);
        assert_eq!(s.ipc.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn boolean_like_values() {
        for v in ["1", "true", "Yes", " on "] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "", "off"] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn channel_keys_depend_only_on_id_identity_and_namespace() {
        let a = IpcSettings::default();
        let b = IpcSettings::default();
        assert_eq!(a.channel_key(JobNumId::new(3)), b.channel_key(JobNumId::new(3)));
        assert_ne!(a.channel_key(JobNumId::new(3)), a.channel_key(JobNumId::new(4)));
        assert_ne!(a.channel_key(JobNumId::new(3)), a.config_key());

        let other = IpcSettings {
            namespace: 'z',
            ..IpcSettings::default()
        };
        assert_ne!(a.config_key(), other.config_key());
    }
}
