use std::{
    collections::{BTreeMap, HashMap},
    env,
    net::{SocketAddr, ToSocketAddrs},
    process::exit,
    str::FromStr,
};

use online_redis::RedisNode;
use serde::Deserialize;
use tracing::error;

/// Command-line / environment settings: process role, listen address, log
/// level and the path of the JSON topology file.
pub struct EnvSettings {
    pub args: HashMap<String, String>,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvSettings {
    pub fn new() -> Self {
        let mut args = HashMap::new();
        let mut current_key: Option<String> = None;

        for arg in env::args().skip(1) {
            if arg.contains('=') {
                let mut parts = arg.splitn(2, '=');
                let key = parts.next().unwrap();
                let value = parts.next().unwrap();

                if let Some(key) = key.strip_prefix("--") {
                    args.insert(key.to_lowercase(), value.to_string());
                } else {
                    error!("Invalid command line argument: {}", key);
                    exit(1);
                }
            } else if let Some(key) = std::mem::take(&mut current_key) {
                args.insert(key, arg);
            } else if let Some(key) = arg.strip_prefix("--") {
                current_key = Some(key.to_lowercase());
            } else {
                error!("Invalid command line argument: {}", arg);
                exit(1);
            }
        }

        EnvSettings { args }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.args.get(name) {
            Some(value.clone())
        } else if let Ok(value) = env::var(name.replace('-', "_").to_uppercase()) {
            Some(value)
        } else {
            None
        }
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.args.contains_key(name) || env::var(name.replace('-', "_").to_uppercase()).is_ok()
    }

    pub fn parse<T>(&self, name: &str) -> Option<T>
    where
        T: FromStr,
    {
        if let Some(value) = self.get(name) {
            if let Ok(value) = value.parse::<T>() {
                Some(value)
            } else {
                error!("Failed to parse environment variable: {}", name);
                exit(1);
            }
        } else {
            None
        }
    }

    pub fn parse_socketaddr(&self, name: &str, default: &str) -> SocketAddr {
        if let Some(value) = self.get(name) {
            value
                .to_socket_addrs()
                .map_err(|e| {
                    error!("Failed to parse address in parameter '{}': {}", name, e);
                    exit(1);
                })
                .unwrap()
                .next()
                .unwrap_or_else(|| {
                    error!("Failed to parse address in parameter '{}'.", name);
                    exit(1);
                })
        } else {
            default.to_socket_addrs().unwrap().next().unwrap()
        }
    }

    pub fn set_value(&mut self, name: String, value: String) {
        self.args.insert(name, value);
    }
}

/// Topology and tuning, deserialized from the JSON file named by
/// `--config`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub encrypt_sender: EncryptSenderConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Opaque to the core; forwarded to peer components as-is.
    #[serde(default)]
    pub multi_device: serde_json::Value,
    pub online_redis: BTreeMap<String, Vec<RedisNode>>,
    pub group_redis: BTreeMap<String, Vec<RedisNode>>,
    pub redis_db: Vec<RedisNode>,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub push: PushConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub concurrency: usize,
    /// Minimum client build codes for the mailbox batch dispatch path.
    pub batch_ios_version: u64,
    pub batch_android_version: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            concurrency: 8,
            batch_ios_version: 1235,
            batch_android_version: 1105,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncryptSenderConfig {
    pub ios_version: u64,
    pub android_version: u64,
    pub plain_uid_support: bool,
}

impl Default for EncryptSenderConfig {
    fn default() -> Self {
        EncryptSenderConfig {
            ios_version: 0,
            android_version: 0,
            plain_uid_support: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub enabled: bool,
    pub percentage: f64,
    pub ios_supported_version: u64,
    pub android_supported_version: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub group_keys_limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            group_keys_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Interval between offline push rounds.
    pub interval_ms: u64,
    pub push_threads: usize,
    pub event_threads: usize,
    /// Suffix of the master-lease key; one lease per offline partition.
    pub redis_partition: String,
    /// When false the round runs dry: everything except the final vendor
    /// submit and peer post.
    pub is_push: bool,
    /// Push vendors this process handles locally.
    pub push_types: Vec<String>,
    /// Address advertised to peers for `POST /internal/pushGroupMsg`.
    pub server_addr: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig {
            interval_ms: 5000,
            push_threads: num_cpus::get(),
            event_threads: 5,
            redis_partition: "default".to_string(),
            is_push: true,
            push_types: Vec::new(),
            server_addr: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub apns_endpoint: String,
    pub fcm_endpoint: String,
    pub umeng_endpoint: String,
}

pub trait UnwrapFailure<T> {
    fn failed_to(self, action: &str) -> T;
}

impl<T> UnwrapFailure<T> for Option<T> {
    fn failed_to(self, message: &str) -> T {
        match self {
            Some(result) => result,
            None => {
                println!("Failed to {}", message);
                exit(1);
            }
        }
    }
}

impl<T, E: std::fmt::Display> UnwrapFailure<T> for Result<T, E> {
    fn failed_to(self, message: &str) -> T {
        match self {
            Ok(result) => result,
            Err(err) => {
                println!("Failed to {}: {}", message, err);
                exit(1);
            }
        }
    }
}

pub fn failed_to(action: &str) -> ! {
    println!("Failed to {}", action);
    exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_minimal_topology() {
        let raw = r#"{
            "online_redis": {"p0": [{"host": "127.0.0.1", "port": 6379}]},
            "group_redis": {"g0": [{"host": "127.0.0.1", "port": 6380}]},
            "redis_db": [{"host": "127.0.0.1", "port": 6381}],
            "noise": {"enabled": true, "percentage": 0.5}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.dispatcher.concurrency, 8);
        assert_eq!(config.dispatcher.batch_ios_version, 1235);
        assert!(config.encrypt_sender.plain_uid_support);
        assert!(config.noise.enabled);
        assert_eq!(config.online_redis["p0"][0].port, 6379);
        assert_eq!(config.cache.group_keys_limit, 1000);
    }
}
