// Node configuration

use crate::core::Network;
use serde_json::Value;

/// Node configuration. Built from [`Default`] and deep-merged with a
/// nested mapping of overrides; unrecognized keys are warned about and
/// ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub network: Network,
    /// Listen endpoint for inbound connections; `None` disables them.
    pub listen: Option<(String, u16)>,
    /// Explicit peers to dial at startup, as host:port strings.
    pub connect: Vec<String>,
    /// Fall back to DNS seeds when the address pool is empty.
    pub dns: bool,
    pub max: Limits,
    pub intervals: Intervals,
    /// Request headers instead of full blocks.
    pub headers_only: bool,
    /// Per-request timeout in seconds.
    pub timeout: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub connections: usize,
    /// Address pool capacity
    pub addr: usize,
    /// Object queue capacity
    pub queue: usize,
    /// Most inventory vectors sent in one response
    pub inv: usize,
    /// Recent-inventory LRU capacity
    pub inv_cache: usize,
}

/// Worker periods in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Intervals {
    pub queue: f64,
    pub inv_queue: f64,
    pub addrs: f64,
    pub connect: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            listen: Some(("0.0.0.0".to_string(), Network::Mainnet.default_port())),
            connect: Vec::new(),
            dns: true,
            max: Limits {
                connections: 8,
                addr: 256,
                queue: 64,
                inv: 128,
                inv_cache: 1024,
            },
            intervals: Intervals {
                queue: 5.0,
                inv_queue: 5.0,
                addrs: 15.0,
                connect: 15.0,
            },
            headers_only: false,
            timeout: 5.0,
        }
    }
}

fn as_seconds(value: &Value) -> Option<f64> {
    value.as_f64().filter(|s| *s > 0.0)
}

impl NodeConfig {
    /// Defaults deep-merged with user overrides.
    pub fn from_value(overrides: &Value) -> Self {
        let mut config = Self::default();
        config.merge(overrides);
        config
    }

    pub fn merge(&mut self, value: &Value) {
        let Some(map) = value.as_object() else {
            log::warn!("config overrides must be a mapping, ignoring");
            return;
        };

        for (key, val) in map {
            match key.as_str() {
                "network" => match val.as_str() {
                    Some("mainnet") => self.network = Network::Mainnet,
                    Some("testnet") => self.network = Network::Testnet,
                    Some("regtest") => self.network = Network::Regtest,
                    _ => log::warn!("unknown network {:?}, keeping {:?}", val, self.network),
                },
                "listen" => match val {
                    Value::Bool(false) | Value::Null => self.listen = None,
                    Value::Object(listen) => {
                        let host = listen
                            .get("host")
                            .and_then(Value::as_str)
                            .unwrap_or("0.0.0.0")
                            .to_string();
                        let port = listen
                            .get("port")
                            .and_then(Value::as_u64)
                            .map(|p| p as u16)
                            .unwrap_or_else(|| self.network.default_port());
                        self.listen = Some((host, port));
                    }
                    _ => log::warn!("listen must be a mapping or false"),
                },
                "connect" => {
                    if let Some(list) = val.as_array() {
                        self.connect = list
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                    }
                }
                "dns" => {
                    if let Some(b) = val.as_bool() {
                        self.dns = b;
                    }
                }
                "headers_only" => {
                    if let Some(b) = val.as_bool() {
                        self.headers_only = b;
                    }
                }
                "timeout" => {
                    if let Some(s) = as_seconds(val) {
                        self.timeout = s;
                    }
                }
                "max" => {
                    let Some(max) = val.as_object() else {
                        log::warn!("max must be a mapping");
                        continue;
                    };
                    for (key, val) in max {
                        let Some(n) = val.as_u64() else { continue };
                        let n = n as usize;
                        match key.as_str() {
                            "connections" => self.max.connections = n,
                            "addr" => self.max.addr = n,
                            "queue" => self.max.queue = n,
                            "inv" => self.max.inv = n,
                            "inv_cache" => self.max.inv_cache = n,
                            other => log::warn!("unrecognized config key 'max.{}'", other),
                        }
                    }
                }
                "intervals" => {
                    let Some(intervals) = val.as_object() else {
                        log::warn!("intervals must be a mapping");
                        continue;
                    };
                    for (key, val) in intervals {
                        let Some(s) = as_seconds(val) else { continue };
                        match key.as_str() {
                            "queue" => self.intervals.queue = s,
                            "inv_queue" => self.intervals.inv_queue = s,
                            "addrs" => self.intervals.addrs = s,
                            "connect" => self.intervals.connect = s,
                            other => log::warn!("unrecognized config key 'intervals.{}'", other),
                        }
                    }
                }
                other => log::warn!("unrecognized config key '{}'", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.max.connections, 8);
        assert_eq!(config.max.addr, 256);
        assert_eq!(config.max.queue, 64);
        assert_eq!(config.max.inv, 128);
        assert_eq!(config.max.inv_cache, 1024);
        assert!(config.dns);
        assert!(!config.headers_only);
    }

    #[test]
    fn test_deep_merge_keeps_unset_defaults() {
        let config = NodeConfig::from_value(&json!({
            "network": "regtest",
            "max": { "connections": 2 },
            "intervals": { "queue": 0.5 },
        }));

        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.max.connections, 2);
        // untouched siblings keep their defaults
        assert_eq!(config.max.queue, 64);
        assert_eq!(config.intervals.queue, 0.5);
        assert_eq!(config.intervals.connect, 15.0);
    }

    #[test]
    fn test_listen_disabled() {
        let config = NodeConfig::from_value(&json!({ "listen": false }));
        assert!(config.listen.is_none());

        let config = NodeConfig::from_value(&json!({
            "listen": { "host": "127.0.0.1", "port": 18444 },
        }));
        assert_eq!(config.listen, Some(("127.0.0.1".to_string(), 18444)));
    }

    #[test]
    fn test_unrecognized_keys_ignored() {
        let config = NodeConfig::from_value(&json!({
            "bogus": 1,
            "max": { "bogus": 2 },
            "dns": false,
        }));
        assert!(!config.dns);
        assert_eq!(config, {
            let mut expected = NodeConfig::default();
            expected.dns = false;
            expected
        });
    }

    #[test]
    fn test_connect_list() {
        let config = NodeConfig::from_value(&json!({
            "connect": ["10.0.0.1:8333", "10.0.0.2:8333"],
        }));
        assert_eq!(config.connect.len(), 2);
    }
}
