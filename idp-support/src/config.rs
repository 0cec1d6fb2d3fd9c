use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for a master's enumeration/liveness behaviour. Every field mirrors a
/// constant the original implementation hard-coded; exposing them via config lets a
/// deployment retune timeouts for slower transports without touching code.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct NetworkConfig {
    /// Milliseconds a node may go without a successful poll before the master reaps it.
    pub node_timeout_ms: u64,
    /// Milliseconds an outstanding transaction may go unanswered before it times out.
    pub transaction_timeout_ms: u64,
    /// Milliseconds a node may go without a successful ping before resetting itself.
    pub liveness_timeout_ms: u64,
    /// Interval between a node's liveness pings to the master.
    pub ping_interval_ms: u64,
    /// Interval between master re-enumeration passes once the tree is settled.
    pub enumeration_poll_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig {
            node_timeout_ms: 5_000,
            transaction_timeout_ms: 1_750,
            liveness_timeout_ms: 4_000,
            ping_interval_ms: 1_000,
            enumeration_poll_interval_ms: 1_000,
        }
    }
}

impl NetworkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> NetworkConfig {
        serdeconv::from_toml_file(path).expect("Error loading network configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NetworkConfig::default();
        assert_eq!(config.node_timeout_ms, 5_000);
        assert_eq!(config.transaction_timeout_ms, 1_750);
        assert_eq!(config.liveness_timeout_ms, 4_000);
    }
}
