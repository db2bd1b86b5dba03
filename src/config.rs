//! Typed, validated startup configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handler::Cipher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenNetwork {
    Tcp,
    Tcp4,
    Tcp6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Immediate,
    Zstd,
}

/// Startup configuration for `Server::start`. Construct with
/// `Config::default()` and override fields, then call `validate()` (also run
/// automatically by `Server::start`).
#[derive(Clone)]
pub struct Config {
    pub address: String,
    pub listen_network: ListenNetwork,
    pub num_pollers: usize,
    pub reuse_port: bool,
    pub rx_ring_size: usize,
    pub tx_ring_size: usize,
    pub max_payload: usize,
    pub tx_batch_window: Duration,
    pub tx_batch_bytes: usize,
    pub tx_batch_msgs: usize,
    pub timer_wheel_tick: Duration,
    pub compression_default: Compression,
    pub new_cipher: Option<Arc<dyn Fn() -> Box<dyn Cipher + Send> + Send + Sync>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: String::from(":0"),
            listen_network: ListenNetwork::Tcp,
            num_pollers: 1,
            reuse_port: true,
            rx_ring_size: 1 << 20,
            tx_ring_size: 1 << 20,
            max_payload: 16 << 20,
            tx_batch_window: Duration::ZERO,
            tx_batch_bytes: 32 << 10,
            tx_batch_msgs: 16,
            timer_wheel_tick: Duration::ZERO,
            compression_default: Compression::Immediate,
            new_cipher: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("address", &self.address)
            .field("listen_network", &self.listen_network)
            .field("num_pollers", &self.num_pollers)
            .field("reuse_port", &self.reuse_port)
            .field("rx_ring_size", &self.rx_ring_size)
            .field("tx_ring_size", &self.tx_ring_size)
            .field("max_payload", &self.max_payload)
            .field("tx_batch_window", &self.tx_batch_window)
            .field("tx_batch_bytes", &self.tx_batch_bytes)
            .field("tx_batch_msgs", &self.tx_batch_msgs)
            .field("timer_wheel_tick", &self.timer_wheel_tick)
            .field("compression_default", &self.compression_default)
            .field("new_cipher", &self.new_cipher.is_some())
            .finish()
    }
}

impl Config {
    /// Rejects structurally invalid configuration before any socket is
    /// opened: zero `num_pollers`, an empty address, or a nonzero
    /// `tx_batch_window` paired with `tx_batch_bytes == 0`.
    pub fn validate(&self) -> Result<()> {
        if self.num_pollers == 0 {
            return Err(Error::invalid_argument("num_pollers must be >= 1"));
        }
        if self.address.trim().is_empty() {
            return Err(Error::invalid_argument("address must not be empty"));
        }
        if !self.tx_batch_window.is_zero() && self.tx_batch_bytes == 0 {
            return Err(Error::invalid_argument(
                "tx_batch_bytes must be nonzero when tx_batch_window is set",
            ));
        }
        if self.max_payload == 0 {
            return Err(Error::invalid_argument("max_payload must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_pollers_rejected() {
        let mut cfg = Config::default();
        cfg.num_pollers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_address_rejected() {
        let mut cfg = Config::default();
        cfg.address = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn batch_window_without_batch_bytes_rejected() {
        let mut cfg = Config::default();
        cfg.tx_batch_window = Duration::from_millis(10);
        cfg.tx_batch_bytes = 0;
        assert!(cfg.validate().is_err());
    }
}
