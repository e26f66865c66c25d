//! Layered configuration: built-in defaults, an optional TOML file, then
//! `DAPWIRE_` environment variables (`__` separates sections, as in
//! `DAPWIRE_SESSION__CLOCK_HZ`).
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cmsisdap::WireProtocol;

const ENV_PREFIX: &str = "DAPWIRE_";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub probe: ProbeConfig,
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub firmware: FirmwareConfig,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// `VID:PID[:SERIAL]` of the probe to open.
    pub selector: Option<String>,
    /// Per-call transport timeout.
    pub timeout_ms: u64,
    pub max_clock_hz: u32,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            selector: None,
            timeout_ms: 1000,
            max_clock_hz: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub protocol: WireProtocol,
    pub clock_hz: u32,
    pub connect_attempts: usize,
    /// Use the other protocol when the requested one is not supported.
    pub allow_protocol_fallback: bool,
    /// Multi-drop SWD target to select after the dormant wake-up.
    pub target_sel: Option<u32>,
    pub power_up: bool,
    pub power_up_timeout_ms: u64,
    pub jtag_ir_lengths: Vec<u8>,
    /// Position of the DAP in the JTAG chain.
    pub jtag_index: u8,
    /// APSEL of the MEM-AP used for memory accesses.
    pub mem_ap: u8,
    /// Clear sticky errors automatically before the next access.
    pub auto_clear_sticky: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Swd,
            clock_hz: 1_000_000,
            connect_attempts: 3,
            allow_protocol_fallback: true,
            target_sel: None,
            power_up: true,
            power_up_timeout_ms: 1000,
            jtag_ir_lengths: vec![4],
            jtag_index: 0,
            mem_ap: 0,
            auto_clear_sticky: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// WAIT answers in a row after which a request gives up.
    pub wait_retry_limit: usize,
    pub idle_cycles: u8,
    /// WAIT retries done by the probe itself before reporting WAIT.
    pub probe_wait_retry: u16,
    pub match_retry: u16,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            wait_retry_limit: 16,
            idle_cycles: 0,
            probe_wait_retry: 0,
            match_retry: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirmwareConfig {
    pub chunk_size: usize,
    pub handshake_attempts: usize,
    pub handshake_delay_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            chunk_size: 56,
            handshake_attempts: 10,
            handshake_delay_ms: 100,
        }
    }
}
