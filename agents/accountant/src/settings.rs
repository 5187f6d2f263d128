use std::time::Duration;

use serde::Deserialize;

use accountant_core::ChainId;

/// One covered emitter: the (chain, address) pair plus whether withholding
/// actually blocks publication for it or is advisory only.
#[derive(Clone, Debug, Deserialize)]
pub struct EmitterSettings {
    pub chain: ChainId,
    /// 32-byte address as hex, shorter addresses left-zero-padded.
    pub address: String,
    #[serde(default = "default_enforce")]
    pub enforce: bool,
}

fn default_enforce() -> bool {
    true
}

/// Settings for the reconciliation engine.
///
/// At least one of the two contract addresses must be set for `start` to
/// succeed. Emitter lists are immutable after startup; a transfer reloaded
/// from the durable store that no longer matches them is dropped.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountantSettings {
    /// Address of the base transfer accountant contract.
    pub base_contract: Option<String>,
    /// Address of the NTT accountant contract.
    pub ntt_contract: Option<String>,

    #[serde(default)]
    pub token_bridge_emitters: Vec<EmitterSettings>,
    #[serde(default)]
    pub ntt_emitters: Vec<EmitterSettings>,
    #[serde(default)]
    pub relayer_emitters: Vec<EmitterSettings>,

    /// Minimum time between audit cycles. Make this bigger than the
    /// reobservation window.
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
    /// How long a transfer may sit in the submit-pending state before the
    /// audit flags it as an anomaly.
    #[serde(default = "default_submit_pending_stale_secs")]
    pub submit_pending_stale_secs: u64,
    /// Capacity of the per-contract submission intake channel. Enqueue is
    /// best-effort; the audit cycle is the backstop for drops.
    #[serde(default = "default_submit_channel_size")]
    pub submit_channel_size: usize,
}

fn default_audit_interval_secs() -> u64 {
    15 * 60
}

fn default_submit_pending_stale_secs() -> u64 {
    30 * 60
}

fn default_submit_channel_size() -> usize {
    50
}

impl Default for AccountantSettings {
    fn default() -> Self {
        Self {
            base_contract: None,
            ntt_contract: None,
            token_bridge_emitters: Vec::new(),
            ntt_emitters: Vec::new(),
            relayer_emitters: Vec::new(),
            audit_interval_secs: default_audit_interval_secs(),
            submit_pending_stale_secs: default_submit_pending_stale_secs(),
            submit_channel_size: default_submit_channel_size(),
        }
    }
}

impl AccountantSettings {
    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    pub fn submit_pending_stale_after(&self) -> Duration {
        Duration::from_secs(self.submit_pending_stale_secs)
    }
}
