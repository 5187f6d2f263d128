use std::time::{Duration, Instant};

use parking_lot::Mutex;

use accountant_core::MessagePublication;

use crate::classify::Classification;

/// Mutable per-transfer submission state, guarded independently of the
/// store-wide lock so a long submission round never blocks unrelated store
/// operations.
#[derive(Debug)]
struct TransferState {
    /// True while a submission is queued or in flight. The single invariant
    /// that makes resubmission decisions safe: never resubmit while set.
    submit_pending: bool,
    updated_at: Instant,
}

/// One in-flight transfer. Exists in the store if and only if it is neither
/// committed nor dropped.
#[derive(Debug)]
pub(crate) struct PendingTransfer {
    pub msg: MessagePublication,
    pub msg_id: String,
    pub digest: [u8; 32],
    pub is_ntt: bool,
    pub enforce: bool,
    state: Mutex<TransferState>,
}

impl PendingTransfer {
    pub fn new(msg: MessagePublication, classification: Classification) -> Self {
        let msg_id = msg.message_id();
        let digest = msg.digest();
        Self {
            msg,
            msg_id,
            digest,
            is_ntt: classification.is_ntt(),
            enforce: classification.enforced(),
            state: Mutex::new(TransferState {
                submit_pending: false,
                updated_at: Instant::now(),
            }),
        }
    }

    /// Compare-and-skip: marks the transfer submit-pending, returning false
    /// if it already was. The caller may only enqueue a submission when this
    /// returns true.
    pub fn try_set_submit_pending(&self) -> bool {
        let mut state = self.state.lock();
        if state.submit_pending {
            return false;
        }
        state.submit_pending = true;
        state.updated_at = Instant::now();
        true
    }

    /// Cleared at the end of every batch round, success or failure, and when
    /// an enqueue attempt fails.
    pub fn clear_submit_pending(&self) {
        let mut state = self.state.lock();
        state.submit_pending = false;
        state.updated_at = Instant::now();
    }

    pub fn submit_pending(&self) -> bool {
        self.state.lock().submit_pending
    }

    /// Whether the transfer has sat in the submit-pending state longer than
    /// `threshold`. Flagged by the audit, never force-cleared.
    pub fn submit_pending_longer_than(&self, threshold: Duration) -> bool {
        let state = self.state.lock();
        state.submit_pending && state.updated_at.elapsed() > threshold
    }

    /// The contract-native audit key: `{chain}-{tx hash hex}`.
    pub fn audit_key(&self) -> String {
        format!("{}-{}", self.msg.emitter_chain, self.msg.tx_hash)
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}
