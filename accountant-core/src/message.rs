use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::{Address, ChainId, TransferKey, TxHash};

/// An observed cross-chain message as delivered by the local message source.
///
/// The payload is opaque to the engine beyond the classification markers; the
/// digest and message id derived here are what the engine reconciles on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePublication {
    pub tx_hash: TxHash,
    /// Seconds since UNIX epoch.
    pub timestamp: u32,
    pub nonce: u32,
    pub sequence: u64,
    pub emitter_chain: ChainId,
    pub emitter_address: Address,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

impl MessagePublication {
    /// Canonical string identity: `{chain}/{emitter hex}/{sequence}`.
    pub fn message_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.emitter_chain, self.emitter_address, self.sequence
        )
    }

    pub fn transfer_key(&self) -> TransferKey {
        TransferKey {
            emitter_chain: self.emitter_chain,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
        }
    }

    /// Big-endian serialization of the digest-relevant fields.
    fn signing_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(51 + self.payload.len());
        body.extend_from_slice(&self.timestamp.to_be_bytes());
        body.extend_from_slice(&self.nonce.to_be_bytes());
        body.extend_from_slice(&self.emitter_chain.to_be_bytes());
        body.extend_from_slice(self.emitter_address.as_bytes());
        body.extend_from_slice(&self.sequence.to_be_bytes());
        body.push(self.consistency_level);
        body.extend_from_slice(&self.payload);
        body
    }

    /// Deterministic content digest: keccak256(keccak256(body)).
    ///
    /// Detects whether "the same id" still refers to "the same content".
    pub fn digest(&self) -> [u8; 32] {
        let inner = Keccak256::digest(self.signing_body());
        Keccak256::digest(inner).into()
    }
}

/// keccak256(prefix || data), the digest signed when submitting a batch of
/// observations. The prefix is a fixed domain-separation string of at least
/// 32 bytes.
pub fn message_signing_digest(prefix: &[u8], data: &[u8]) -> [u8; 32] {
    debug_assert!(prefix.len() >= 32, "signing prefix must be at least 32 bytes");
    let mut hasher = Keccak256::new();
    hasher.update(prefix);
    hasher.update(data);
    hasher.finalize().into()
}
