use std::collections::HashMap;

use async_trait::async_trait;
use derive_new::new;

use crate::{AccountantResult, ChainId};

/// Outcome of a signed broadcast to the consensus chain.
///
/// `data` carries the contract's execute response body (a JSON array of
/// per-observation statuses); unwrapping the transaction envelope down to
/// that body is the connection implementation's concern.
#[derive(Clone, Debug, Default, new)]
pub struct TxResponse {
    pub tx_hash: String,
    pub raw_log: String,
    pub data: Vec<u8>,
}

/// Connection to one accountant contract on the consensus chain. Two
/// independent connections exist when both the base and the NTT contract are
/// configured.
#[async_trait]
pub trait ContractConn: Send + Sync {
    /// Execute a smart query against `contract`, returning the raw response
    /// body.
    async fn query(&self, contract: &str, query: Vec<u8>) -> AccountantResult<Vec<u8>>;

    /// Sign and broadcast an execute message to `contract`.
    async fn sign_and_broadcast(
        &self,
        contract: &str,
        msg: Vec<u8>,
    ) -> AccountantResult<TxResponse>;

    /// The on-chain sender address used in execute messages.
    fn sender_address(&self) -> String;
}

/// Fire-and-forget request for the local watcher to re-observe a
/// transaction. Throttling and delivery are the sink's concern.
pub trait ReobservationSink: Send + Sync {
    fn request_reobservation(&self, chain: ChainId, tx_hash: &[u8]);
}

/// A contract-emitted event as delivered by the event subscription: a type
/// name plus a flat attribute map with JSON-encoded values.
#[derive(Clone, Debug)]
pub struct ContractEvent {
    pub kind: String,
    pub attributes: HashMap<String, String>,
}
