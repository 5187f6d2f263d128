//! Batched submission of signed observations to the accountant contracts.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument};

use accountant_core::{
    message_signing_digest, AccountantError, AccountantResult, Address, MessagePublication,
    TransferKey,
};

use crate::accountant::{Accountant, ContractContext};
use crate::pending::PendingTransfer;

/// Domain-separation prefix for observation signatures. Must never collide
/// with any other signed payload in the protocol.
pub(crate) const SUBMIT_OBSERVATION_PREFIX: &[u8] = b"acct_sub_obsfig_000000000000000000|";

/// At most this many observations go into one contract transaction.
pub(crate) const SUBMIT_BATCH_SIZE: usize = 10;

/// How long a partially filled batch waits for more intake before it is
/// submitted anyway.
pub(crate) const SUBMIT_BATCH_WINDOW: Duration = Duration::from_millis(100);

/// Whole-transaction failure markers in the broadcast raw log.
const RAW_LOG_FAILURES: [&str; 2] = ["out of gas", "failed to execute message"];

pub(crate) mod base64_bytes {
    use super::{Deserialize, Deserializer, BASE64};
    use base64::Engine;
    use serde::{de, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(de::Error::custom)
    }
}

/// The wire form of one observed message. Byte fields travel base64-encoded,
/// the emitter address as a hex string; the serialized field order is part of
/// the signed content and must not change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Observation {
    #[serde(with = "base64_bytes")]
    pub tx_hash: Vec<u8>,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: u16,
    pub emitter_address: Address,
    pub sequence: u64,
    pub consistency_level: u8,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl From<&MessagePublication> for Observation {
    fn from(msg: &MessagePublication) -> Self {
        Self {
            tx_hash: msg.tx_hash.0.to_vec(),
            timestamp: msg.timestamp,
            nonce: msg.nonce,
            emitter_chain: msg.emitter_chain,
            emitter_address: msg.emitter_address,
            sequence: msg.sequence,
            consistency_level: msg.consistency_level,
            payload: msg.payload.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitObservations {
    submit_observations: SubmitObservationsParams,
}

#[derive(Debug, Serialize)]
struct SubmitObservationsParams {
    /// Base64 of the JSON-serialized observation array, exactly the bytes
    /// that were signed.
    observations: String,
    guardian_set_index: u32,
    signature: ObservationSignature,
}

#[derive(Debug, Serialize)]
struct ObservationSignature {
    index: u32,
    signature: Vec<u8>,
}

/// Per-observation outcome reported in the contract's execute response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ObservationStatus {
    Committed,
    Pending,
    Error(String),
    Unknown(serde_json::Value),
}

impl<'de> Deserialize<'de> for ObservationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::String(s) if s == "committed" => Ok(Self::Committed),
            serde_json::Value::String(s) if s == "pending" => Ok(Self::Pending),
            serde_json::Value::Object(map) => match map.get("error").and_then(|v| v.as_str()) {
                Some(text) => Ok(Self::Error(text.to_string())),
                None => Ok(Self::Unknown(value)),
            },
            _ => Ok(Self::Unknown(value)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ObservationResponse {
    pub key: TransferKey,
    pub status: ObservationStatus,
}

/// Collects up to [`SUBMIT_BATCH_SIZE`] transfers from the intake queue,
/// waiting at most [`SUBMIT_BATCH_WINDOW`] beyond the first for the batch to
/// fill.
pub(crate) async fn drain_submit_batch(
    rx: &mut mpsc::Receiver<Arc<PendingTransfer>>,
    first: Arc<PendingTransfer>,
) -> Vec<Arc<PendingTransfer>> {
    let mut batch = vec![first];
    let deadline = tokio::time::Instant::now() + SUBMIT_BATCH_WINDOW;
    while batch.len() < SUBMIT_BATCH_SIZE {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(pe)) => batch.push(pe),
            Ok(None) | Err(_) => break,
        }
    }
    batch
}

impl Accountant {
    /// One submission worker runs per configured contract, pulling from that
    /// contract's intake queue until shutdown.
    pub(crate) async fn submission_worker(
        self: Arc<Self>,
        ctx: Arc<ContractContext>,
        mut rx: mpsc::Receiver<Arc<PendingTransfer>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(contract = ctx.name, "submission worker shutting down");
                    return;
                }
                first = rx.recv() => {
                    let Some(first) = first else { return };
                    let batch = drain_submit_batch(&mut rx, first).await;
                    self.submit_batch(&ctx, batch).await;
                }
            }
        }
    }

    /// Submits one batch and applies the per-observation outcomes. Whatever
    /// happens, every transfer in the batch has its submit-pending flag
    /// cleared by the time this returns, so the audit can retry.
    #[instrument(skip_all, fields(contract = ctx.name, size = batch.len()))]
    pub(crate) async fn submit_batch(
        &self,
        ctx: &ContractContext,
        batch: Vec<Arc<PendingTransfer>>,
    ) {
        // Drop anything that resolved between enqueue and drain; never
        // submit stale work.
        let live: Vec<Arc<PendingTransfer>> = {
            let pending = self.pending.lock();
            batch
                .iter()
                .filter(|pe| pending.contains_key(&pe.msg_id))
                .cloned()
                .collect()
        };
        if live.is_empty() {
            for pe in &batch {
                pe.clear_submit_pending();
            }
            return;
        }

        match self.submit_observations_to_contract(ctx, &live).await {
            Ok(responses) => self.apply_submission_responses(ctx, responses),
            Err(err) => {
                // A whole-batch failure is indeterminate: the transaction may
                // or may not have landed, so nothing is committed or dropped.
                // Terminal per-transfer errors only arrive as per-item
                // statuses in a successful response.
                self.metrics
                    .submit_failures
                    .with_label_values(&[ctx.name])
                    .inc();
                error!(%err, "failed to submit batch of observations, will retry on the next audit cycle");
            }
        }
        for pe in &batch {
            pe.clear_submit_pending();
        }
    }

    fn apply_submission_responses(&self, ctx: &ContractContext, responses: Vec<ObservationResponse>) {
        for response in responses {
            let msg_id = response.key.to_string();
            match response.status {
                ObservationStatus::Committed => {
                    self.handle_committed_transfer(&msg_id, ctx.name);
                }
                ObservationStatus::Pending => {
                    debug!(%msg_id, "transfer is pending more observations");
                }
                ObservationStatus::Error(text) => {
                    self.metrics
                        .submit_failures
                        .with_label_values(&[ctx.name])
                        .inc();
                    self.handle_transfer_error(
                        &msg_id,
                        &text,
                        "submission to the accountant contract failed",
                    );
                }
                ObservationStatus::Unknown(value) => {
                    self.metrics
                        .submit_failures
                        .with_label_values(&[ctx.name])
                        .inc();
                    error!(%msg_id, status = %value, "contract returned an unrecognized observation status");
                }
            }
        }
    }

    /// Signs and broadcasts one batch, returning the parsed per-observation
    /// statuses from the execute response.
    pub(crate) async fn submit_observations_to_contract(
        &self,
        ctx: &ContractContext,
        batch: &[Arc<PendingTransfer>],
    ) -> AccountantResult<Vec<ObservationResponse>> {
        let (guardian_set_index, guardian_index) = self.guardian_indices()?;

        let observations: Vec<Observation> =
            batch.iter().map(|pe| Observation::from(&pe.msg)).collect();
        let obs_json = serde_json::to_vec(&observations)?;
        let digest = message_signing_digest(SUBMIT_OBSERVATION_PREFIX, &obs_json);
        let signature = self.signer.sign(&digest)?;

        let msg = SubmitObservations {
            submit_observations: SubmitObservationsParams {
                observations: BASE64.encode(&obs_json),
                guardian_set_index,
                signature: ObservationSignature {
                    index: guardian_index,
                    signature,
                },
            },
        };
        let body = serde_json::to_vec(&msg)?;

        info!(size = batch.len(), "submitting batch of observations");
        self.metrics
            .observations_submitted
            .with_label_values(&[ctx.name])
            .inc_by(batch.len() as u64);

        let resp = ctx.conn.sign_and_broadcast(&ctx.address, body).await?;
        for marker in RAW_LOG_FAILURES {
            if resp.raw_log.contains(marker) {
                return Err(AccountantError::Broadcast(format!(
                    "transaction failed: {}",
                    resp.raw_log
                )));
            }
        }

        let responses: Vec<ObservationResponse> =
            serde_json::from_slice(&resp.data).map_err(|err| {
                AccountantError::MalformedResponse(format!(
                    "failed to parse execute response: {err}"
                ))
            })?;
        if responses.len() != batch.len() {
            return Err(AccountantError::MalformedResponse(format!(
                "contract returned {} statuses for {} observations",
                responses.len(),
                batch.len()
            )));
        }
        Ok(responses)
    }
}
