//! Contract event watcher: the asynchronous resolution path for transfers
//! whose commitment arrives after our own submission round, or that commit on
//! another guardian's quorum-completing submission.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use accountant_core::{
    AccountantError, AccountantResult, ContractEvent, MessagePublication, TransferKey, TxHash,
};

use crate::accountant::{Accountant, ContractContext};
use crate::submit::Observation;

const OBSERVATION_EVENT: &str = "wasm-Observation";
const OBSERVATION_ERROR_EVENT: &str = "wasm-ObservationError";

#[derive(Debug, Deserialize)]
struct ObservationError {
    key: TransferKey,
    error: String,
}

/// Reassembles a typed value from an event's attribute map. Attribute values
/// arrive JSON-encoded; attributes that are not valid JSON (the runtime adds
/// a few infrastructure ones) are skipped rather than rejected.
fn parse_event_attributes<T: DeserializeOwned>(event: &ContractEvent) -> AccountantResult<T> {
    let mut map = serde_json::Map::new();
    for (key, value) in &event.attributes {
        let Ok(parsed) = serde_json::from_str(value) else {
            continue;
        };
        map.insert(key.clone(), parsed);
    }
    serde_json::from_value(serde_json::Value::Object(map)).map_err(|err| {
        AccountantError::MalformedResponse(format!(
            "failed to parse {} event: {err}",
            event.kind
        ))
    })
}

fn observation_message(obs: &Observation) -> Option<MessagePublication> {
    let tx_hash: [u8; 32] = obs.tx_hash.as_slice().try_into().ok()?;
    Some(MessagePublication {
        tx_hash: TxHash(tx_hash),
        timestamp: obs.timestamp,
        nonce: obs.nonce,
        sequence: obs.sequence,
        emitter_chain: obs.emitter_chain,
        emitter_address: obs.emitter_address,
        consistency_level: obs.consistency_level,
        payload: obs.payload.clone(),
    })
}

impl Accountant {
    /// One watcher runs per configured contract, consuming that contract's
    /// event subscription until shutdown.
    pub(crate) async fn contract_watcher(
        self: Arc<Self>,
        ctx: Arc<ContractContext>,
        mut rx: mpsc::Receiver<ContractEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(contract = ctx.name, "contract watcher shutting down");
                    return;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        info!(contract = ctx.name, "contract event stream closed");
                        return;
                    };
                    self.handle_contract_event(&ctx, &event);
                }
            }
        }
    }

    pub(crate) fn handle_contract_event(&self, ctx: &ContractContext, event: &ContractEvent) {
        match event.kind.as_str() {
            OBSERVATION_EVENT => match parse_event_attributes::<Observation>(event) {
                Ok(obs) => self.handle_observation_event(ctx, &obs),
                Err(err) => {
                    self.metrics
                        .malformed_events
                        .with_label_values(&[ctx.name])
                        .inc();
                    error!(contract = ctx.name, %err, "failed to parse observation event");
                }
            },
            OBSERVATION_ERROR_EVENT => match parse_event_attributes::<ObservationError>(event) {
                Ok(obs_err) => {
                    let msg_id = obs_err.key.to_string();
                    self.handle_transfer_error(
                        &msg_id,
                        &obs_err.error,
                        "the contract reported an error for the transfer",
                    );
                }
                Err(err) => {
                    self.metrics
                        .malformed_events
                        .with_label_values(&[ctx.name])
                        .inc();
                    error!(contract = ctx.name, %err, "failed to parse observation error event");
                }
            },
            other => {
                debug!(contract = ctx.name, kind = other, "ignoring event of unexpected type");
            }
        }
    }

    /// An Observation event means the contract committed the transfer. If we
    /// track it and the committed content matches ours, publish; if the
    /// content differs, our version can never commit, so drop it. Transfers
    /// we do not track belong to other guardians' traffic and are ignored.
    fn handle_observation_event(&self, ctx: &ContractContext, obs: &Observation) {
        let msg_id = TransferKey {
            emitter_chain: obs.emitter_chain,
            emitter_address: obs.emitter_address,
            sequence: obs.sequence,
        }
        .to_string();

        let Some(pe) = self.pending.lock().get(&msg_id).cloned() else {
            debug!(%msg_id, contract = ctx.name, "ignoring committed observation for a transfer we are not tracking");
            return;
        };

        let Some(committed) = observation_message(obs) else {
            self.metrics
                .malformed_events
                .with_label_values(&[ctx.name])
                .inc();
            error!(%msg_id, contract = ctx.name, "observation event carries a malformed transaction hash");
            return;
        };

        if committed.digest() != pe.digest {
            self.metrics.digest_mismatches.inc();
            error!(
                %msg_id,
                tracked_digest = %pe.digest_hex(),
                committed_digest = %hex::encode(committed.digest()),
                "the committed observation does not match the transfer we are tracking, dropping it"
            );
            self.delete_pending_transfer(&msg_id);
            return;
        }

        self.handle_committed_transfer(&msg_id, ctx.name);
    }
}
