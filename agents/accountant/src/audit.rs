//! Periodic audit: reconciles our pending store against the contract's view,
//! recovering transfers lost to dropped submissions, missed events or
//! crashes on either side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use accountant_core::{AccountantError, AccountantResult, TransferKey};

use crate::accountant::{Accountant, ContractContext};
use crate::pending::PendingTransfer;
use crate::submit::base64_bytes;

/// Upper bound on transfer keys per batch status query, to stay under the
/// contract's query gas limit.
pub(crate) const AUDIT_CHUNK_SIZE: usize = 500;

#[derive(Debug, Serialize)]
struct MissingObservationsQuery {
    missing_observations: MissingObservationsParams,
}

#[derive(Debug, Serialize)]
struct MissingObservationsParams {
    guardian_set: u32,
    index: u8,
}

#[derive(Debug, Deserialize)]
struct MissingObservationsResponse {
    missing: Vec<MissingObservation>,
}

/// A transfer the contract has quorum interest in but no observation from
/// this guardian for.
#[derive(Debug, Deserialize)]
struct MissingObservation {
    chain_id: u16,
    #[serde(with = "base64_bytes")]
    tx_hash: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct BatchTransferStatusQuery<'a> {
    batch_transfer_status: &'a [TransferKey],
}

#[derive(Debug, Deserialize)]
struct BatchTransferStatusResponse {
    details: Vec<TransferDetails>,
}

#[derive(Debug, Deserialize)]
struct TransferDetails {
    key: TransferKey,
    /// `None` when the contract has never seen the transfer. Left untyped
    /// so one unrecognized status variant cannot poison the whole batch.
    status: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CommittedTransfer {
    #[allow(dead_code)]
    data: serde_json::Value,
    #[serde(with = "base64_bytes")]
    digest: Vec<u8>,
}

impl Accountant {
    pub(crate) async fn audit_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.audit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("audit scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    Arc::clone(&self).audit_now().await;
                }
            }
        }
    }

    /// Runs one audit pass over every configured contract, unless one ran
    /// more recently than the audit interval. Callable out of band; the
    /// gating keeps an external trigger from stacking on the scheduler.
    pub async fn audit_now(self: Arc<Self>) {
        {
            let mut last = self.last_audit.lock();
            if let Some(prev) = *last {
                if prev.elapsed() < self.audit_interval {
                    debug!("skipping audit, the last one ran too recently");
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        for ctx in [self.base.clone(), self.ntt.clone()].into_iter().flatten() {
            let acct = Arc::clone(&self);
            tokio::spawn(async move { acct.perform_audit(&ctx).await });
        }
    }

    /// One full audit cycle for one contract. A query failure aborts only
    /// the phase it happens in; nothing is resolved speculatively on a
    /// failed query.
    pub(crate) async fn perform_audit(&self, ctx: &ContractContext) {
        debug!(contract = ctx.name, "beginning audit");
        let mut snapshot = self.audit_snapshot(ctx);
        if let Err(err) = self.audit_missing_observations(ctx, &mut snapshot).await {
            error!(contract = ctx.name, %err, "missing observations audit phase failed");
        }
        if let Err(err) = self.audit_pending_transfers(ctx, &snapshot).await {
            error!(contract = ctx.name, %err, "transfer status audit phase failed");
        }
        debug!(contract = ctx.name, "audit complete");
    }

    /// Snapshots the transfers this contract is responsible for, keyed the
    /// way the contract identifies them, and flags any that have sat in the
    /// submit-pending state past the staleness threshold. Flagged only: the
    /// submission round owns the flag and will clear it when it ends.
    fn audit_snapshot(&self, ctx: &ContractContext) -> HashMap<String, Arc<PendingTransfer>> {
        let mut snapshot = HashMap::new();
        for pe in self.pending.lock().values() {
            if pe.is_ntt != ctx.is_ntt() {
                continue;
            }
            if pe.submit_pending_longer_than(self.stale_after) {
                self.metrics
                    .audit_errors
                    .with_label_values(&[ctx.name])
                    .inc();
                error!(
                    msg_id = %pe.msg_id,
                    "transfer has been in the submit-pending state for too long"
                );
            }
            snapshot.insert(pe.audit_key(), Arc::clone(pe));
        }
        snapshot
    }

    /// Phase one: ask the contract which transfers it is still waiting on an
    /// observation from us for. Tracked ones get resubmitted (or left alone
    /// when a submission is already in flight) and taken out of the working
    /// set; unknown ones turn into local reobservation requests.
    async fn audit_missing_observations(
        &self,
        ctx: &ContractContext,
        snapshot: &mut HashMap<String, Arc<PendingTransfer>>,
    ) -> AccountantResult<()> {
        let (guardian_set, index) = self.guardian_indices()?;
        let query = serde_json::to_vec(&MissingObservationsQuery {
            missing_observations: MissingObservationsParams {
                guardian_set,
                index: index as u8,
            },
        })?;
        let resp = ctx.conn.query(&ctx.address, query).await?;
        let missing: MissingObservationsResponse =
            serde_json::from_slice(&resp).map_err(|err| {
                AccountantError::MalformedResponse(format!(
                    "failed to parse missing observations response: {err}"
                ))
            })?;

        // The contract reports one entry per missing transfer, so a
        // transaction with several transfers shows up multiple times.
        for mo in missing
            .missing
            .into_iter()
            .unique_by(|mo| (mo.chain_id, mo.tx_hash.clone()))
        {
            let audit_key = format!("{}-{}", mo.chain_id, hex::encode(&mo.tx_hash));
            if let Some(pe) = snapshot.remove(&audit_key) {
                if pe.submit_pending() {
                    debug!(msg_id = %pe.msg_id, "transfer already has a submission in flight");
                } else {
                    warn!(
                        msg_id = %pe.msg_id,
                        "contract is missing our observation for a tracked transfer, resubmitting it"
                    );
                    self.enqueue_submission(ctx, &pe);
                }
            } else {
                info!(
                    chain = mo.chain_id,
                    tx_hash = %hex::encode(&mo.tx_hash),
                    "contract is missing an observation we do not have, requesting a reobservation"
                );
                self.metrics
                    .reobservations_requested
                    .with_label_values(&[ctx.name])
                    .inc();
                self.reobservations
                    .request_reobservation(mo.chain_id, &mo.tx_hash);
            }
        }
        Ok(())
    }

    /// Phase two: query the contract's status for every tracked transfer and
    /// resolve each the same way a submission response would.
    async fn audit_pending_transfers(
        &self,
        ctx: &ContractContext,
        snapshot: &HashMap<String, Arc<PendingTransfer>>,
    ) -> AccountantResult<()> {
        if snapshot.is_empty() {
            debug!(contract = ctx.name, "no pending transfers to audit");
            return Ok(());
        }

        let keys: Vec<TransferKey> = snapshot
            .values()
            .map(|pe| pe.msg.transfer_key())
            .collect();
        let mut answered: HashSet<String> = HashSet::with_capacity(keys.len());
        for chunk in keys.chunks(AUDIT_CHUNK_SIZE) {
            let query = serde_json::to_vec(&BatchTransferStatusQuery {
                batch_transfer_status: chunk,
            })?;
            let resp = ctx.conn.query(&ctx.address, query).await?;
            let statuses: BatchTransferStatusResponse = serde_json::from_slice(&resp)
                .map_err(|err| {
                    AccountantError::MalformedResponse(format!(
                        "failed to parse batch transfer status response: {err}"
                    ))
                })?;

            for details in statuses.details {
                let msg_id = details.key.to_string();
                answered.insert(msg_id.clone());
                // Re-read the live map: the transfer may have resolved since
                // the snapshot was taken.
                let Some(pe) = self.pending.lock().get(&msg_id).cloned() else {
                    continue;
                };
                match details.status {
                    None => self.resubmit_unknown(ctx, &msg_id, &pe),
                    Some(status) => {
                        if let Some(committed) = status.get("committed") {
                            match serde_json::from_value::<CommittedTransfer>(committed.clone())
                            {
                                Ok(committed) => {
                                    self.resolve_committed_status(ctx, &msg_id, &pe, &committed)
                                }
                                Err(err) => {
                                    error!(%msg_id, %err, "failed to parse committed transfer status")
                                }
                            }
                        } else if status.get("pending").is_some() {
                            debug!(%msg_id, "transfer is still pending in the contract");
                        } else {
                            // Unrecognized status shape: treat like a
                            // transfer the contract cannot account for.
                            warn!(%msg_id, status = %status, "contract returned an unrecognized transfer status");
                            self.resubmit_unknown(ctx, &msg_id, &pe);
                        }
                    }
                }
            }
        }

        // A transfer the contract left out of the response entirely is as
        // unknown to it as an explicit null status.
        for pe in snapshot.values() {
            if answered.contains(&pe.msg_id) {
                continue;
            }
            let Some(pe) = self.pending.lock().get(&pe.msg_id).cloned() else {
                continue;
            };
            self.resubmit_unknown(ctx, &pe.msg_id, &pe);
        }
        Ok(())
    }

    fn resubmit_unknown(&self, ctx: &ContractContext, msg_id: &str, pe: &Arc<PendingTransfer>) {
        if !pe.submit_pending() {
            self.metrics
                .audit_errors
                .with_label_values(&[ctx.name])
                .inc();
            warn!(%msg_id, "contract does not know about this transfer, resubmitting it");
            self.enqueue_submission(ctx, pe);
        }
    }

    fn resolve_committed_status(
        &self,
        ctx: &ContractContext,
        msg_id: &str,
        pe: &Arc<PendingTransfer>,
        committed: &CommittedTransfer,
    ) {
        if committed.digest == pe.digest {
            self.handle_committed_transfer(msg_id, ctx.name);
        } else {
            self.metrics.digest_mismatches.inc();
            error!(
                %msg_id,
                tracked_digest = %pe.digest_hex(),
                committed_digest = %hex::encode(&committed.digest),
                "the transfer committed by the contract does not match ours, dropping it"
            );
            self.delete_pending_transfer(msg_id);
        }
    }
}
