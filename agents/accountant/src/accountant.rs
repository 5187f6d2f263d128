use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use accountant_core::{
    AccountantError, AccountantResult, ContractConn, ContractEvent, GuardianSetProvider,
    MessagePublication, ObservationSigner, PendingTransferDb, ReobservationSink,
};

use crate::classify::{Classification, Classifier};
use crate::metrics::AccountantMetrics;
use crate::pending::PendingTransfer;
use crate::settings::AccountantSettings;

pub(crate) const BASE_CONTRACT: &str = "accountant";
pub(crate) const NTT_CONTRACT: &str = "ntt-accountant";

/// Error text substring that marks a terminal, non-retryable business-rule
/// failure reported by the contract.
const INSUFFICIENT_BALANCE: &str = "insufficient balance";

/// The connection and event stream for one configured contract, supplied by
/// the caller at construction time.
pub struct ContractHandle {
    pub conn: Arc<dyn ContractConn>,
    pub events: mpsc::Receiver<ContractEvent>,
}

/// Everything one contract's submission and watcher paths need.
pub(crate) struct ContractContext {
    pub name: &'static str,
    pub address: String,
    pub conn: Arc<dyn ContractConn>,
    pub submit_tx: mpsc::Sender<Arc<PendingTransfer>>,
    submit_rx: Mutex<Option<mpsc::Receiver<Arc<PendingTransfer>>>>,
    event_rx: Mutex<Option<mpsc::Receiver<ContractEvent>>>,
}

impl ContractContext {
    /// Whether this context serves the NTT contract rather than the base one.
    pub(crate) fn is_ntt(&self) -> bool {
        self.name == NTT_CONTRACT
    }
}

/// The transfer reconciliation engine.
///
/// Every locally observed message passes through [`Accountant::submit_observation`]
/// before it may be signed and published; covered transfers are withheld
/// until the accountant contract confirms that global custody invariants
/// hold. Resolution arrives through the submission workers, the contract
/// watchers, or the periodic audit, all of which drive the same store
/// operations.
pub struct Accountant {
    classifier: Classifier,
    db: Arc<dyn PendingTransferDb>,
    pub(crate) guardian_sets: Arc<dyn GuardianSetProvider>,
    pub(crate) signer: Arc<dyn ObservationSigner>,
    pub(crate) reobservations: Arc<dyn ReobservationSink>,
    cleared_tx: mpsc::Sender<MessagePublication>,
    pub(crate) base: Option<Arc<ContractContext>>,
    pub(crate) ntt: Option<Arc<ContractContext>>,
    /// Store lock: guards the map and the paired durable writes.
    pub(crate) pending: Mutex<HashMap<String, Arc<PendingTransfer>>>,
    pub(crate) metrics: AccountantMetrics,
    pub(crate) audit_interval: Duration,
    pub(crate) stale_after: Duration,
    pub(crate) last_audit: Mutex<Option<Instant>>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Accountant {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: AccountantSettings,
        db: Arc<dyn PendingTransferDb>,
        guardian_sets: Arc<dyn GuardianSetProvider>,
        signer: Arc<dyn ObservationSigner>,
        reobservations: Arc<dyn ReobservationSink>,
        base: Option<ContractHandle>,
        ntt: Option<ContractHandle>,
        cleared_tx: mpsc::Sender<MessagePublication>,
        metrics: AccountantMetrics,
    ) -> AccountantResult<Self> {
        let classifier = Classifier::from_settings(&settings)?;

        let make_context = |name: &'static str, address: String, handle: ContractHandle| {
            let (submit_tx, submit_rx) = mpsc::channel(settings.submit_channel_size);
            Arc::new(ContractContext {
                name,
                address,
                conn: handle.conn,
                submit_tx,
                submit_rx: Mutex::new(Some(submit_rx)),
                event_rx: Mutex::new(Some(handle.events)),
            })
        };

        let base = match (settings.base_contract.clone(), base) {
            (Some(address), Some(handle)) => Some(make_context(BASE_CONTRACT, address, handle)),
            (None, _) => None,
            (Some(_), None) => return Err(AccountantError::MissingConnection(BASE_CONTRACT)),
        };
        let ntt = match (settings.ntt_contract.clone(), ntt) {
            (Some(address), Some(handle)) => Some(make_context(NTT_CONTRACT, address, handle)),
            (None, _) => None,
            (Some(_), None) => return Err(AccountantError::MissingConnection(NTT_CONTRACT)),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            classifier,
            db,
            guardian_sets,
            signer,
            reobservations,
            cleared_tx,
            base,
            ntt,
            pending: Mutex::new(HashMap::new()),
            metrics,
            audit_interval: settings.audit_interval(),
            stale_after: settings.submit_pending_stale_after(),
            last_audit: Mutex::new(None),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Reloads durable state and spawns the submission workers, the contract
    /// watchers and the audit scheduler. Fails if neither contract is
    /// configured or if the engine was already started.
    pub fn start(self: Arc<Self>) -> AccountantResult<()> {
        if self.base.is_none() && self.ntt.is_none() {
            return Err(AccountantError::NoContractConfigured);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AccountantError::AlreadyStarted);
        }

        self.load_pending_transfers()?;
        // The first audit runs one interval after startup; the
        // missing-observations query will rediscover any real need to
        // resubmit, so reload does not trigger a submission storm.
        *self.last_audit.lock() = Some(Instant::now());

        let mut tasks = Vec::new();
        for ctx in [self.base.clone(), self.ntt.clone()].into_iter().flatten() {
            if let Some(rx) = ctx.submit_rx.lock().take() {
                tasks.push(tokio::spawn(Arc::clone(&self).submission_worker(
                    Arc::clone(&ctx),
                    rx,
                    self.shutdown_rx.clone(),
                )));
            }
            if let Some(rx) = ctx.event_rx.lock().take() {
                tasks.push(tokio::spawn(Arc::clone(&self).contract_watcher(
                    Arc::clone(&ctx),
                    rx,
                    self.shutdown_rx.clone(),
                )));
            }
        }
        tasks.push(tokio::spawn(
            Arc::clone(&self).audit_scheduler(self.shutdown_rx.clone()),
        ));
        *self.tasks.lock() = tasks;
        info!(features = %self.feature_string(), "accountant started");
        Ok(())
    }

    /// Signals shutdown and stops all engine tasks.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// The sole ingress: reconciles one locally observed message. Returns
    /// whether the caller may publish it immediately; `false` means the
    /// transfer is withheld until the contract commits it.
    pub fn submit_observation(&self, msg: MessagePublication) -> AccountantResult<bool> {
        let msg_id = msg.message_id();
        let classification = self.classifier.classify(&msg);
        if !classification.is_covered() {
            debug!(%msg_id, "ignoring message because it is not covered");
            return Ok(true);
        }
        let Some(ctx) = self.context_for_class(classification) else {
            debug!(%msg_id, "covered message family has no contract configured, ignoring");
            return Ok(true);
        };

        let cleared = !classification.enforced();
        let digest = msg.digest();

        let new_entry = {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.get(&msg_id) {
                if existing.digest != digest {
                    self.metrics.digest_mismatches.inc();
                    error!(
                        %msg_id,
                        old_digest = %existing.digest_hex(),
                        new_digest = %hex::encode(digest),
                        "digest of pending transfer has changed, keeping the tracked content"
                    );
                } else {
                    info!(%msg_id, "transfer is already outstanding, not submitting again");
                }
                None
            } else {
                if let Err(err) = self.db.store_pending_transfer(&msg) {
                    error!(%msg_id, %err, "failed to persist pending transfer, blocking publication");
                    return Err(err.into());
                }
                let pe = Arc::new(PendingTransfer::new(msg, classification));
                pending.insert(msg_id.clone(), Arc::clone(&pe));
                self.metrics.transfers_outstanding.inc();
                Some(pe)
            }
        };

        if let Some(pe) = new_entry {
            info!(
                %msg_id,
                contract = ctx.name,
                can_publish = cleared,
                "submitting transfer to the accountant contract for approval"
            );
            self.enqueue_submission(&ctx, &pe);
        }

        Ok(cleared)
    }

    /// Marks the transfer submit-pending and hands it to the contract's
    /// intake queue. Best-effort: a full queue abandons the attempt (the
    /// audit cycle is the backstop). Returns whether the transfer was
    /// enqueued by this call.
    pub(crate) fn enqueue_submission(
        &self,
        ctx: &ContractContext,
        pe: &Arc<PendingTransfer>,
    ) -> bool {
        if !pe.try_set_submit_pending() {
            debug!(msg_id = %pe.msg_id, "transfer already has a submission outstanding, skipping");
            return false;
        }
        match ctx.submit_tx.try_send(Arc::clone(pe)) {
            Ok(()) => {
                debug!(msg_id = %pe.msg_id, contract = ctx.name, "queued transfer for submission");
                true
            }
            Err(_) => {
                pe.clear_submit_pending();
                warn!(
                    msg_id = %pe.msg_id,
                    contract = ctx.name,
                    "submission queue is full, will retry on the next audit cycle"
                );
                false
            }
        }
    }

    /// Removes a committed transfer from the store (durably) and, when
    /// enforcement is on for it, hands it to the egress queue. Returns false
    /// if the transfer was already gone, which makes racing resolutions
    /// idempotent.
    pub(crate) fn publish_transfer(&self, pe: &Arc<PendingTransfer>) -> bool {
        let removed = {
            let mut pending = self.pending.lock();
            let removed = pending.remove(&pe.msg_id).is_some();
            if removed {
                self.metrics.transfers_outstanding.dec();
                if let Err(err) = self.db.delete_pending_transfer(&pe.msg_id) {
                    error!(msg_id = %pe.msg_id, %err, "failed to delete pending transfer from the db");
                }
            }
            removed
        };
        if !removed {
            return false;
        }

        if pe.enforce {
            debug!(msg_id = %pe.msg_id, "handing cleared transfer to the egress queue");
            if self.cleared_tx.try_send(pe.msg.clone()).is_err() {
                self.metrics.publication_drops.inc();
                error!(
                    msg_id = %pe.msg_id,
                    "egress queue is full, dropping cleared transfer; the consumer's \
                     reobservation path has to recover it"
                );
            }
        }
        true
    }

    /// Resolution entry point shared by the worker, the watcher and the
    /// audit when the contract reports a transfer committed.
    pub(crate) fn handle_committed_transfer(&self, msg_id: &str, contract: &str) {
        let pe = self.pending.lock().get(msg_id).cloned();
        match pe {
            Some(pe) => {
                info!(%msg_id, contract, "transfer has been committed, publishing it");
                if self.publish_transfer(&pe) {
                    self.metrics
                        .transfers_approved
                        .with_label_values(&[contract])
                        .inc();
                }
            }
            None => {
                debug!(%msg_id, contract, "transfer has been committed but it is no longer in our map")
            }
        }
    }

    /// Routes a contract-reported error: insufficient balance is terminal by
    /// policy (retrying cannot change the outcome); everything else is left
    /// for the next audit cycle.
    pub(crate) fn handle_transfer_error(&self, msg_id: &str, err_text: &str, log_text: &str) {
        if err_text.contains(INSUFFICIENT_BALANCE) {
            self.metrics.balance_errors.inc();
            error!(%msg_id, text = err_text, "insufficient balance error detected, dropping transfer");
            self.delete_pending_transfer(msg_id);
        } else {
            error!(%msg_id, text = err_text, "{}", log_text);
        }
    }

    /// Removes a dropped transfer from the map and the db.
    pub(crate) fn delete_pending_transfer(&self, msg_id: &str) {
        let mut pending = self.pending.lock();
        if pending.remove(msg_id).is_some() {
            self.metrics.transfers_outstanding.dec();
        }
        if let Err(err) = self.db.delete_pending_transfer(msg_id) {
            // Keep going; the reload path drops uncovered leftovers.
            error!(%msg_id, %err, "failed to delete pending transfer from the db");
        }
    }

    /// Reloads durably persisted transfers, re-classifying each against the
    /// current configuration and dropping any that are no longer covered.
    pub(crate) fn load_pending_transfers(&self) -> AccountantResult<()> {
        let stored = self.db.retrieve_pending_transfers()?;
        let mut pending = self.pending.lock();
        for msg in stored {
            let msg_id = msg.message_id();
            let classification = self.classifier.classify(&msg);
            let configured = classification.is_covered()
                && if classification.is_ntt() {
                    self.ntt.is_some()
                } else {
                    self.base.is_some()
                };
            if !configured {
                warn!(%msg_id, "dropping reloaded transfer that is no longer covered");
                if let Err(err) = self.db.delete_pending_transfer(&msg_id) {
                    error!(%msg_id, %err, "failed to delete dropped transfer from the db");
                }
                continue;
            }
            info!(%msg_id, "reloaded pending transfer");
            pending.insert(
                msg_id,
                Arc::new(PendingTransfer::new(msg, classification)),
            );
            self.metrics.transfers_outstanding.inc();
        }
        if pending.is_empty() {
            info!("no pending transfers to reload");
        } else {
            info!(total = pending.len(), "reloaded pending transfers");
        }
        Ok(())
    }

    pub(crate) fn context_for_class(
        &self,
        classification: Classification,
    ) -> Option<Arc<ContractContext>> {
        if classification.is_ntt() {
            self.ntt.clone()
        } else {
            self.base.clone()
        }
    }

    /// The current consensus-set index and this guardian's position in it.
    pub(crate) fn guardian_indices(&self) -> AccountantResult<(u32, u32)> {
        let set = self
            .guardian_sets
            .current_set()
            .ok_or(AccountantError::GuardianSetUnavailable)?;
        let index = set
            .key_index(&self.signer.address())
            .ok_or(AccountantError::GuardianIndexNotFound)?;
        Ok((set.index, index as u32))
    }

    /// Short feature tags advertised over peer-to-peer status messages.
    pub fn feature_string(&self) -> String {
        let mut tags = Vec::new();
        if self.base.is_some() {
            tags.push(if self.classifier.token_bridge_enforced() {
                "acct:enforced"
            } else {
                "acct:logonly"
            });
        }
        if self.ntt.is_some() {
            tags.push(if self.classifier.ntt_enforced() {
                "ntt-acct:enforced"
            } else {
                "ntt-acct:logonly"
            });
        }
        tags.join("|")
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
