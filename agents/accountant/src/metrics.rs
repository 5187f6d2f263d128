use prometheus::{
    opts, register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Counters and gauges through which operators observe outcomes. Labeled by
/// contract where the engine runs one instance of a path per contract.
#[derive(Clone, Debug)]
pub struct AccountantMetrics {
    /// Number of transfers currently in the pending store.
    pub(crate) transfers_outstanding: IntGauge,
    /// Observations handed to a submission batch.
    pub(crate) observations_submitted: IntCounterVec,
    /// Transfers confirmed committed and published.
    pub(crate) transfers_approved: IntCounterVec,
    /// Submissions that ended indeterminate or with a per-item failure.
    pub(crate) submit_failures: IntCounterVec,
    /// Transfers dropped on an insufficient-balance error.
    pub(crate) balance_errors: IntCounter,
    /// Transfers whose tracked content stopped matching the network's view.
    pub(crate) digest_mismatches: IntCounter,
    /// Audit findings: stuck submissions and forced resubmissions.
    pub(crate) audit_errors: IntCounterVec,
    /// Reobservation requests issued for transfers unknown locally.
    pub(crate) reobservations_requested: IntCounterVec,
    /// Cleared transfers dropped because the egress queue was full.
    pub(crate) publication_drops: IntCounter,
    /// Contract events that could not be parsed.
    pub(crate) malformed_events: IntCounterVec,
}

impl AccountantMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            transfers_outstanding: register_int_gauge_with_registry!(
                opts!(
                    "accountant_transfers_outstanding",
                    "Current number of pending transfers tracked by the accountant"
                ),
                registry
            )?,
            observations_submitted: register_int_counter_vec_with_registry!(
                opts!(
                    "accountant_observations_submitted_total",
                    "Total number of observations submitted to the accountant contract"
                ),
                &["contract"],
                registry
            )?,
            transfers_approved: register_int_counter_vec_with_registry!(
                opts!(
                    "accountant_transfers_approved_total",
                    "Total number of transfers approved by the accountant contract"
                ),
                &["contract"],
                registry
            )?,
            submit_failures: register_int_counter_vec_with_registry!(
                opts!(
                    "accountant_submit_failures_total",
                    "Total number of failed observation submissions"
                ),
                &["contract"],
                registry
            )?,
            balance_errors: register_int_counter_with_registry!(
                opts!(
                    "accountant_balance_errors_total",
                    "Total number of transfers dropped on an insufficient balance error"
                ),
                registry
            )?,
            digest_mismatches: register_int_counter_with_registry!(
                opts!(
                    "accountant_digest_mismatches_total",
                    "Total number of digest mismatches detected on pending transfers"
                ),
                registry
            )?,
            audit_errors: register_int_counter_vec_with_registry!(
                opts!(
                    "accountant_audit_errors_total",
                    "Total number of anomalies detected by the audit"
                ),
                &["contract"],
                registry
            )?,
            reobservations_requested: register_int_counter_vec_with_registry!(
                opts!(
                    "accountant_reobservations_requested_total",
                    "Total number of local reobservation requests issued by the audit"
                ),
                &["contract"],
                registry
            )?,
            publication_drops: register_int_counter_with_registry!(
                opts!(
                    "accountant_publication_drops_total",
                    "Total number of cleared transfers dropped because the egress queue was full"
                ),
                registry
            )?,
            malformed_events: register_int_counter_vec_with_registry!(
                opts!(
                    "accountant_malformed_events_total",
                    "Total number of contract events that could not be parsed"
                ),
                &["contract"],
                registry
            )?,
        })
    }
}
