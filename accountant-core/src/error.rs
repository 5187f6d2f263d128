use crate::DbError;

/// Errors surfaced by the reconciliation engine and its collaborators.
///
/// Per-transfer failures are absorbed by the engine's state machine; the
/// variants here reach callers only from startup/configuration paths or from
/// the contract boundary helpers.
#[derive(Debug, thiserror::Error)]
pub enum AccountantError {
    /// An emitter or transaction-hash string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The same (chain, address) emitter was registered twice.
    #[error("duplicate emitter registered for chain {0}")]
    DuplicateEmitter(u16),
    /// Neither the base nor the NTT contract is configured.
    #[error("no accountant contract configured")]
    NoContractConfigured,
    /// A contract address was configured without a matching connection.
    #[error("contract {0} is configured but has no connection")]
    MissingConnection(&'static str),
    /// The engine was started more than once.
    #[error("accountant already started")]
    AlreadyStarted,
    /// The consensus-set provider returned no current set.
    #[error("failed to get guardian set")]
    GuardianSetUnavailable,
    /// Our guardian key is not a member of the current consensus set.
    #[error("failed to get guardian index")]
    GuardianIndexNotFound,
    /// A contract query failed at the transport level.
    #[error("contract query failed: {0}")]
    Query(String),
    /// A broadcast failed, or the transaction response indicates failure.
    #[error("failed to send broadcast: {0}")]
    Broadcast(String),
    /// A contract response could not be interpreted.
    #[error("malformed contract response: {0}")]
    MalformedResponse(String),
    /// The signer refused or failed to produce a signature.
    #[error("signer error: {0}")]
    Signer(String),
    /// The durable store failed.
    #[error(transparent)]
    Db(#[from] DbError),
    /// A contract-boundary body could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AccountantResult<T> = Result<T, AccountantError>;
