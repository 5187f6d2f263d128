use crate::MessagePublication;

/// Errors returned by the durable pending-transfer store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("db store error: {0}")]
    Store(String),
    #[error("db delete error: {0}")]
    Delete(String),
    #[error("db load error: {0}")]
    Load(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Durable mirror of the in-memory pending-transfer map, keyed by message id.
///
/// Implementations must be crash-consistent: a restart observes either the
/// pre- or post-state of any single store/delete, never a torn write. The
/// engine performs these calls while holding its store lock, so they are
/// expected to be cheap local writes.
pub trait PendingTransferDb: Send + Sync {
    fn store_pending_transfer(&self, msg: &MessagePublication) -> DbResult<()>;

    fn delete_pending_transfer(&self, msg_id: &str) -> DbResult<()>;

    fn retrieve_pending_transfers(&self) -> DbResult<Vec<MessagePublication>>;
}
