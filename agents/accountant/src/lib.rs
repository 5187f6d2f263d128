//! The accountant agent: a consistency gate that withholds publication of
//! cross-chain transfer messages until an on-chain accountant contract
//! confirms that global custody invariants hold.
//!
//! The engine tracks every covered transfer in a durable pending store,
//! submits signed observation batches to the contract, watches the
//! contract's event stream for commitments, and periodically audits its own
//! store against the contract's view to recover from losses on either side.

pub use accountant::{Accountant, ContractHandle};
pub use classify::Classification;
pub use metrics::AccountantMetrics;
pub use settings::{AccountantSettings, EmitterSettings};

mod accountant;
mod audit;
mod classify;
mod emitters;
mod metrics;
mod ntt;
mod pending;
mod settings;
mod submit;
mod watcher;

#[cfg(test)]
mod test_utils;
