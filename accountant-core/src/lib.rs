//! Core primitives shared by the accountant agent: chain-level types, the
//! observed message with its deterministic digest, the error taxonomy, and
//! the traits implemented by external collaborators (durable store, contract
//! connection, consensus-set provider, signer, reobservation sink).

pub use conn::*;
pub use db::*;
pub use error::*;
pub use guardian::*;
pub use message::*;
pub use types::*;

mod conn;
mod db;
mod error;
mod guardian;
mod message;
mod types;
