use std::fmt;

use crate::AccountantResult;

/// The 20-byte address identifying a guardian within the consensus set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuardianAddress(pub [u8; 20]);

impl fmt::Display for GuardianAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for GuardianAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The current roster of guardians, needed to produce an attributable
/// signature on a batch submission.
#[derive(Clone, Debug)]
pub struct GuardianSet {
    /// Index of this set in the on-chain history of sets.
    pub index: u32,
    pub members: Vec<GuardianAddress>,
}

impl GuardianSet {
    /// Position of `addr` within the set, if it is a member.
    pub fn key_index(&self, addr: &GuardianAddress) -> Option<usize> {
        self.members.iter().position(|m| m == addr)
    }
}

/// Source of the current consensus set. Returns `None` while no set is known
/// yet (e.g. before the initial on-chain fetch completes).
pub trait GuardianSetProvider: Send + Sync {
    fn current_set(&self) -> Option<GuardianSet>;
}

/// Produces this guardian's signature over a 32-byte digest.
pub trait ObservationSigner: Send + Sync {
    fn sign(&self, digest: &[u8; 32]) -> AccountantResult<Vec<u8>>;

    /// The guardian address corresponding to the signing key, used to locate
    /// our index in the consensus set.
    fn address(&self) -> GuardianAddress;
}
