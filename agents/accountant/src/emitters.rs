use std::collections::HashMap;

use accountant_core::{AccountantError, AccountantResult, Address, ChainId};

use crate::settings::EmitterSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EmitterKey {
    pub chain: ChainId,
    pub address: Address,
}

/// An immutable-after-startup set of covered emitters mapping
/// (chain, address) to the per-emitter enforcement flag. Safe to read from
/// any number of tasks without synchronization because it is never mutated
/// once built.
#[derive(Clone, Debug, Default)]
pub(crate) struct EmitterSet {
    entries: HashMap<EmitterKey, bool>,
}

impl EmitterSet {
    pub fn from_settings(emitters: &[EmitterSettings]) -> AccountantResult<Self> {
        let mut entries = HashMap::with_capacity(emitters.len());
        for emitter in emitters {
            let address: Address = emitter.address.parse()?;
            let key = EmitterKey {
                chain: emitter.chain,
                address,
            };
            if entries.insert(key, emitter.enforce).is_some() {
                return Err(AccountantError::DuplicateEmitter(emitter.chain));
            }
        }
        Ok(Self { entries })
    }

    /// The enforcement flag for a covered emitter, or `None` if the emitter
    /// is not in the set.
    pub fn enforce_flag(&self, chain: ChainId, address: &Address) -> Option<bool> {
        self.entries
            .get(&EmitterKey {
                chain,
                address: *address,
            })
            .copied()
    }

    pub fn any_enforced(&self) -> bool {
        self.entries.values().any(|enforce| *enforce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter(chain: ChainId, address: &str, enforce: bool) -> EmitterSettings {
        EmitterSettings {
            chain,
            address: address.into(),
            enforce,
        }
    }

    #[test]
    fn lookup_returns_per_emitter_flag() {
        let set = EmitterSet::from_settings(&[
            emitter(2, &"ee".repeat(32), true),
            emitter(4, &"ab".repeat(32), false),
        ])
        .unwrap();
        assert_eq!(set.enforce_flag(2, &Address([0xee; 32])), Some(true));
        assert_eq!(set.enforce_flag(4, &Address([0xab; 32])), Some(false));
        assert_eq!(set.enforce_flag(4, &Address([0xee; 32])), None);
        assert!(set.any_enforced());
    }

    #[test]
    fn duplicate_registration_is_a_startup_error() {
        let err = EmitterSet::from_settings(&[
            emitter(2, &"ee".repeat(32), true),
            emitter(2, &"ee".repeat(32), false),
        ])
        .unwrap_err();
        assert!(matches!(err, AccountantError::DuplicateEmitter(2)));
    }

    #[test]
    fn malformed_address_is_a_startup_error() {
        let err = EmitterSet::from_settings(&[emitter(2, "not-hex", true)]).unwrap_err();
        assert!(matches!(err, AccountantError::InvalidAddress(_)));
    }
}
