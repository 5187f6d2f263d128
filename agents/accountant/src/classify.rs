use accountant_core::{AccountantResult, MessagePublication};

use crate::emitters::EmitterSet;
use crate::ntt::{is_ntt_payload, parse_relayer_envelope};
use crate::settings::AccountantSettings;

/// Token-bridge payload type markers that indicate a transfer.
const PAYLOAD_TYPE_TRANSFER: u8 = 1;
const PAYLOAD_TYPE_TRANSFER_WITH_PAYLOAD: u8 = 3;

/// The disposition of a message with respect to the configured emitter sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// The engine has nothing to say about this message.
    NotCovered,
    /// A plain token-bridge transfer.
    TokenBridgeTransfer { enforce: bool },
    /// A native-token-transfer emitted directly by a registered endpoint.
    DirectNtt { enforce: bool },
    /// An NTT wrapped in an automatic-relayer delivery instruction.
    RelayedNtt { enforce: bool },
}

impl Classification {
    pub fn is_covered(&self) -> bool {
        !matches!(self, Classification::NotCovered)
    }

    pub fn is_ntt(&self) -> bool {
        matches!(
            self,
            Classification::DirectNtt { .. } | Classification::RelayedNtt { .. }
        )
    }

    /// Whether withholding blocks publication for this message. Not-covered
    /// messages are never withheld.
    pub fn enforced(&self) -> bool {
        match self {
            Classification::NotCovered => false,
            Classification::TokenBridgeTransfer { enforce }
            | Classification::DirectNtt { enforce }
            | Classification::RelayedNtt { enforce } => *enforce,
        }
    }
}

/// Pure classifier over the three configured emitter sets. The sets are
/// never mutated after startup, so `classify` is safe to call concurrently.
#[derive(Clone, Debug)]
pub(crate) struct Classifier {
    token_bridge: EmitterSet,
    ntt_direct: EmitterSet,
    relayer: EmitterSet,
}

impl Classifier {
    pub fn from_settings(settings: &AccountantSettings) -> AccountantResult<Self> {
        Ok(Self {
            token_bridge: EmitterSet::from_settings(&settings.token_bridge_emitters)?,
            ntt_direct: EmitterSet::from_settings(&settings.ntt_emitters)?,
            relayer: EmitterSet::from_settings(&settings.relayer_emitters)?,
        })
    }

    pub fn classify(&self, msg: &MessagePublication) -> Classification {
        if let Some(enforce) = self
            .token_bridge
            .enforce_flag(msg.emitter_chain, &msg.emitter_address)
        {
            if is_transfer_payload(&msg.payload) {
                return Classification::TokenBridgeTransfer { enforce };
            }
            return Classification::NotCovered;
        }

        if let Some(enforce) = self
            .ntt_direct
            .enforce_flag(msg.emitter_chain, &msg.emitter_address)
        {
            if is_ntt_payload(&msg.payload) {
                return Classification::DirectNtt { enforce };
            }
        }

        if self
            .relayer
            .enforce_flag(msg.emitter_chain, &msg.emitter_address)
            .is_some()
        {
            if let Some((sender, inner)) = parse_relayer_envelope(&msg.payload) {
                if let Some(enforce) = self.ntt_direct.enforce_flag(msg.emitter_chain, &sender) {
                    if is_ntt_payload(inner) {
                        return Classification::RelayedNtt { enforce };
                    }
                }
            }
        }

        Classification::NotCovered
    }

    pub fn token_bridge_enforced(&self) -> bool {
        self.token_bridge.any_enforced()
    }

    pub fn ntt_enforced(&self) -> bool {
        self.ntt_direct.any_enforced()
    }
}

fn is_transfer_payload(payload: &[u8]) -> bool {
    matches!(
        payload.first(),
        Some(&PAYLOAD_TYPE_TRANSFER) | Some(&PAYLOAD_TYPE_TRANSFER_WITH_PAYLOAD)
    )
}

#[cfg(test)]
mod tests {
    use accountant_core::{Address, TxHash};

    use super::*;
    use crate::ntt::tests::{GOOD_NTT_PAYLOAD, GOOD_RELAYER_PAYLOAD};
    use crate::settings::EmitterSettings;

    fn emitter(chain: u16, address: &str, enforce: bool) -> EmitterSettings {
        EmitterSettings {
            chain,
            address: address.into(),
            enforce,
        }
    }

    fn message(chain: u16, address: Address, payload: Vec<u8>) -> MessagePublication {
        MessagePublication {
            tx_hash: TxHash([0x06; 32]),
            timestamp: 1654543099,
            nonce: 42,
            sequence: 123456,
            emitter_chain: chain,
            emitter_address: address,
            consistency_level: 0,
            payload,
        }
    }

    fn classifier(settings: AccountantSettings) -> Classifier {
        Classifier::from_settings(&settings).unwrap()
    }

    #[test]
    fn transfer_from_configured_token_bridge_is_covered() {
        let c = classifier(AccountantSettings {
            token_bridge_emitters: vec![emitter(2, &"ee".repeat(32), true)],
            ..Default::default()
        });
        let msg = message(2, Address([0xee; 32]), vec![1, 2, 3]);
        assert_eq!(
            c.classify(&msg),
            Classification::TokenBridgeTransfer { enforce: true }
        );
        assert!(c.classify(&msg).is_covered());
        assert!(!c.classify(&msg).is_ntt());
    }

    #[test]
    fn transfer_from_unconfigured_emitter_is_not_covered() {
        let c = classifier(AccountantSettings {
            token_bridge_emitters: vec![emitter(2, &"ee".repeat(32), true)],
            ..Default::default()
        });
        let msg = message(2, Address([0xab; 32]), vec![1, 2, 3]);
        assert_eq!(c.classify(&msg), Classification::NotCovered);
        assert!(!c.classify(&msg).enforced());
    }

    #[test]
    fn non_transfer_payload_from_token_bridge_is_not_covered() {
        let c = classifier(AccountantSettings {
            token_bridge_emitters: vec![emitter(2, &"ee".repeat(32), true)],
            ..Default::default()
        });
        let msg = message(2, Address([0xee; 32]), vec![2, 0, 0]);
        assert_eq!(c.classify(&msg), Classification::NotCovered);
    }

    #[test]
    fn transfer_with_payload_marker_is_covered() {
        let c = classifier(AccountantSettings {
            token_bridge_emitters: vec![emitter(2, &"ee".repeat(32), false)],
            ..Default::default()
        });
        let msg = message(2, Address([0xee; 32]), vec![3]);
        assert_eq!(
            c.classify(&msg),
            Classification::TokenBridgeTransfer { enforce: false }
        );
    }

    #[test]
    fn short_payload_from_ntt_emitter_is_never_ntt() {
        let c = classifier(AccountantSettings {
            ntt_emitters: vec![emitter(2, &"ee".repeat(32), true)],
            ..Default::default()
        });
        let msg = message(2, Address([0xee; 32]), vec![0x99, 0x45, 0xFF, 0x10]);
        assert_eq!(c.classify(&msg), Classification::NotCovered);
    }

    #[test]
    fn well_formed_payload_from_ntt_emitter_is_direct_ntt() {
        let c = classifier(AccountantSettings {
            ntt_emitters: vec![emitter(2, &"ee".repeat(32), true)],
            ..Default::default()
        });
        let payload = hex::decode(GOOD_NTT_PAYLOAD).unwrap();
        let msg = message(2, Address([0xee; 32]), payload);
        assert_eq!(c.classify(&msg), Classification::DirectNtt { enforce: true });
        assert!(c.classify(&msg).is_ntt());
    }

    #[test]
    fn ntt_payload_from_wrong_chain_is_not_covered() {
        let c = classifier(AccountantSettings {
            ntt_emitters: vec![emitter(2, &"ee".repeat(32), true)],
            ..Default::default()
        });
        let payload = hex::decode(GOOD_NTT_PAYLOAD).unwrap();
        let msg = message(1, Address([0xee; 32]), payload);
        assert_eq!(c.classify(&msg), Classification::NotCovered);
    }

    #[test]
    fn relayed_ntt_requires_registered_relayer_and_inner_sender() {
        let relayer_addr = "0000000000000000000000007b1bd7a6b4e61c2a123ac6bc2cbfc614437d0470";
        let sender_addr = "000000000000000000000000c5bf11ab6ae525ffca02e2af7f6704cdcecec2ea";
        let chain = 10003;
        let c = classifier(AccountantSettings {
            ntt_emitters: vec![emitter(chain, sender_addr, true)],
            relayer_emitters: vec![emitter(chain, relayer_addr, true)],
            ..Default::default()
        });
        let payload = hex::decode(GOOD_RELAYER_PAYLOAD).unwrap();
        let msg = message(chain, relayer_addr.parse().unwrap(), payload.clone());
        assert_eq!(c.classify(&msg), Classification::RelayedNtt { enforce: true });

        // Same payload from an unknown relayer emitter is not covered.
        let other = message(chain, Address([0x11; 32]), payload.clone());
        assert_eq!(c.classify(&other), Classification::NotCovered);

        // Known relayer, but the recovered sender is not a registered NTT
        // emitter.
        let c2 = classifier(AccountantSettings {
            relayer_emitters: vec![emitter(chain, relayer_addr, true)],
            ..Default::default()
        });
        let msg2 = message(chain, relayer_addr.parse().unwrap(), payload);
        assert_eq!(c2.classify(&msg2), Classification::NotCovered);
    }
}
