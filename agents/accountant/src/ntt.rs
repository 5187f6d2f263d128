//! Binary marker tests for native-token-transfer (NTT) payloads, including
//! recovery of the true sender from an automatic-relayer delivery
//! instruction envelope.

use accountant_core::Address;

/// Wrapper marker at the start of every NTT payload.
const NTT_PREFIX: [u8; 4] = [0x99, 0x45, 0xFF, 0x10];

/// Transfer-type marker inside the wrapped payload.
const NTT_TRANSFER_PREFIX: [u8; 4] = [0x99, 0x4E, 0x54, 0x54];
const NTT_TRANSFER_PREFIX_OFFSET: usize = 136;

/// Message-key type carrying a fixed-size attestation key.
const MESSAGE_KEY_TYPE_VAA: u8 = 1;
const VAA_KEY_LEN: usize = 42;

/// Whether `payload` is an NTT transfer: the wrapper marker at offset 0 and
/// the transfer-type marker at offset 136. Payloads shorter than 140 bytes
/// never match.
pub(crate) fn is_ntt_payload(payload: &[u8]) -> bool {
    payload.len() >= NTT_TRANSFER_PREFIX_OFFSET + 4
        && payload[..4] == NTT_PREFIX
        && payload[NTT_TRANSFER_PREFIX_OFFSET..NTT_TRANSFER_PREFIX_OFFSET + 4]
            == NTT_TRANSFER_PREFIX
}

/// Parses an automatic-relayer "delivery instruction" envelope, returning
/// the 32-byte sender address and the inner payload.
///
/// Returns `None` on any structural failure (short read, wrong discriminant,
/// trailing bytes): the envelope format is not exclusive to NTT traffic, so
/// not-an-envelope is an expected outcome rather than an error.
pub(crate) fn parse_relayer_envelope(payload: &[u8]) -> Option<(Address, &[u8])> {
    let mut reader = Reader::new(payload);

    if reader.read_u8()? != 1 {
        return None;
    }
    let _target_chain = reader.read_u16()?;
    let _target_address = reader.read_bytes(32)?;
    let payload_len = reader.read_u32()? as usize;
    let inner_payload = reader.read_bytes(payload_len)?;
    let _requested_receiver_value = reader.read_bytes(32)?;
    let _extra_receiver_value = reader.read_bytes(32)?;
    let execution_info_len = reader.read_u32()? as usize;
    let _execution_info = reader.read_bytes(execution_info_len)?;
    let _refund_chain = reader.read_u16()?;
    let _refund_address = reader.read_bytes(32)?;
    let _refund_delivery_provider = reader.read_bytes(32)?;
    let _source_delivery_provider = reader.read_bytes(32)?;
    let sender = reader.read_bytes(32)?;
    let num_message_keys = reader.read_u8()?;
    for _ in 0..num_message_keys {
        let key_type = reader.read_u8()?;
        if key_type == MESSAGE_KEY_TYPE_VAA {
            reader.read_bytes(VAA_KEY_LEN)?;
        } else {
            let len = reader.read_u32()? as usize;
            reader.read_bytes(len)?;
        }
    }

    if !reader.is_empty() {
        return None;
    }

    let mut sender_address = [0u8; 32];
    sender_address.copy_from_slice(sender);
    Some((Address(sender_address), inner_payload))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        self.read_bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.read_bytes(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
