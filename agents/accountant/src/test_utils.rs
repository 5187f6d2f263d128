//! Shared fakes and builders for the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::sync::mpsc;

use accountant_core::{
    AccountantError, AccountantResult, Address, ChainId, ContractConn, ContractEvent, DbError,
    DbResult, GuardianAddress, GuardianSet, GuardianSetProvider, MessagePublication,
    ObservationSigner, PendingTransferDb, ReobservationSink, TxResponse, TxHash,
};

use crate::accountant::{Accountant, ContractHandle};
use crate::metrics::AccountantMetrics;
use crate::ntt::tests::GOOD_NTT_PAYLOAD;
use crate::settings::{AccountantSettings, EmitterSettings};
use crate::submit::Observation;

pub(crate) const TOKEN_BRIDGE_EMITTER: [u8; 32] = [0xee; 32];
pub(crate) const NTT_EMITTER: [u8; 32] = [0xaa; 32];
pub(crate) const GUARDIAN_ADDRESS: [u8; 20] = [0x0d; 20];

mock! {
    pub Conn {}

    #[async_trait]
    impl ContractConn for Conn {
        async fn query(&self, contract: &str, query: Vec<u8>) -> AccountantResult<Vec<u8>>;
        async fn sign_and_broadcast(
            &self,
            contract: &str,
            msg: Vec<u8>,
        ) -> AccountantResult<TxResponse>;
        fn sender_address(&self) -> String;
    }
}

/// In-memory durable store with optional store-failure injection.
#[derive(Default)]
pub(crate) struct MemoryDb {
    inner: Mutex<HashMap<String, MessagePublication>>,
    fail_stores: AtomicBool,
}

impl MemoryDb {
    pub fn stored_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stored(&self) -> Vec<MessagePublication> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn set_fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }
}

impl PendingTransferDb for MemoryDb {
    fn store_pending_transfer(&self, msg: &MessagePublication) -> DbResult<()> {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(DbError::Store("injected store failure".into()));
        }
        self.inner.lock().insert(msg.message_id(), msg.clone());
        Ok(())
    }

    fn delete_pending_transfer(&self, msg_id: &str) -> DbResult<()> {
        self.inner.lock().remove(msg_id);
        Ok(())
    }

    fn retrieve_pending_transfers(&self) -> DbResult<Vec<MessagePublication>> {
        Ok(self.stored())
    }
}

pub(crate) struct FixedGuardianSet(pub GuardianSet);

impl GuardianSetProvider for FixedGuardianSet {
    fn current_set(&self) -> Option<GuardianSet> {
        Some(self.0.clone())
    }
}

/// Deterministic stand-in signer: the "signature" is the digest followed by
/// 33 fixed bytes, which keeps signed bodies checkable without key material.
pub(crate) struct TestSigner;

impl ObservationSigner for TestSigner {
    fn sign(&self, digest: &[u8; 32]) -> AccountantResult<Vec<u8>> {
        let mut signature = digest.to_vec();
        signature.extend_from_slice(&[0x5a; 33]);
        Ok(signature)
    }

    fn address(&self) -> GuardianAddress {
        GuardianAddress(GUARDIAN_ADDRESS)
    }
}

#[derive(Default)]
pub(crate) struct RecordingReobservations {
    requests: Mutex<Vec<(ChainId, Vec<u8>)>>,
}

impl RecordingReobservations {
    pub fn requests(&self) -> Vec<(ChainId, Vec<u8>)> {
        self.requests.lock().clone()
    }
}

impl ReobservationSink for RecordingReobservations {
    fn request_reobservation(&self, chain: ChainId, tx_hash: &[u8]) {
        self.requests.lock().push((chain, tx_hash.to_vec()));
    }
}

/// Connection that rejects all traffic, for tests that never reach the
/// contract boundary.
pub(crate) struct NoopConn;

#[async_trait]
impl ContractConn for NoopConn {
    async fn query(&self, _contract: &str, _query: Vec<u8>) -> AccountantResult<Vec<u8>> {
        Err(AccountantError::Query("no queries expected".into()))
    }

    async fn sign_and_broadcast(
        &self,
        _contract: &str,
        _msg: Vec<u8>,
    ) -> AccountantResult<TxResponse> {
        Err(AccountantError::Broadcast("no broadcasts expected".into()))
    }

    fn sender_address(&self) -> String {
        "wormhole1sender".into()
    }
}

pub(crate) fn test_settings() -> AccountantSettings {
    AccountantSettings {
        base_contract: Some("wormhole1base".into()),
        ntt_contract: Some("wormhole1ntt".into()),
        token_bridge_emitters: vec![EmitterSettings {
            chain: 2,
            address: hex::encode(TOKEN_BRIDGE_EMITTER),
            enforce: true,
        }],
        ntt_emitters: vec![EmitterSettings {
            chain: 2,
            address: hex::encode(NTT_EMITTER),
            enforce: true,
        }],
        relayer_emitters: vec![],
        // Zero staleness so audit snapshots flag still-set flags.
        submit_pending_stale_secs: 0,
        ..Default::default()
    }
}

pub(crate) fn test_message(sequence: u64) -> MessagePublication {
    let mut tx_hash = [0x06; 32];
    tx_hash[..8].copy_from_slice(&sequence.to_be_bytes());
    MessagePublication {
        tx_hash: TxHash(tx_hash),
        timestamp: 1654543099,
        nonce: 1,
        sequence,
        emitter_chain: 2,
        emitter_address: Address(TOKEN_BRIDGE_EMITTER),
        consistency_level: 1,
        payload: vec![1, 0xab, 0xcd],
    }
}

pub(crate) fn ntt_message(sequence: u64) -> MessagePublication {
    MessagePublication {
        emitter_address: Address(NTT_EMITTER),
        payload: hex::decode(GOOD_NTT_PAYLOAD).unwrap(),
        ..test_message(sequence)
    }
}

/// Builds a wasm-Observation event the way the contract emits one: every
/// attribute value JSON-encoded.
pub(crate) fn observation_event(msg: &MessagePublication) -> ContractEvent {
    let obs = Observation::from(msg);
    let serde_json::Value::Object(fields) = serde_json::to_value(&obs).unwrap() else {
        unreachable!()
    };
    ContractEvent {
        kind: "wasm-Observation".into(),
        attributes: fields
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect(),
    }
}

pub(crate) struct TestHarness {
    pub acct: Arc<Accountant>,
    pub cleared: mpsc::Receiver<MessagePublication>,
    pub db: Arc<MemoryDb>,
    pub reobservations: Arc<RecordingReobservations>,
    pub base_events: mpsc::Sender<ContractEvent>,
    pub ntt_events: mpsc::Sender<ContractEvent>,
}

pub(crate) fn harness(settings: AccountantSettings) -> TestHarness {
    harness_with(
        settings,
        Arc::new(NoopConn),
        Arc::new(NoopConn),
        Arc::new(MemoryDb::default()),
    )
}

pub(crate) fn harness_with_conns(
    settings: AccountantSettings,
    base_conn: MockConn,
    ntt_conn: MockConn,
) -> TestHarness {
    harness_with(
        settings,
        Arc::new(base_conn),
        Arc::new(ntt_conn),
        Arc::new(MemoryDb::default()),
    )
}

/// For crash-and-reload tests: a fresh engine over a surviving store.
pub(crate) fn harness_reusing_db(settings: AccountantSettings, db: Arc<MemoryDb>) -> TestHarness {
    harness_with(settings, Arc::new(NoopConn), Arc::new(NoopConn), db)
}

fn harness_with(
    settings: AccountantSettings,
    base_conn: Arc<dyn ContractConn>,
    ntt_conn: Arc<dyn ContractConn>,
    db: Arc<MemoryDb>,
) -> TestHarness {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let reobservations = Arc::new(RecordingReobservations::default());
    let (base_events, base_rx) = mpsc::channel(16);
    let (ntt_events, ntt_rx) = mpsc::channel(16);
    let (cleared_tx, cleared) = mpsc::channel(16);

    let base = settings.base_contract.is_some().then(|| ContractHandle {
        conn: base_conn,
        events: base_rx,
    });
    let ntt = settings.ntt_contract.is_some().then(|| ContractHandle {
        conn: ntt_conn,
        events: ntt_rx,
    });

    let acct = Accountant::new(
        settings,
        db.clone(),
        Arc::new(FixedGuardianSet(GuardianSet {
            index: 3,
            members: vec![
                GuardianAddress([0x01; 20]),
                GuardianAddress(GUARDIAN_ADDRESS),
            ],
        })),
        Arc::new(TestSigner),
        reobservations.clone(),
        base,
        ntt,
        cleared_tx,
        AccountantMetrics::new(&Registry::new()).unwrap(),
    )
    .unwrap();

    TestHarness {
        acct: Arc::new(acct),
        cleared,
        db,
        reobservations,
        base_events,
        ntt_events,
    }
}
