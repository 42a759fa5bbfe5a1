//! In-process network of control planes for integration tests.
//!
//! Every [`TestNode`] owns a [`TestNetwork`] transport that routes RPCs to
//! the inbound handlers of the addressed peer. Failures and latency can be
//! injected per destination; store RPCs are recorded.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::sleep;

use dht_control::{
    ChainDiversifier, Contact, ControlConfig, DhtControl, FindNodeReply, FindValueReply,
    MemoryRouter, MemoryStorage, NodeId, OperationListener, Router, StoreReply, StoredValue,
    Transport,
};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, DhtControl>>,
}

impl NetworkRegistry {
    pub async fn register(&self, control: &DhtControl) {
        self.peers
            .write()
            .await
            .insert(control.local_contact().id, control.clone());
    }

    pub async fn get(&self, id: &NodeId) -> Option<DhtControl> {
        self.peers.read().await.get(id).cloned()
    }
}

#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    failing_stores: Arc<AtomicBool>,
    stores: Arc<Mutex<Vec<(NodeId, Vec<NodeId>)>>>,
    sleeping: Arc<AtomicBool>,
}

impl TestNetwork {
    fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            failing_stores: Arc::new(AtomicBool::new(false)),
            stores: Arc::new(Mutex::new(Vec::new())),
            sleeping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_latency(&self, node: &NodeId, latency: Duration) {
        self.latencies.lock().insert(node.clone(), latency);
    }

    pub fn set_failure(&self, node: &NodeId, fail: bool) {
        let mut failures = self.failures.lock();
        if fail {
            failures.insert(node.clone());
        } else {
            failures.remove(node);
        }
    }

    /// Makes every store RPC fail while lookups keep working.
    pub fn set_store_failure(&self, fail: bool) {
        self.failing_stores.store(fail, Ordering::SeqCst);
    }

    /// `(destination, keys)` of every store RPC sent so far.
    pub fn store_calls(&self) -> Vec<(NodeId, Vec<NodeId>)> {
        self.stores.lock().clone()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    fn should_fail(&self, node: &NodeId) -> bool {
        self.failures.lock().contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let delay = self.latencies.lock().get(node).copied();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }

    /// Our contact as `to` sees it, carrying the tokens `to` issued us.
    fn presenting(&self, to: &Contact) -> Contact {
        let mut from = self.self_contact.clone();
        from.address_token = to.address_token;
        from.id_token = to.id_token;
        from
    }
}

#[async_trait]
impl Transport for TestNetwork {
    async fn find_node(&self, to: &Contact, id: &NodeId, _flags: u16) -> anyhow::Result<FindNodeReply> {
        if self.should_fail(&to.id) {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        match self.registry.get(&to.id).await {
            Some(peer) => Ok(peer.handle_find_node(&self.presenting(to), id)),
            None => Err(anyhow!("peer not reachable")),
        }
    }

    fn find_value(
        &self,
        to: &Contact,
        key: &NodeId,
        max_values: usize,
        flags: u16,
    ) -> BoxStream<'static, anyhow::Result<FindValueReply>> {
        let network = self.clone();
        let to = to.clone();
        let key = key.clone();
        stream::once(async move {
            if network.should_fail(&to.id) {
                return Err(anyhow!("injected network failure"));
            }
            network.maybe_sleep(&to.id).await;
            match network.registry.get(&to.id).await {
                Some(peer) => Ok(peer.handle_find_value(&network.presenting(&to), &key, max_values, flags)),
                None => Err(anyhow!("peer not reachable")),
            }
        })
        .boxed()
    }

    async fn store(
        &self,
        to: &Contact,
        keys: &[NodeId],
        value_sets: &[Vec<StoredValue>],
        _immediate: bool,
    ) -> anyhow::Result<StoreReply> {
        if self.should_fail(&to.id) || self.failing_stores.load(Ordering::SeqCst) {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        self.stores.lock().push((to.id.clone(), keys.to_vec()));
        match self.registry.get(&to.id).await {
            Some(peer) => Ok(peer.handle_store(&self.presenting(to), keys, value_sets)),
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn ping(&self, to: &Contact) -> anyhow::Result<()> {
        if self.should_fail(&to.id) {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        match self.registry.get(&to.id).await {
            Some(peer) => {
                peer.handle_ping(&self.presenting(to));
                Ok(())
            }
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn key_block(&self, to: &Contact, request: &[u8], signature: &[u8]) -> anyhow::Result<()> {
        if self.should_fail(&to.id) {
            return Err(anyhow!("injected network failure"));
        }
        match self.registry.get(&to.id).await {
            Some(peer) => {
                peer.handle_key_block(&self.presenting(to), request, signature);
                Ok(())
            }
            None => Err(anyhow!("peer not reachable")),
        }
    }

    fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::SeqCst);
    }
}

pub struct TestNode {
    pub control: DhtControl,
    pub network: TestNetwork,
    pub router: Arc<MemoryRouter>,
    pub storage: Arc<MemoryStorage>,
    pub diversifier: Arc<ChainDiversifier>,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32) -> Self {
        Self::with_storage(registry, index, |storage| storage).await
    }

    pub async fn with_storage(
        registry: Arc<NetworkRegistry>,
        index: u32,
        configure: impl FnOnce(MemoryStorage) -> MemoryStorage,
    ) -> Self {
        init_tracing();
        let contact = make_contact(index);
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let router = Arc::new(MemoryRouter::new(contact.clone(), test_config().k));
        let storage = Arc::new(configure(MemoryStorage::new(contact.id.clone())));
        let diversifier = Arc::new(ChainDiversifier::new());
        let control = DhtControl::new(
            test_config(),
            router.clone(),
            Arc::new(network.clone()),
            storage.clone(),
            diversifier.clone(),
        )
        .expect("valid test config");
        registry.register(&control).await;
        Self {
            control,
            network,
            router,
            storage,
            diversifier,
        }
    }

    pub fn contact(&self) -> Contact {
        self.control.local_contact()
    }

    pub fn id(&self) -> NodeId {
        self.contact().id
    }
}

pub fn test_config() -> ControlConfig {
    ControlConfig {
        k: 8,
        search_concurrency: 3,
        integration_wait_ms: 100,
        enable_random_poking: false,
        ..ControlConfig::default()
    }
}

pub fn make_identity(index: u32) -> NodeId {
    let mut id = vec![0u8; 20];
    id[..4].copy_from_slice(&index.to_be_bytes());
    NodeId::from_bytes(id)
}

pub fn make_contact(index: u32) -> Contact {
    let [_, _, hi, lo] = index.to_be_bytes();
    Contact::new(
        make_identity(index),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, hi, lo)), 4000),
    )
}

/// Builds `count` nodes numbered from 1 that all know each other as alive.
pub async fn mesh(registry: &Arc<NetworkRegistry>, count: u32) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for index in 1..=count {
        nodes.push(TestNode::new(registry.clone(), index).await);
    }
    connect_all(&nodes);
    nodes
}

pub fn connect_all(nodes: &[TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id() != b.id() {
                a.router.contact_alive(&b.contact());
            }
        }
    }
}

/// Records what an operation reported.
#[derive(Default)]
pub struct RecordingListener {
    pub found: Mutex<Vec<(Contact, bool)>>,
    pub read: Mutex<Vec<StoredValue>>,
    pub wrote: Mutex<Vec<NodeId>>,
    pub diversified: Mutex<Vec<String>>,
    pub completions: AtomicUsize,
    pub timed_out: AtomicBool,
    /// Answer given to `diversified`.
    pub follow_diversifications: bool,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            follow_diversifications: true,
            ..Self::default()
        })
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

impl OperationListener for RecordingListener {
    fn found(&self, contact: &Contact, is_closest: bool) {
        self.found.lock().push((contact.clone(), is_closest));
    }

    fn read(&self, _contact: &Contact, value: &StoredValue) {
        self.read.lock().push(value.clone());
    }

    fn wrote(&self, contact: &Contact, _value: &StoredValue) {
        self.wrote.lock().push(contact.id.clone());
    }

    fn diversified(&self, description: &str) -> bool {
        self.diversified.lock().push(description.to_string());
        self.follow_diversifications
    }

    fn complete(&self, timed_out: bool) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        if timed_out {
            self.timed_out.store(true, Ordering::SeqCst);
        }
    }
}
