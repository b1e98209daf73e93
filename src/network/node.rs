// Network node: peer cohort, two-queue pipeline, periodic workers

use crate::config::NodeConfig;
use crate::core::{Block, Hash256, Inventory, Network, Transaction, SIGHASH_ALL};
use crate::error::{NetworkError, Result, StoreError};
use crate::network::message::{Message, PeerAddress};
use crate::network::peer::{unix_time, Peer, PeerInfo, PeerState};
use crate::script::{Interpreter, InterpreterFlags, Script};
use crate::store::{BlockResult, ChainStore, TxResult};
use rand::seq::SliceRandom;
use rand::Rng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message as SecpMessage, PublicKey, Secp256k1};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// Addresses expire from the pool after three hours.
const ADDR_TTL: u64 = 3 * 60 * 60;

/// Outbound connection attempts per connect-worker round.
const CONNECT_BATCH: usize = 32;

/// Entries dropped from the inventory LRU when it fills up.
const INV_CACHE_EVICT: usize = 128;

/// Most headers served per getheaders request.
const MAX_HEADERS: usize = 2_000;

/// Time allowed for draining the object queue at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Events published on the notification channel. Objects are referred to
/// by hash; subscribers fetch bodies from the store if they need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Block { hash: Hash256, height: u32 },
    Tx { hash: Hash256 },
}

enum Command {
    SubmitTx(Transaction),
    Shutdown,
}

type PeerId = u64;

enum PeerEvent {
    Ready {
        id: PeerId,
        info: PeerInfo,
        outbox: mpsc::Sender<Message>,
    },
    Message {
        id: PeerId,
        message: Message,
    },
    Closed {
        id: PeerId,
    },
    Failed {
        id: PeerId,
        addr: SocketAddr,
    },
    Discovered(Vec<PeerAddress>),
}

struct PeerHandle {
    info: PeerInfo,
    /// Connected is the only state that takes part in inventory and
    /// block requests; Closing is terminal.
    state: PeerState,
    outbox: mpsc::Sender<Message>,
}

impl PeerHandle {
    fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }
}

/// Fully decoded object waiting to be applied to the store.
enum NetObject {
    Block(Block),
    Tx(Transaction),
}

/// Recent-inventory LRU. When full, the oldest entries are evicted in
/// batches of [`INV_CACHE_EVICT`].
struct InvCache {
    set: HashSet<Inventory>,
    order: VecDeque<Inventory>,
    cap: usize,
}

impl InvCache {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, inv: &Inventory) -> bool {
        self.set.contains(inv)
    }

    /// Returns false when the item was already present.
    fn insert(&mut self, inv: Inventory) -> bool {
        if !self.set.insert(inv) {
            return false;
        }
        self.order.push_back(inv);
        if self.order.len() > self.cap {
            for _ in 0..INV_CACHE_EVICT {
                match self.order.pop_front() {
                    Some(old) => {
                        self.set.remove(&old);
                    }
                    None => break,
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Known peer addresses, capped and weighted toward recently seen peers.
struct AddrPool {
    addrs: Vec<PeerAddress>,
    cap: usize,
}

impl AddrPool {
    fn new(cap: usize) -> Self {
        Self {
            addrs: Vec::new(),
            cap,
        }
    }

    fn len(&self) -> usize {
        self.addrs.len()
    }

    fn is_full(&self) -> bool {
        self.addrs.len() >= self.cap
    }

    fn add(&mut self, addr: PeerAddress) {
        if let Some(known) = self
            .addrs
            .iter_mut()
            .find(|a| a.ip == addr.ip && a.port == addr.port)
        {
            known.time = known.time.max(addr.time);
            return;
        }
        if self.addrs.len() < self.cap {
            self.addrs.push(addr);
        }
    }

    fn purge_expired(&mut self, now: u64) {
        let cutoff = now.saturating_sub(ADDR_TTL);
        self.addrs.retain(|a| a.time as u64 >= cutoff);
    }

    /// Sample up to `n` distinct addresses, weighted by recency.
    fn sample(&self, n: usize, now: u64) -> Vec<PeerAddress> {
        let mut rng = rand::thread_rng();
        let mut remaining: Vec<&PeerAddress> = self.addrs.iter().collect();
        let mut picked = Vec::new();

        while picked.len() < n && !remaining.is_empty() {
            let idx = weighted_index(&mut rng, &remaining, now);
            picked.push(*remaining.swap_remove(idx));
        }
        picked
    }

    fn snapshot(&self) -> Vec<PeerAddress> {
        self.addrs.clone()
    }
}

/// Pick an index with probability proportional to address freshness.
fn weighted_index<R: Rng>(rng: &mut R, addrs: &[&PeerAddress], now: u64) -> usize {
    let weight = |a: &PeerAddress| -> u64 { ADDR_TTL.saturating_sub(now.saturating_sub(a.time as u64)).max(1) };
    let total: u64 = addrs.iter().map(|a| weight(a)).sum();
    let mut target = rng.gen_range(0..total);
    for (i, addr) in addrs.iter().enumerate() {
        let w = weight(addr);
        if target < w {
            return i;
        }
        target -= w;
    }
    addrs.len() - 1
}

/// State owned by the run loop. All cohort and queue mutations happen
/// there, one event at a time.
struct State {
    peers: HashMap<PeerId, PeerHandle>,
    /// Dial/handshake in progress
    pending: HashSet<PeerId>,
    addrs: AddrPool,
    inv_queue: VecDeque<(Inventory, PeerId)>,
    queue: VecDeque<NetObject>,
    inv_cache: InvCache,
    /// getdata requests issued whose objects have not arrived yet; the
    /// inventory worker is gated on queue.len() + in_flight.
    in_flight: usize,
}

/// P2P node keeping the store converging toward the network's best
/// chain.
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn ChainStore>,
    nonce: u64,
    commands: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    notifications: broadcast::Sender<NodeEvent>,
    next_peer_id: AtomicU64,
}

impl Node {
    pub fn new(config: NodeConfig, store: Arc<dyn ChainStore>) -> Self {
        let (commands, command_rx) = mpsc::channel(64);
        let (notifications, _) = broadcast::channel(1024);
        Self {
            config,
            store,
            nonce: rand::random(),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            notifications,
            next_peer_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    /// Subscribe to block/tx notifications. Every subscriber sees every
    /// event in order; a slow subscriber loses the oldest events rather
    /// than blocking the node.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.notifications.subscribe()
    }

    /// Store a local transaction and relay it to a majority of connected
    /// peers.
    pub async fn submit_tx(&self, tx: Transaction) -> Result<()> {
        self.commands
            .send(Command::SubmitTx(tx))
            .await
            .map_err(|_| NetworkError::Closed)?;
        Ok(())
    }

    /// Stop accepting work, drain the object queue with a deadline, and
    /// close peers.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    fn next_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeout)
    }

    /// Drive the node until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut commands = self
            .command_rx
            .lock()
            .map_err(|_| crate::error::Error::Config("command receiver poisoned".into()))?
            .take()
            .ok_or_else(|| crate::error::Error::Config("node already running".into()))?;

        let (events_tx, mut events) = mpsc::channel::<PeerEvent>(1024);

        let mut state = State {
            peers: HashMap::new(),
            pending: HashSet::new(),
            addrs: AddrPool::new(self.config.max.addr),
            inv_queue: VecDeque::new(),
            queue: VecDeque::new(),
            inv_cache: InvCache::new(self.config.max.inv_cache),
            in_flight: 0,
        };

        if let Some((host, port)) = &self.config.listen {
            self.spawn_listener(host.clone(), *port, events_tx.clone())
                .await?;
        }
        for target in &self.config.connect {
            self.spawn_dial_named(target.clone(), events_tx.clone(), &mut state);
        }

        let mut queue_tick = tokio::time::interval(Duration::from_secs_f64(self.config.intervals.queue));
        let mut inv_tick =
            tokio::time::interval(Duration::from_secs_f64(self.config.intervals.inv_queue));
        let mut addrs_tick =
            tokio::time::interval(Duration::from_secs_f64(self.config.intervals.addrs));
        let mut connect_tick =
            tokio::time::interval(Duration::from_secs_f64(self.config.intervals.connect));

        log::info!(
            "node starting: network {:?}, listen {:?}, {} static peers",
            self.config.network,
            self.config.listen,
            self.config.connect.len()
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SubmitTx(tx)) => self.relay_tx(&mut state, tx).await,
                    Some(Command::Shutdown) | None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_peer_event(&mut state, event, &events_tx).await,
                    None => break,
                },
                _ = queue_tick.tick() => self.drain_object_queue(&mut state).await,
                _ = inv_tick.tick() => {
                    self.drain_inv_queue(&mut state);
                    self.request_blocks_if_idle(&mut state);
                },
                _ = addrs_tick.tick() => self.addrs_worker(&mut state),
                _ = connect_tick.tick() => self.connect_worker(&mut state, &events_tx),
            }
        }

        // drain what already arrived, then close peers by dropping their
        // outboxes
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while !state.queue.is_empty() && Instant::now() < deadline {
            self.drain_object_queue(&mut state).await;
        }
        state.peers.clear();
        log::info!("node stopped");
        Ok(())
    }

    async fn spawn_listener(
        &self,
        host: String,
        port: u16,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<()> {
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| NetworkError::Connect(e.to_string()))?;
        log::info!("listening on {}:{}", host, port);

        let network = self.config.network;
        let nonce = self.nonce;
        let store = self.store.clone();
        let timeout = self.timeout();

        tokio::spawn(async move {
            // inbound ids live in their own range, clear of outbound dials
            let mut next_id: PeerId = 1 << 32;
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                log::debug!("inbound connection from {}", addr);

                let peer = Peer::inbound(stream, addr, network);
                let id = next_id;
                next_id += 1;
                let height = store.height().unwrap_or(0);
                tokio::spawn(run_peer(peer, id, nonce, height, timeout, events.clone()));
            }
        });
        Ok(())
    }

    /// Dial a host:port string, resolving names if needed.
    fn spawn_dial_named(
        &self,
        target: String,
        events: mpsc::Sender<PeerEvent>,
        state: &mut State,
    ) {
        let id = self.next_id();
        state.pending.insert(id);

        let network = self.config.network;
        let nonce = self.nonce;
        let height = self.store.height().unwrap_or(0);
        let timeout = self.timeout();

        tokio::spawn(async move {
            let addr = match tokio::net::lookup_host(target.as_str()).await {
                Ok(mut addrs) => addrs.next(),
                Err(_) => None,
            };
            let Some(addr) = addr else {
                log::warn!("could not resolve peer '{}'", target);
                let _ = events
                    .send(PeerEvent::Failed {
                        id,
                        addr: "0.0.0.0:0".parse().expect("static addr"),
                    })
                    .await;
                return;
            };
            dial(addr, id, network, nonce, height, timeout, events).await;
        });
    }

    fn spawn_dial(&self, addr: SocketAddr, events: mpsc::Sender<PeerEvent>, state: &mut State) {
        let id = self.next_id();
        state.pending.insert(id);

        let network = self.config.network;
        let nonce = self.nonce;
        let height = self.store.height().unwrap_or(0);
        let timeout = self.timeout();
        tokio::spawn(dial(addr, id, network, nonce, height, timeout, events));
    }

    async fn handle_peer_event(
        &self,
        state: &mut State,
        event: PeerEvent,
        events_tx: &mpsc::Sender<PeerEvent>,
    ) {
        match event {
            PeerEvent::Ready { id, info, outbox } => {
                state.pending.remove(&id);
                if state.peers.len() >= self.config.max.connections {
                    log::debug!("cohort full, dropping {}", info.addr);
                    return;
                }
                log::info!(
                    "peer {} connected ({}, height {})",
                    info.addr,
                    info.user_agent,
                    info.start_height
                );
                if info.outbound {
                    state.addrs.add(PeerAddress::new(
                        info.addr.ip(),
                        info.addr.port(),
                        unix_time() as u32,
                    ));
                }
                state.peers.insert(
                    id,
                    PeerHandle {
                        info,
                        state: PeerState::Connected,
                        outbox,
                    },
                );
            }
            PeerEvent::Message { id, message } => {
                if let Some(handle) = state.peers.get_mut(&id) {
                    handle.info.last_seen = unix_time();
                }
                self.handle_message(state, id, message).await;
            }
            PeerEvent::Closed { id } => {
                state.pending.remove(&id);
                // terminal transition, then removal from the cohort
                if let Some(handle) = state.peers.get_mut(&id) {
                    handle.state = PeerState::Closing;
                }
                if let Some(handle) = state.peers.remove(&id) {
                    log::info!("peer {} disconnected", handle.info.addr);
                }
            }
            PeerEvent::Failed { id, addr } => {
                state.pending.remove(&id);
                log::debug!("connection to {} failed", addr);
            }
            PeerEvent::Discovered(addrs) => {
                for addr in addrs {
                    state.addrs.add(addr);
                }
            }
        }
    }

    async fn handle_message(&self, state: &mut State, id: PeerId, message: Message) {
        match message {
            Message::Inv(items) => {
                for inv in items {
                    if state.inv_cache.insert(inv) {
                        state.inv_queue.push_back((inv, id));
                    }
                }
            }
            Message::GetData(items) => {
                for inv in items {
                    let response = match inv.kind {
                        crate::core::InvKind::Block => self
                            .store
                            .get_block(&inv.hash)
                            .unwrap_or(None)
                            .map(Message::Block),
                        crate::core::InvKind::Tx => self
                            .store
                            .get_tx(&inv.hash)
                            .unwrap_or(None)
                            .map(Message::Tx),
                    };
                    match response {
                        Some(message) => self.send_to(state, id, message),
                        None => log::debug!("getdata for unknown {}", inv.hash),
                    }
                }
            }
            Message::GetBlocks { locator, .. } => {
                let hashes = self
                    .store
                    .blocks_after(&locator, self.config.max.inv)
                    .unwrap_or_default();
                if !hashes.is_empty() {
                    let items = hashes.into_iter().map(Inventory::block).collect();
                    self.send_to(state, id, Message::Inv(items));
                }
            }
            Message::GetHeaders { locator, .. } => {
                let hashes = self
                    .store
                    .blocks_after(&locator, MAX_HEADERS)
                    .unwrap_or_default();
                let mut headers = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    if let Ok(Some(block)) = self.store.get_block(&hash) {
                        headers.push(block.header);
                    }
                }
                self.send_to(state, id, Message::Headers(headers));
            }
            Message::Headers(headers) => {
                // headers answer a getheaders request, which is not
                // in_flight-tracked (only getdata is)
                for header in headers {
                    state.queue.push_back(NetObject::Block(Block::new(header, Vec::new())));
                }
            }
            Message::Block(block) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                state.queue.push_back(NetObject::Block(block));
            }
            Message::Tx(tx) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                state.queue.push_back(NetObject::Tx(tx));
            }
            Message::Addr(addrs) => {
                for addr in addrs {
                    state.addrs.add(addr);
                }
            }
            Message::GetAddr => {
                let addrs = state.addrs.snapshot();
                if !addrs.is_empty() {
                    self.send_to(state, id, Message::Addr(addrs));
                }
            }
            Message::Ping(nonce) => self.send_to(state, id, Message::Pong(nonce)),
            Message::Pong(_) => {}
            Message::Version(_) | Message::Verack => {
                log::debug!("stray handshake message from peer {}", id);
            }
        }
    }

    fn send_to(&self, state: &State, id: PeerId, message: Message) {
        if let Some(handle) = state.peers.get(&id).filter(|h| h.is_connected()) {
            if handle.outbox.try_send(message).is_err() {
                log::debug!("peer {} outbox full, dropping message", handle.info.addr);
            }
        }
    }

    /// Inventory worker: issue getdata for queued announcements, gated by
    /// the object queue so downloads never outrun store application.
    fn drain_inv_queue(&self, state: &mut State) {
        while !state.inv_queue.is_empty() {
            if state.queue.len() + state.in_flight >= self.config.max.queue {
                break; // backpressure
            }
            let Some((inv, announcer)) = state.inv_queue.pop_front() else {
                break;
            };
            if self.store.has(&inv).unwrap_or(false) {
                continue;
            }

            // prefer the announcing peer, fall back to any connected one
            let announcer_connected = state
                .peers
                .get(&announcer)
                .map(|h| h.is_connected())
                .unwrap_or(false);
            let target = if announcer_connected {
                Some(announcer)
            } else {
                random_peer(state)
            };
            let Some(target) = target else {
                state.inv_queue.push_front((inv, announcer));
                break;
            };

            let handle = &state.peers[&target];
            match handle.outbox.try_send(Message::GetData(vec![inv])) {
                Ok(()) => state.in_flight += 1,
                Err(_) => {
                    state.inv_queue.push_front((inv, announcer));
                    break;
                }
            }
        }
    }

    /// Block-download worker: when both queues are idle, ask a random
    /// peer for what comes after our best chain.
    fn request_blocks_if_idle(&self, state: &mut State) {
        if !state.inv_queue.is_empty() || !state.queue.is_empty() || state.in_flight > 0 {
            return;
        }
        let Some(id) = random_peer(state) else {
            return;
        };

        let locator = self.locator();
        let message = if self.config.headers_only {
            Message::GetHeaders {
                locator,
                stop: Hash256::zero(),
            }
        } else {
            Message::GetBlocks {
                locator,
                stop: Hash256::zero(),
            }
        };
        log::debug!("requesting blocks from peer {}", id);
        self.send_to(state, id, message);
    }

    /// Exponentially thinning block locator for getblocks/getheaders.
    fn locator(&self) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let top = match self.store.height() {
            Ok(h) => h,
            Err(_) => return hashes,
        };
        if self.store.block_at_height(0).unwrap_or(None).is_none() {
            return hashes; // empty store
        }

        let mut step = 1u32;
        let mut height = top as i64;
        while height > 0 {
            if let Ok(Some(block)) = self.store.block_at_height(height as u32) {
                hashes.push(block.hash());
            }
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height -= step as i64;
        }
        if let Ok(Some(genesis)) = self.store.block_at_height(0) {
            hashes.push(genesis.hash());
        }
        hashes
    }

    /// Object worker: apply queued blocks and transactions one at a time,
    /// on the blocking pool, and publish notifications.
    async fn drain_object_queue(&self, state: &mut State) {
        while let Some(object) = state.queue.pop_front() {
            match object {
                NetObject::Block(block) => {
                    let hash = block.hash();
                    let store = self.store.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        if !verify_block_scripts(&*store, &block) {
                            return Ok(BlockResult::Invalid);
                        }
                        store.store_block(block)
                    })
                    .await;

                    match flatten(result) {
                        Ok(BlockResult::New(height)) => {
                            log::info!("stored block {} at height {}", hash, height);
                            let _ = self.notifications.send(NodeEvent::Block { hash, height });
                        }
                        Ok(BlockResult::Orphan) => {
                            log::debug!("orphan block {}", hash);
                        }
                        Ok(BlockResult::Existing) => {}
                        Ok(BlockResult::Invalid) => {
                            log::warn!("invalid block {}", hash);
                        }
                        Err(e) => log::error!("store error for block {}: {}", hash, e),
                    }
                }
                NetObject::Tx(tx) => {
                    let hash = tx.hash();
                    let store = self.store.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        if !verify_tx_scripts(&*store, &tx) {
                            return Ok(None);
                        }
                        store.store_tx(tx).map(Some)
                    })
                    .await;

                    match flatten(result) {
                        Ok(Some(TxResult::New)) => {
                            log::debug!("stored tx {}", hash);
                            let _ = self.notifications.send(NodeEvent::Tx { hash });
                        }
                        Ok(Some(TxResult::Existing)) => {}
                        Ok(None) => log::warn!("tx {} failed script verification", hash),
                        Err(e) => log::error!("store error for tx {}: {}", hash, e),
                    }
                }
            }
        }
    }

    /// Address worker: purge stale entries when the pool is full,
    /// otherwise ask a random peer for more addresses.
    fn addrs_worker(&self, state: &mut State) {
        if state.addrs.is_full() {
            state.addrs.purge_expired(unix_time());
            return;
        }
        if let Some(id) = random_peer(state) {
            self.send_to(state, id, Message::GetAddr);
        }
    }

    /// Connect worker: keep the cohort at max.connections, seeding from
    /// DNS when the address pool has nothing to offer.
    fn connect_worker(&self, state: &mut State, events: &mpsc::Sender<PeerEvent>) {
        let current = state.peers.len() + state.pending.len();
        if current >= self.config.max.connections {
            return;
        }
        let wanted = (self.config.max.connections - current).min(CONNECT_BATCH);

        let connected: HashSet<SocketAddr> = state
            .peers
            .values()
            .filter(|h| h.is_connected())
            .map(|h| h.info.addr)
            .collect();
        let candidates: Vec<PeerAddress> = state
            .addrs
            .sample(wanted, unix_time())
            .into_iter()
            .filter(|a| !connected.contains(&a.socket_addr()))
            .collect();

        if candidates.is_empty() {
            if self.config.dns {
                self.seed_from_dns(events.clone());
            }
            return;
        }

        for candidate in candidates {
            log::debug!("dialing {}", candidate.socket_addr());
            self.spawn_dial(candidate.socket_addr(), events.clone(), state);
        }
    }

    fn seed_from_dns(&self, events: mpsc::Sender<PeerEvent>) {
        let seeds = self.config.network.dns_seeds();
        if seeds.is_empty() {
            return;
        }
        let port = self.config.network.default_port();
        tokio::spawn(async move {
            let mut found = Vec::new();
            for seed in seeds {
                match tokio::net::lookup_host((*seed, port)).await {
                    Ok(addrs) => {
                        let now = unix_time() as u32;
                        found.extend(addrs.map(|a| PeerAddress::new(a.ip(), a.port(), now)));
                    }
                    Err(e) => log::debug!("dns seed {} failed: {}", seed, e),
                }
            }
            if !found.is_empty() {
                log::info!("dns seeding found {} addresses", found.len());
                let _ = events.send(PeerEvent::Discovered(found)).await;
            }
        });
    }

    /// Store a local transaction and announce it to a random majority of
    /// connected peers.
    async fn relay_tx(&self, state: &mut State, tx: Transaction) {
        let hash = tx.hash();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.store_tx(tx)).await;
        match flatten(result) {
            Ok(TxResult::New) => {
                let _ = self.notifications.send(NodeEvent::Tx { hash });
            }
            Ok(TxResult::Existing) => {}
            Err(e) => {
                log::error!("could not store local tx {}: {}", hash, e);
                return;
            }
        }

        let ids: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, handle)| handle.is_connected())
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            log::warn!("no peers to relay tx {}", hash);
            return;
        }
        let majority = ids.len() / 2 + 1;
        let mut rng = rand::thread_rng();
        for id in ids.choose_multiple(&mut rng, majority) {
            self.send_to(state, *id, Message::Inv(vec![Inventory::tx(hash)]));
        }
        log::debug!("relayed tx {} to {} peers", hash, majority);
    }
}

fn flatten<T>(
    result: std::result::Result<std::result::Result<T, StoreError>, tokio::task::JoinError>,
) -> std::result::Result<T, StoreError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(StoreError::Backend(format!("worker died: {}", e))),
    }
}

fn random_peer(state: &State) -> Option<PeerId> {
    let ids: Vec<PeerId> = state
        .peers
        .iter()
        .filter(|(_, handle)| handle.is_connected())
        .map(|(id, _)| *id)
        .collect();
    ids.choose(&mut rand::thread_rng()).copied()
}

async fn dial(
    addr: SocketAddr,
    id: PeerId,
    network: Network,
    nonce: u64,
    height: u32,
    timeout: Duration,
    events: mpsc::Sender<PeerEvent>,
) {
    match Peer::connect(addr, network, timeout).await {
        Ok(peer) => run_peer(peer, id, nonce, height, timeout, events).await,
        Err(e) => {
            log::debug!("dial {} failed: {}", addr, e);
            let _ = events.send(PeerEvent::Failed { id, addr }).await;
        }
    }
}

/// Per-connection task: handshake with a deadline, then pump messages
/// between the socket and the run loop until either side closes.
async fn run_peer(
    mut peer: Peer,
    id: PeerId,
    nonce: u64,
    height: u32,
    timeout: Duration,
    events: mpsc::Sender<PeerEvent>,
) {
    let addr = peer.addr();
    match tokio::time::timeout(timeout, peer.handshake(nonce, height)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::debug!("handshake with {} failed: {}", addr, e);
            let _ = events.send(PeerEvent::Failed { id, addr }).await;
            return;
        }
        Err(_) => {
            log::debug!("handshake with {} timed out", addr);
            let _ = events.send(PeerEvent::Failed { id, addr }).await;
            return;
        }
    }

    let (mut reader, mut writer, info) = peer.into_split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            if writer.send(&message).await.is_err() {
                break;
            }
        }
    });

    if events
        .send(PeerEvent::Ready {
            id,
            info,
            outbox: outbox_tx,
        })
        .await
        .is_err()
    {
        writer_task.abort();
        return;
    }

    loop {
        match reader.receive().await {
            Ok(Some(message)) => {
                if events.send(PeerEvent::Message { id, message }).await.is_err() {
                    break;
                }
            }
            Ok(None) => continue,
            Err(e) => {
                log::debug!("peer {} read error: {}", addr, e);
                break;
            }
        }
    }

    let _ = events.send(PeerEvent::Closed { id }).await;
    writer_task.abort();
}

/// Run the script engine over every input whose funding output is known.
/// Unknown previous outputs cannot be checked and are let through; a
/// known output with a failing script rejects the transaction.
fn verify_tx_scripts(store: &dyn ChainStore, tx: &Transaction) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    for (index, input) in tx.inputs.iter().enumerate() {
        let Ok(Some(prev)) = store.get_tx(&input.prev_tx_hash) else {
            continue;
        };
        let Some(prev_out) = prev.outputs.get(input.prev_index as usize) else {
            log::warn!("tx {} spends missing output index", tx.hash());
            return false;
        };

        let Ok(script_sig) = Script::decode(&input.script_sig) else {
            return false;
        };
        let Ok(pk_script) = Script::decode(&prev_out.pk_script) else {
            return false;
        };

        let digest = tx.signature_hash(index, &prev_out.pk_script, SIGHASH_ALL);
        let checker = move |pubkey: &[u8], sig: &[u8], _hash_type: u8| {
            let secp = Secp256k1::verification_only();
            let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
                return false;
            };
            let Ok(sig) = Signature::from_der(sig) else {
                return false;
            };
            let Ok(msg) = SecpMessage::from_digest_slice(digest.as_bytes()) else {
                return false;
            };
            secp.verify_ecdsa(&msg, &sig, &pubkey).is_ok()
        };

        if !Interpreter::verify(&script_sig, &pk_script, &checker, InterpreterFlags::default()) {
            return false;
        }
    }
    true
}

fn verify_block_scripts(store: &dyn ChainStore, block: &Block) -> bool {
    block
        .transactions
        .iter()
        .all(|tx| verify_tx_scripts(store, tx))
}
