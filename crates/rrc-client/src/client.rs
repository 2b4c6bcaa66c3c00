//! The RRC client: connection state machine, HELLO handshake, outbound API,
//! and inbound envelope dispatch, generic over any [`MeshTransport`].
//!
//! Grounded on `client.py`'s `Client` class — the connect() backoff
//! algorithm, HELLO-loop retry count, resource expectation bookkeeping, and
//! outbound validation rules are all carried over from there. The
//! worker-thread-callback-to-event-loop bridge that file builds by hand with
//! `threading`/queues is replaced here by `tokio::sync::mpsc` plus a single
//! consumer task, per the bounded-channel idiom the daemon crates use
//! throughout the teacher workspace.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use rrc_mesh::{MeshTransport, ResourceStatus, TransportEvent};
use rrc_protocol::envelope::{self, now_ms};
use rrc_protocol::{sanitize, Body, Envelope, MessageType};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::event::ClientEvent;

/// Where the connection currently stands. Mirrors the phases `connect()`
/// walks through in `client.py`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    PathWait,
    LinkPending,
    Identifying,
    HelloLoop,
    Welcomed,
}

/// A pending out-of-band resource transfer, announced by a RESOURCE_ENVELOPE
/// and awaiting the transport's matching advertisement.
#[derive(Clone, Debug)]
struct ResourceExpectation {
    kind: String,
    size: u64,
    sha256: Option<Vec<u8>>,
    encoding: Option<String>,
    room: Option<String>,
    created_at: Instant,
}

struct Inner<T: MeshTransport> {
    state: ConnectionState,
    link: Option<T::Link>,
    rooms: HashSet<String>,
    expectations: VecDeque<ResourceExpectation>,
    active_resources: HashSet<u64>,
    resource_to_expectation: HashMap<u64, ResourceExpectation>,
}

impl<T: MeshTransport> Inner<T> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            link: None,
            rooms: HashSet::new(),
            expectations: VecDeque::new(),
            active_resources: HashSet::new(),
            resource_to_expectation: HashMap::new(),
        }
    }
}

/// A `tokio::sync::Notify` wrapped with a sticky boolean, so a caller that
/// arrives after the flag was already set doesn't wait forever for a
/// notification that already fired. Replaces `client.py`'s `threading.Event`.
struct WelcomedFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl WelcomedFlag {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The RRC client. Construct with [`Client::new`], hold it behind an `Arc`
/// (required by [`Client::connect`], which spawns tasks that outlive the
/// call), and drive it with [`Client::connect`] / the outbound API / a
/// [`ClientEvent`] receiver wired up by the caller.
pub struct Client<T: MeshTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    hub_hash: Vec<u8>,
    identity: T::Identity,
    self_identity_hash: Vec<u8>,
    nickname: Mutex<Option<String>>,
    inner: Mutex<Inner<T>>,
    welcomed: WelcomedFlag,
    events: mpsc::Sender<ClientEvent>,
}

impl<T: MeshTransport> Client<T> {
    pub fn new(
        transport: Arc<T>,
        config: ClientConfig,
        identity_path: &Path,
        hub_hash: Vec<u8>,
        nickname: Option<String>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<Arc<Self>> {
        let identity = transport.load_or_create_identity(identity_path)?;
        let self_identity_hash = transport.identity_hash(&identity);
        Ok(Arc::new(Self {
            transport,
            config,
            hub_hash,
            identity,
            self_identity_hash,
            nickname: Mutex::new(nickname),
            inner: Mutex::new(Inner::new()),
            welcomed: WelcomedFlag::new(),
            events,
        }))
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn rooms(&self) -> HashSet<String> {
        self.inner.lock().await.rooms.clone()
    }

    pub fn self_identity_hash(&self) -> &[u8] {
        &self.self_identity_hash
    }

    pub async fn set_nickname(&self, nickname: Option<String>) {
        *self.nickname.lock().await = nickname;
    }

    /// Connect to the configured hub: resolve a path, recall its identity,
    /// verify the destination hash matches, establish a link, identify, and
    /// HELLO-loop until WELCOME arrives or `connect_timeout_secs` elapses.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            inner.state = ConnectionState::PathWait;
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.connect_timeout_secs);

        if let Err(err) = self.run_connect(deadline).await {
            self.reset_inner().await;
            self.welcomed.clear();
            return Err(err);
        }
        Ok(())
    }

    async fn run_connect(self: &Arc<Self>, deadline: Instant) -> Result<()> {
        if !self.transport.has_path(&self.hub_hash).await {
            self.transport.request_path(&self.hub_hash).await;
            self.wait_for_path(deadline).await?;
        }

        let hub_identity = self.wait_for_identity(deadline).await?;

        let hub_destination = self
            .transport
            .destination_hash(&hub_identity, &self.config.dest_name);
        if hub_destination != self.hub_hash {
            return Err(ClientError::HubHashMismatch);
        }

        if self.config.cleanup_existing_links
            && self.transport.cleanup_existing_links(&hub_identity).await
        {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.set_state(ConnectionState::LinkPending).await;
        let (tx, rx) = mpsc::channel(64);
        let link = self
            .transport
            .establish_link(hub_identity, tx)
            .await?;
        {
            let mut inner = self.inner.lock().await;
            inner.link = Some(link.clone());
        }

        self.set_state(ConnectionState::Identifying).await;
        self.transport.identify(&link, &self.identity).await?;

        self.set_state(ConnectionState::HelloLoop).await;
        self.welcomed.clear();

        let events_me = Arc::clone(self);
        let events_link = link.clone();
        tokio::spawn(async move { events_me.process_events(events_link, rx).await });

        let hello_me = Arc::clone(self);
        let hello_link = link.clone();
        let hello_task = tokio::spawn(async move { hello_me.hello_loop(hello_link).await });

        let remaining = deadline.saturating_duration_since(Instant::now());
        let welcomed = tokio::time::timeout(remaining, self.welcomed.wait()).await;
        hello_task.abort();

        match welcomed {
            Ok(()) => {
                self.set_state(ConnectionState::Welcomed).await;
                Ok(())
            }
            Err(_) => {
                self.transport.teardown(&link);
                Err(ClientError::NoWelcome(self.config.hello_max_attempts))
            }
        }
    }

    async fn wait_for_path(&self, deadline: Instant) -> Result<()> {
        let mut sleep_ms: u64 = 50;
        loop {
            if self.transport.has_path(&self.hub_hash).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::ConnectTimeout("path"));
            }
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            sleep_ms = ((sleep_ms as f64 * 1.5) as u64).min(500);
        }
    }

    async fn wait_for_identity(&self, deadline: Instant) -> Result<T::Identity> {
        let mut sleep_ms: u64 = 50;
        loop {
            if let Some(identity) = self.transport.recall_identity(&self.hub_hash).await {
                return Ok(identity);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::ConnectTimeout("identity"));
            }
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            sleep_ms = ((sleep_ms as f64 * 1.5) as u64).min(500);
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        self.inner.lock().await.state = state;
    }

    async fn reset_inner(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = ConnectionState::Disconnected;
        inner.link = None;
        inner.rooms.clear();
        inner.expectations.clear();
        inner.active_resources.clear();
        inner.resource_to_expectation.clear();
    }

    async fn current_link(&self) -> Option<T::Link> {
        self.inner.lock().await.link.clone()
    }

    async fn hello_loop(self: Arc<Self>, link: T::Link) {
        for attempt in 0..self.config.hello_max_attempts {
            if self.welcomed.is_set() {
                return;
            }
            {
                let inner = self.inner.lock().await;
                if inner.link.as_ref() != Some(&link) {
                    return;
                }
            }
            if let Err(err) = self.send_hello(&link).await {
                tracing::warn!(attempt, error = %err, "failed to send HELLO");
            }
            tokio::time::sleep(Duration::from_secs(self.config.hello_interval_secs)).await;
        }
    }

    async fn send_hello(&self, link: &T::Link) -> Result<()> {
        let nick = self.nickname.lock().await.clone();
        let body = envelope::hello_body(
            "rrc-client",
            env!("CARGO_PKG_VERSION"),
            vec!["resource_envelope".to_string()],
        );
        let env = envelope::make_envelope(
            MessageType::Hello,
            self.self_identity_hash.clone(),
            None,
            Some(body),
            nick,
            None,
            None,
        );
        self.send_envelope(link, &env).await
    }

    async fn process_events(
        self: Arc<Self>,
        link: T::Link,
        mut rx: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::LinkEstablished => {}
                TransportEvent::LinkClosed => {
                    self.handle_link_closed(&link).await;
                    return;
                }
                TransportEvent::Packet(payload) => {
                    self.handle_packet(&link, payload).await;
                }
                TransportEvent::ResourceAdvertised {
                    token,
                    total_size,
                    responder,
                } => {
                    self.handle_resource_advertised(token, total_size, responder)
                        .await;
                }
                TransportEvent::ResourceConcluded {
                    token,
                    status,
                    data,
                } => {
                    self.handle_resource_concluded(token, status, data).await;
                }
            }
        }
    }

    async fn handle_link_closed(&self, link: &T::Link) {
        {
            let inner = self.inner.lock().await;
            if inner.link.as_ref() != Some(link) {
                return;
            }
        }
        self.reset_inner().await;
        self.welcomed.clear();
        let _ = self.events.send(ClientEvent::Closed).await;
    }

    async fn handle_packet(&self, link: &T::Link, payload: Vec<u8>) {
        let env = match rrc_protocol::codec::decode(&payload) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable envelope");
                return;
            }
        };
        if let Err(err) = env.validate() {
            tracing::warn!(error = %err, "dropping invalid envelope");
            return;
        }

        let skew = now_ms() as i64 - env.timestamp as i64;
        if skew.abs() > rrc_protocol::MAX_TIMESTAMP_SKEW_MS {
            tracing::warn!(skew_ms = skew, "envelope timestamp skew exceeds threshold");
        }

        match env.msg_type {
            MessageType::Welcome => {
                self.welcomed.set();
                let _ = self.events.send(ClientEvent::Welcomed(env)).await;
            }
            MessageType::Joined => {
                if let Some(room) = &env.room {
                    self.inner.lock().await.rooms.insert(room.clone());
                }
                let _ = self.events.send(ClientEvent::Joined(env)).await;
            }
            MessageType::Parted => {
                if let Some(room) = &env.room {
                    self.inner.lock().await.rooms.remove(room);
                }
                let _ = self.events.send(ClientEvent::Parted(env)).await;
            }
            MessageType::Msg => {
                let _ = self.events.send(ClientEvent::Message(env)).await;
            }
            MessageType::Notice => {
                let _ = self.events.send(ClientEvent::Notice(env)).await;
            }
            MessageType::Pong => {
                let _ = self.events.send(ClientEvent::Pong(env)).await;
            }
            MessageType::Ping => {
                let pong = envelope::make_envelope(
                    MessageType::Pong,
                    self.self_identity_hash.clone(),
                    None,
                    env.body.clone(),
                    None,
                    None,
                    None,
                );
                let _ = self.send_envelope(link, &pong).await;
            }
            MessageType::Error => {
                let _ = self.events.send(ClientEvent::HubError(env)).await;
            }
            MessageType::ResourceEnvelope => {
                self.handle_resource_envelope(env).await;
            }
            MessageType::Hello | MessageType::Join | MessageType::Part | MessageType::Unknown(_) => {
                tracing::debug!(
                    msg_type = env.msg_type.code(),
                    "ignoring unexpected inbound message type"
                );
            }
        }
    }

    async fn handle_resource_envelope(&self, env: Envelope) {
        let Some(body) = &env.body else {
            tracing::warn!("RESOURCE_ENVELOPE missing body");
            return;
        };
        let parsed = match envelope::parse_resource_envelope_body(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "malformed RESOURCE_ENVELOPE body");
                return;
            }
        };
        if parsed.size > self.config.max_resource_bytes {
            tracing::warn!(size = parsed.size, "rejecting oversized resource advertisement");
            return;
        }

        let mut inner = self.inner.lock().await;
        self.evict_expired_expectations(&mut inner);

        if inner.expectations.len() >= self.config.max_pending_resource_expectations {
            inner.expectations.pop_front();
        }

        inner.expectations.push_back(ResourceExpectation {
            kind: parsed.kind,
            size: parsed.size,
            sha256: parsed.sha256,
            encoding: parsed.encoding,
            room: env.room.clone(),
            created_at: Instant::now(),
        });
    }

    fn evict_expired_expectations(&self, inner: &mut Inner<T>) {
        let ttl = Duration::from_secs(self.config.resource_expectation_ttl_secs);
        let now = Instant::now();
        inner
            .expectations
            .retain(|expectation| now.duration_since(expectation.created_at) < ttl);
    }

    async fn handle_resource_advertised(
        &self,
        token: u64,
        total_size: u64,
        responder: oneshot::Sender<bool>,
    ) {
        let mut inner = self.inner.lock().await;
        self.evict_expired_expectations(&mut inner);

        if inner.active_resources.len() >= self.config.max_active_resources {
            let _ = responder.send(false);
            return;
        }

        let Some(position) = inner
            .expectations
            .iter()
            .position(|expectation| expectation.size == total_size)
        else {
            let _ = responder.send(false);
            return;
        };
        let expectation = inner
            .expectations
            .remove(position)
            .expect("position came from a successful find");

        inner.active_resources.insert(token);
        inner.resource_to_expectation.insert(token, expectation);
        drop(inner);

        let _ = responder.send(true);
    }

    async fn handle_resource_concluded(&self, token: u64, status: ResourceStatus, data: Vec<u8>) {
        let expectation = {
            let mut inner = self.inner.lock().await;
            inner.active_resources.remove(&token);
            inner.resource_to_expectation.remove(&token)
        };
        let Some(expectation) = expectation else {
            return;
        };
        if status != ResourceStatus::Complete {
            tracing::debug!(kind = %expectation.kind, "resource transfer failed, discarding");
            return;
        }

        if let Some(expected) = &expectation.sha256 {
            let mut hasher = Sha256::new();
            hasher.update(&data);
            let digest = hasher.finalize();
            if digest.as_slice() != expected.as_slice() {
                tracing::warn!(kind = %expectation.kind, "resource sha256 mismatch, discarding");
                return;
            }
        }

        match expectation.kind.as_str() {
            "notice" | "motd" => {
                let encoding = expectation.encoding.as_deref().unwrap_or("utf-8");
                if !encoding.eq_ignore_ascii_case("utf-8") {
                    tracing::warn!(encoding, "unsupported resource encoding, discarding");
                    return;
                }
                match String::from_utf8(data) {
                    Ok(text) => {
                        let room = if expectation.kind == "motd" {
                            None
                        } else {
                            expectation.room
                        };
                        let notice = envelope::make_envelope(
                            MessageType::Notice,
                            self.self_identity_hash.clone(),
                            room,
                            Some(Body::Text(text)),
                            None,
                            None,
                            None,
                        );
                        let _ = self.events.send(ClientEvent::Notice(notice)).await;
                    }
                    Err(_) => tracing::warn!("resource payload is not valid utf-8, discarding"),
                }
            }
            other => {
                tracing::debug!(kind = other, "resource kind reserved or unknown, discarding");
            }
        }
    }

    async fn send_envelope(&self, link: &T::Link, env: &Envelope) -> Result<()> {
        env.validate()?;
        let payload = rrc_protocol::codec::encode(env)?;
        match self.transport.pack(link, &payload) {
            Some(packed) => self
                .transport
                .send(link, &packed)
                .await
                .map_err(ClientError::from),
            None => {
                let warning = match env.msg_type {
                    MessageType::Msg => "message is too large to send over this link",
                    MessageType::Notice => "notice is too large to send over this link",
                    _ => "envelope is too large to send over this link",
                };
                let _ = self
                    .events
                    .send(ClientEvent::Warning(warning.to_string()))
                    .await;
                Err(ClientError::MessageTooLarge)
            }
        }
    }

    pub async fn join(&self, room: &str, key: Option<String>) -> Result<()> {
        let room = sanitize::normalize_room(room).ok_or(ClientError::InvalidRoom)?;
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        let body = key.map(Body::Text);
        let env = envelope::make_envelope(
            MessageType::Join,
            self.self_identity_hash.clone(),
            Some(room),
            body,
            None,
            None,
            None,
        );
        self.send_envelope(&link, &env).await
    }

    pub async fn part(&self, room: &str) -> Result<()> {
        let room = sanitize::normalize_room(room).ok_or(ClientError::InvalidRoom)?;
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        let env = envelope::make_envelope(
            MessageType::Part,
            self.self_identity_hash.clone(),
            Some(room.clone()),
            None,
            None,
            None,
            None,
        );
        self.send_envelope(&link, &env).await?;
        self.inner.lock().await.rooms.remove(&room);
        Ok(())
    }

    pub async fn msg(&self, room: &str, text: &str) -> Result<[u8; 8]> {
        let room = sanitize::normalize_room(room).ok_or(ClientError::InvalidRoom)?;
        let text = sanitize::sanitize_text(text, rrc_protocol::MAX_TEXT_CHARS)
            .ok_or(ClientError::InvalidText)?;
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        let nick = self.nickname.lock().await.clone();
        let env = envelope::make_envelope(
            MessageType::Msg,
            self.self_identity_hash.clone(),
            Some(room),
            Some(Body::Text(text)),
            nick,
            None,
            None,
        );
        let id = env.id;
        self.send_envelope(&link, &env).await?;
        Ok(id)
    }

    pub async fn notice(&self, room: Option<&str>, text: &str) -> Result<()> {
        let room = match room {
            Some(r) => Some(sanitize::normalize_room(r).ok_or(ClientError::InvalidRoom)?),
            None => None,
        };
        let text = sanitize::sanitize_text(text, rrc_protocol::MAX_TEXT_CHARS)
            .ok_or(ClientError::InvalidText)?;
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        let env = envelope::make_envelope(
            MessageType::Notice,
            self.self_identity_hash.clone(),
            room,
            Some(Body::Text(text)),
            None,
            None,
            None,
        );
        self.send_envelope(&link, &env).await
    }

    pub async fn ping(&self) -> Result<()> {
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        let env = envelope::make_envelope(
            MessageType::Ping,
            self.self_identity_hash.clone(),
            None,
            None,
            None,
            None,
            None,
        );
        self.send_envelope(&link, &env).await
    }

    pub async fn close(&self) {
        let link = {
            let mut inner = self.inner.lock().await;
            inner.link.take()
        };
        if let Some(link) = &link {
            self.transport.cancel_active_resources(link);
            self.transport.teardown(link);
        }
        self.reset_inner().await;
        self.welcomed.clear();
    }
}
