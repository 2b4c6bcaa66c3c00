//! The abstract mesh-transport surface the RRC client is generic over.
//!
//! `spec.md` treats the underlying mesh network (identities, links, packets,
//! resource streams, path discovery, announce delivery) as an external
//! library and names only the interface the core requires from it. This
//! crate turns that prose interface into a Rust trait, following the same
//! pattern the teacher workspace uses for its own bootstrap transport
//! abstraction: a generic trait with native `async fn`-shaped methods
//! (return-position `impl Future`), no `async-trait` macro, so callers can
//! supply any concrete transport without boxing every call.
//!
//! Events that the Python original delivered via callbacks registered on a
//! link (`on_established`, packet callback, resource callbacks) are
//! delivered here over a channel instead — the thread-safe hop from a
//! transport worker thread onto the consumer's task, which is exactly the
//! "bounded channel + single consumer task" shape recommended for bridging
//! worker-thread callbacks to a cooperative scheduler.

use std::future::Future;
use std::path::Path;

use tokio::sync::{mpsc, oneshot};

pub mod fake;

/// Errors a transport implementation can report to the Client.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("identity I/O failed: {0}")]
    Identity(String),
    #[error("path resolution failed: {0}")]
    Path(String),
    #[error("link establishment failed: {0}")]
    Link(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("operation timed out")]
    Timeout,
}

/// A resource transfer's terminal status, reported on conclusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceStatus {
    Complete,
    Failed,
}

/// Events a link reports asynchronously after it is established. Delivered
/// over the channel supplied to [`MeshTransport::establish_link`].
#[derive(Debug)]
pub enum TransportEvent {
    /// The link handshake completed; the link is now usable.
    LinkEstablished,
    /// The link was torn down, locally or remotely.
    LinkClosed,
    /// A packet arrived on the link, already un-framed.
    Packet(Vec<u8>),
    /// The transport is asking whether to accept an inbound resource
    /// transfer of `total_size` bytes, identified for this link by `token`.
    /// The receiver must answer on `responder` (`true` to accept).
    ResourceAdvertised {
        token: u64,
        total_size: u64,
        responder: oneshot::Sender<bool>,
    },
    /// A previously-accepted resource transfer concluded. `token` matches
    /// the one carried by its `ResourceAdvertised` event.
    ResourceConcluded {
        token: u64,
        status: ResourceStatus,
        data: Vec<u8>,
    },
}

/// An announce observed on the transport's global announce bus, already
/// filtered to the aspect this crate registered for.
#[derive(Clone, Debug)]
pub struct AnnounceEvent {
    pub destination_hash: Vec<u8>,
    pub app_data: Vec<u8>,
}

/// The mesh-transport surface required by the RRC client (`spec.md` §6).
///
/// Implementors own identity persistence, path discovery, link lifecycle,
/// packet framing, resource transfer, and announce delivery. A fake,
/// deterministic implementation for tests lives in [`fake`].
pub trait MeshTransport: Send + Sync + 'static {
    /// An opaque handle to a loaded or recalled identity.
    type Identity: Clone + Send + Sync + 'static;
    /// An opaque handle to an established link.
    type Link: Clone + PartialEq + Send + Sync + 'static;

    /// Load the identity at `path`, creating one if it does not exist.
    fn load_or_create_identity(&self, path: &Path) -> Result<Self::Identity, MeshError>;

    /// The identity's public hash (its identifying digest on the mesh).
    fn identity_hash(&self, identity: &Self::Identity) -> Vec<u8>;

    /// Ask the transport to start resolving a path to `hub_hash`.
    fn request_path(&self, hub_hash: &[u8]) -> impl Future<Output = ()> + Send;

    /// Poll whether a path to `hub_hash` is currently known.
    fn has_path(&self, hub_hash: &[u8]) -> impl Future<Output = bool> + Send;

    /// Recall the identity behind `hub_hash`, if known.
    fn recall_identity(
        &self,
        hub_hash: &[u8],
    ) -> impl Future<Output = Option<Self::Identity>> + Send;

    /// Derive the destination hash for `hub_identity` under `dest_name`'s
    /// aspects. The caller compares this against the configured hub hash to
    /// detect a mismatch before linking.
    fn destination_hash(&self, hub_identity: &Self::Identity, dest_name: &str) -> Vec<u8>;

    /// Tear down any pre-existing link to `hub_identity` found in the
    /// transport's own active/pending/link-table bookkeeping. Returns
    /// `true` if any existing link was found and torn down.
    fn cleanup_existing_links(&self, hub_identity: &Self::Identity) -> impl Future<Output = bool> + Send;

    /// Establish a link to `hub_identity`. Events for this link (including
    /// `LinkEstablished` itself) are delivered on `events` until
    /// `LinkClosed` is sent, after which no further events for this link
    /// will arrive.
    fn establish_link(
        &self,
        hub_identity: Self::Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> impl Future<Output = Result<Self::Link, MeshError>> + Send;

    /// Identify ourselves to the peer at the other end of `link`.
    fn identify(
        &self,
        link: &Self::Link,
        self_identity: &Self::Identity,
    ) -> impl Future<Output = Result<(), MeshError>> + Send;

    /// Attempt to pack `payload` into a single packet for `link`. Returns
    /// `None` if the payload does not fit the link's MDU — the MTU
    /// pre-check the Client performs before every outbound send.
    fn pack(&self, link: &Self::Link, payload: &[u8]) -> Option<Vec<u8>>;

    /// Send `payload` over `link`. Callers must have already confirmed it
    /// packs via [`MeshTransport::pack`].
    fn send(&self, link: &Self::Link, payload: &[u8]) -> impl Future<Output = Result<(), MeshError>> + Send;

    /// Tear down `link`. Idempotent.
    fn teardown(&self, link: &Self::Link);

    /// Cancel an in-flight resource transfer that was accepted via a
    /// `ResourceAdvertised` event's responder.
    fn cancel_active_resources(&self, link: &Self::Link);

    /// Register for announces carrying the given aspect (e.g. `"rrc.hub"`).
    /// Matching announces are delivered on `sink` for the lifetime of the
    /// transport.
    fn register_announce_handler(&self, aspect: &str, sink: mpsc::Sender<AnnounceEvent>);
}
