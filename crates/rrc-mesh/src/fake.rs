//! A deterministic, in-memory [`MeshTransport`] used to drive the Client's
//! state machine in tests without a real mesh network. Test code configures
//! path/identity availability up front, then uses [`FakeTransport::push_event`]
//! and [`FakeTransport::push_announce`] to script inbound activity and
//! [`FakeTransport::sent_packets`] to assert on outbound activity.

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use crate::{AnnounceEvent, MeshError, MeshTransport, TransportEvent};

/// An opaque fake identity: just the bytes it hashes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeIdentity(pub Vec<u8>);

/// An opaque fake link handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeLink(pub u64);

struct State {
    path_available: bool,
    recallable_identity: Option<FakeIdentity>,
    next_link_id: u64,
    sent: Vec<Vec<u8>>,
    events: Option<mpsc::Sender<TransportEvent>>,
    announces: Option<mpsc::Sender<AnnounceEvent>>,
    mtu: usize,
    torn_down: bool,
}

pub struct FakeTransport {
    state: Mutex<State>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                path_available: false,
                recallable_identity: None,
                next_link_id: 1,
                sent: Vec::new(),
                events: None,
                announces: None,
                mtu: 4096,
                torn_down: false,
            }),
        }
    }

    pub fn set_path_available(&self, available: bool) {
        self.state.lock().expect("lock").path_available = available;
    }

    pub fn set_recallable_identity(&self, identity: Option<FakeIdentity>) {
        self.state.lock().expect("lock").recallable_identity = identity;
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.state.lock().expect("lock").mtu = mtu;
    }

    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().expect("lock").sent.clone()
    }

    pub fn was_torn_down(&self) -> bool {
        self.state.lock().expect("lock").torn_down
    }

    /// Script an event onto the active link's event channel, if one exists.
    pub async fn push_event(&self, event: TransportEvent) {
        let sender = self.state.lock().expect("lock").events.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Script an announce onto the registered announce handler, if any.
    pub async fn push_announce(&self, announce: AnnounceEvent) {
        let sender = self.state.lock().expect("lock").announces.clone();
        if let Some(sender) = sender {
            let _ = sender.send(announce).await;
        }
    }
}

fn toy_digest(seed: &[u8], len: usize) -> Vec<u8> {
    // Not cryptographic — the fake transport only needs stable, distinct
    // digests for test fixtures, never real security properties.
    let mut out = Vec::with_capacity(len);
    let mut acc: u64 = 0xcbf29ce484222325;
    for &b in seed {
        acc ^= b as u64;
        acc = acc.wrapping_mul(0x100000001b3);
    }
    for i in 0..len {
        acc = acc.wrapping_mul(0x100000001b3).wrapping_add(i as u64);
        out.push((acc >> ((i % 8) * 8)) as u8);
    }
    out
}

impl MeshTransport for FakeTransport {
    type Identity = FakeIdentity;
    type Link = FakeLink;

    fn load_or_create_identity(&self, path: &std::path::Path) -> Result<Self::Identity, MeshError> {
        let seed = path.to_string_lossy().into_owned();
        Ok(FakeIdentity(toy_digest(seed.as_bytes(), 16)))
    }

    fn identity_hash(&self, identity: &Self::Identity) -> Vec<u8> {
        identity.0.clone()
    }

    async fn request_path(&self, _hub_hash: &[u8]) {}

    async fn has_path(&self, _hub_hash: &[u8]) -> bool {
        self.state.lock().expect("lock").path_available
    }

    async fn recall_identity(&self, _hub_hash: &[u8]) -> Option<Self::Identity> {
        self.state.lock().expect("lock").recallable_identity.clone()
    }

    fn destination_hash(&self, hub_identity: &Self::Identity, dest_name: &str) -> Vec<u8> {
        let mut seed = hub_identity.0.clone();
        seed.extend_from_slice(dest_name.as_bytes());
        toy_digest(&seed, 16)
    }

    async fn cleanup_existing_links(&self, _hub_identity: &Self::Identity) -> bool {
        false
    }

    async fn establish_link(
        &self,
        _hub_identity: Self::Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self::Link, MeshError> {
        let link_id = {
            let mut state = self.state.lock().expect("lock");
            state.events = Some(events.clone());
            state.torn_down = false;
            let id = state.next_link_id;
            state.next_link_id += 1;
            id
        };
        let _ = events.send(TransportEvent::LinkEstablished).await;
        Ok(FakeLink(link_id))
    }

    async fn identify(&self, _link: &Self::Link, _self_identity: &Self::Identity) -> Result<(), MeshError> {
        Ok(())
    }

    fn pack(&self, _link: &Self::Link, payload: &[u8]) -> Option<Vec<u8>> {
        let mtu = self.state.lock().expect("lock").mtu;
        if payload.len() <= mtu {
            Some(payload.to_vec())
        } else {
            None
        }
    }

    async fn send(&self, _link: &Self::Link, payload: &[u8]) -> Result<(), MeshError> {
        self.state.lock().expect("lock").sent.push(payload.to_vec());
        Ok(())
    }

    fn teardown(&self, _link: &Self::Link) {
        let mut state = self.state.lock().expect("lock");
        state.torn_down = true;
        state.events = None;
    }

    fn cancel_active_resources(&self, _link: &Self::Link) {}

    fn register_announce_handler(&self, _aspect: &str, sink: mpsc::Sender<AnnounceEvent>) {
        self.state.lock().expect("lock").announces = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn establish_link_emits_established_event() {
        let transport = FakeTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let identity = transport
            .load_or_create_identity(std::path::Path::new("/tmp/test-identity"))
            .expect("identity");
        let link = transport.establish_link(identity, tx).await.expect("link");
        assert_eq!(link.0, 1);
        let event = rx.recv().await.expect("event");
        assert!(matches!(event, TransportEvent::LinkEstablished));
    }

    #[tokio::test]
    async fn pack_respects_mtu() {
        let transport = FakeTransport::new();
        transport.set_mtu(4);
        let link = FakeLink(1);
        assert!(transport.pack(&link, b"ok").is_some());
        assert!(transport.pack(&link, b"toolong").is_none());
    }

    #[tokio::test]
    async fn resource_responder_round_trips() {
        let (tx, mut rx) = mpsc::channel(8);
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(TransportEvent::ResourceAdvertised {
            token: 1,
            total_size: 10,
            responder: resp_tx,
        })
        .await
        .expect("send event");

        let event = rx.recv().await.expect("event");
        let TransportEvent::ResourceAdvertised {
            responder,
            total_size,
            ..
        } = event
        else {
            panic!("expected ResourceAdvertised");
        };
        assert_eq!(total_size, 10);
        responder.send(true).expect("respond");
        assert_eq!(resp_rx.await, Ok(true));
    }
}
