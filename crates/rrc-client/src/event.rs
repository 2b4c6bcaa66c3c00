use rrc_protocol::Envelope;

/// Events the client emits to its consumer (the daemon's event bus, or a
/// test harness). Mirrors the callback surface `client.py` exposed to
/// `BackendService`, collapsed onto a single channel per spec.md Design
/// Note §9.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The connection reached the welcomed state and is ready for use. Carries
    /// the WELCOME envelope itself so the hub name in its body can be read.
    Welcomed(Envelope),
    /// The link closed, locally or remotely. The client has reset to
    /// `Disconnected` by the time this is emitted.
    Closed,
    /// A JOINED envelope was received for a room this client belongs to.
    Joined(Envelope),
    /// A PARTED envelope was received.
    Parted(Envelope),
    /// A MSG envelope was received.
    Message(Envelope),
    /// A NOTICE envelope was received, or synthesized from a concluded
    /// notice/motd resource transfer.
    Notice(Envelope),
    /// A PONG envelope was received in reply to a PING.
    Pong(Envelope),
    /// An ERROR envelope was received from the hub.
    HubError(Envelope),
    /// A non-fatal warning worth surfacing to the UI (e.g. outbound message
    /// dropped for exceeding the link MTU).
    Warning(String),
}
