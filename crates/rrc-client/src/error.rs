/// Errors the client can return from its public API or connection lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connect timed out waiting for {0}")]
    ConnectTimeout(&'static str),
    #[error("hub identity hash does not match configured hub hash")]
    HubHashMismatch,
    #[error("hub did not answer with WELCOME after {0} HELLO attempts")]
    NoWelcome(u32),
    #[error("invalid room name")]
    InvalidRoom,
    #[error("invalid message text")]
    InvalidText,
    #[error("message is too large to fit the link's MTU")]
    MessageTooLarge,
    #[error("too many pending resource expectations")]
    TooManyExpectations,
    #[error("too many active resource transfers")]
    TooManyActiveResources,
    #[error(transparent)]
    Protocol(#[from] rrc_protocol::ProtocolError),
    #[error(transparent)]
    Transport(#[from] rrc_mesh::MeshError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
