/// Failure to parse a connection uri.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    /// The uri is not well formed: wrong scheme for the parser invoked,
    /// bad pubkey hex, missing relay, or an invalid relay url.
    #[error("malformed uri: {0}")]
    Malformed(String),

    /// The uri uses a scheme that is neither `bunker://` nor
    /// `nostrconnect://`.
    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),
}

/// Failure to create an ephemeral identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// Could not derive a public key from the drawn secret bytes
    /// (or the system rng failed).
    #[error("public key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Failure in the crypto envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The payload version is not one we can decrypt.
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(u8),

    /// Bad payload length, encoding, or padding.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The authentication tag did not verify.
    #[error("payload authentication failed")]
    AuthenticationFailed,

    /// The peer public key is not a valid secp256k1 x-only point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A relay pool refused or failed to publish an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Relay-level transport failure, surfaced after retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish (or re-establish) the relay subscription.
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// Could not publish an envelope.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Failure of an individual rpc call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// No response arrived before the call deadline.
    #[error("rpc call timed out")]
    Timeout,

    /// The call was cancelled locally.
    #[error("rpc call cancelled")]
    Cancelled,

    /// The signer answered with an error field.
    #[error("signer rejected request: {0}")]
    SignerRejected(String),

    /// The request could not be delivered.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The request could not be encrypted for the signer.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failure loading or saving persisted session material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The credential store holds no session.
    #[error("no stored session")]
    NoStoredSession,

    /// The credential store holds session fields that are malformed.
    #[error("stored session is corrupt: {0}")]
    Corrupt(String),

    /// The credential store backend itself failed.
    #[error("credential store error: {0}")]
    Store(String),
}

/// Top level engine error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// See [UriError].
    #[error(transparent)]
    Uri(#[from] UriError),

    /// See [IdentityError].
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// See [CryptoError].
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// See [RpcError].
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// See [SessionError].
    #[error(transparent)]
    Session(#[from] SessionError),

    /// See [TransportError].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// See [ConfigError](crate::ConfigError).
    #[error(transparent)]
    Config(#[from] crate::ConfigError),

    /// An rpc was requested while no session is established.
    #[error("no established session")]
    NotConnected,

    /// The signer did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The handshake was cancelled (explicitly, or by a newer attempt).
    #[error("handshake cancelled")]
    HandshakeCancelled,

    /// The engine driver task is gone.
    #[error("engine stopped")]
    EngineStopped,
}

impl EngineError {
    /// True if retrying with a fresh attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout
                | Self::Transport(_)
                | Self::Rpc(RpcError::Timeout)
                | Self::Rpc(RpcError::Transport(_))
        )
    }
}

/// Engine result type.
pub type ConnectResult<T> = Result<T, EngineError>;
