use thiserror::Error;

/// Abstract error codes exposed upward at the public API seam (spec §6).
///
/// Lower-crate errors (`ProtocolError`, `CryptoError`, `rusqlite::Error`) are
/// wrapped transparently so `?` costs nothing at most call sites; handlers
/// that need a *different* code than the wrapped error's default (e.g.
/// `KEY_UNAVAILABLE` instead of `NETWORK` for a send against an unknown
/// recipient) construct that variant explicitly instead of propagating.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInitialized,

    #[error("no identity loaded")]
    NoIdentity,

    #[error("identity is locked by another process")]
    IdentityLocked,

    #[error("a session password is required")]
    PasswordRequired,

    #[error("wrong password")]
    WrongPassword,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("database error: {0}")]
    Database(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("recipient key unavailable")]
    KeyUnavailable,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Protocol(#[from] engine_protocol::ProtocolError),

    #[error(transparent)]
    Crypto2(#[from] engine_crypto::CryptoError),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<tokio_rusqlite::Error> for EngineError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<String> for EngineError {
    fn from(e: String) -> Self {
        Self::Database(e)
    }
}

impl EngineError {
    /// The abstract error code string from spec §6, for callers (CLI/mobile
    /// bindings) that need the stable wire name rather than a Rust type.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::NoIdentity => "NO_IDENTITY",
            Self::IdentityLocked => "IDENTITY_LOCKED",
            Self::PasswordRequired => "PASSWORD_REQUIRED",
            Self::WrongPassword => "WRONG_PASSWORD",
            Self::InvalidParam(_) => "INVALID_PARAM",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Permission(_) => "PERMISSION",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::Database(_) => "DATABASE",
            Self::Network(_) => "NETWORK",
            Self::Crypto(_) | Self::Crypto2(_) => "CRYPTO",
            Self::KeyUnavailable => "KEY_UNAVAILABLE",
            Self::Internal(_) | Self::Protocol(_) => "INTERNAL",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
