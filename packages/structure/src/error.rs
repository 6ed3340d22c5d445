//! Error types for the structure layer.

use thiserror::Error;

use crate::wire::ChannelId;

/// Errors raised by the codec and the port model.
///
/// All of these indicate a programming error in the value graph or in the
/// way ports are used, and are returned synchronously to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// A port was serialized without first being transferred.
    #[error(
        "port {0} must be transferred before serialization; add it to the transfer list"
    )]
    TransferRequired(ChannelId),

    /// A structure referenced a missing or malformed ref entry.
    #[error("corrupt structure: {0}")]
    CorruptStructure(String),

    /// A value graph nests deeper than the codec accepts.
    #[error("value nests deeper than {0} levels")]
    NestingTooDeep(usize),

    /// `transfer` was called on a port that is already transferred.
    #[error("port {0} is already transferred")]
    AlreadyTransferred(ChannelId),

    /// `transfer` was called on a port whose peer no longer exists.
    #[error("port {0} must be linked to another message port")]
    NotLinked(ChannelId),

    /// The wire text was not valid JSON, or not a structure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Error::CorruptStructure(message.into())
    }
}

/// Result type alias for structure operations.
pub type Result<T> = std::result::Result<T, Error>;
