use tokio_tungstenite::tungstenite;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("Structure error: {0}")]
    Structure(#[from] isoworker_structure::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
