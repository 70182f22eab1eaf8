use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("chrome not reachable at {0}; start it with --remote-debugging-port=9222")]
    ChromeNotAvailable(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("devtools error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("javascript error: {0}")]
    JavaScript(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),

    #[error("session closed")]
    SessionClosed,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for BrowserError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BrowserError::WebSocket(err.to_string())
    }
}

impl From<reqwest::Error> for BrowserError {
    fn from(err: reqwest::Error) -> Self {
        BrowserError::Http(err.to_string())
    }
}
