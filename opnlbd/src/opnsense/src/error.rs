use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status} from {path}")]
    Status { path: String, status: u16 },

    #[error("failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
