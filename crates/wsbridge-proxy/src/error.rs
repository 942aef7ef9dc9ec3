use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream dial failed: {0}")]
    Dial(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
