//! Broker error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Failures that stop the broker.
#[derive(Debug, Error)]
pub enum BobError {
    /// A listener could not be bound.
    #[error("failed to bind {channel} listener on {addr}: {source}")]
    Bind {
        /// Which listener (`brains` or `clients`).
        channel: &'static str,
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A listener's accept loop failed.
    #[error("{channel} server failed on {addr}: {source}")]
    Serve {
        /// Which listener (`brains` or `clients`).
        channel: &'static str,
        /// Bound address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The server supervisor task panicked or was aborted.
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_display() {
        let err = BobError::Bind {
            channel: "brains",
            addr: "127.0.0.1:4000".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind brains listener on 127.0.0.1:4000: in use"
        );
    }
}
