//! Reporting of request traffic.
//!
//! The connection handler never prints directly; it reports what it saw to an
//! `Observer`. `TracingObserver` is what the binary uses.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::protocol::{ExtractError, Payload};

/// Receives the text and outcome of every request that was read.
pub trait Observer: Send + Sync {
    /// Raw request text, limited to the `bytes` actually read.
    fn request(&self, peer: SocketAddr, bytes: usize, text: &str);

    /// A JSON payload was decoded from the request body.
    fn payload(&self, peer: SocketAddr, payload: &Payload);

    /// No payload could be decoded.
    fn rejected(&self, peer: SocketAddr, error: &ExtractError);
}

/// Observer that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn request(&self, peer: SocketAddr, bytes: usize, text: &str) {
        info!(peer = %peer, bytes, "Request received\n{text}");
    }

    fn payload(&self, peer: SocketAddr, payload: &Payload) {
        let rendered = serde_json::to_string(payload).unwrap_or_default();
        info!(peer = %peer, payload = %rendered, "JSON payload");
    }

    fn rejected(&self, peer: SocketAddr, error: &ExtractError) {
        match error {
            ExtractError::MissingBoundary => debug!(peer = %peer, "No request body"),
            ExtractError::InvalidJson(e) => warn!(peer = %peer, error = %e, "Error parsing JSON"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Event, RecordingObserver};
    use super::*;
    use crate::protocol::extract_payload;

    #[test]
    fn test_recording_observer() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let observer = RecordingObserver::default();

        observer.request(peer, 5, "GET /");
        observer.payload(peer, &extract_payload("\r\n\r\n{\"a\":1}").unwrap());
        observer.rejected(peer, &ExtractError::MissingBoundary);

        assert_eq!(
            observer.events(),
            vec![
                Event::Request("GET /".to_string()),
                Event::Payload(serde_json::json!({"a": 1})),
                Event::Rejected("no header/body boundary in request".to_string()),
            ]
        );
    }

    #[test]
    fn test_tracing_observer_is_silent_without_subscriber() {
        let peer: SocketAddr = "[::1]:4000".parse().unwrap();
        let observer = TracingObserver;
        observer.request(peer, 1, "x");
        observer.payload(peer, &Payload::new());
        observer.rejected(peer, &extract_payload("x\r\n\r\n").unwrap_err());
    }
}
