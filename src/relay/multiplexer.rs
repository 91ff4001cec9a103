// Request multiplexer - routes relay events into per-request queues
//
// Many concurrent client requests share the single relay connection; events
// come back tagged with a request_id and are fanned out here. Each queue is
// single-producer (the channel's read loop) single-consumer (the request
// task). Queues are unbounded in memory; their lifetime is bounded by the
// request timeouts.

use crate::relay::protocol::RelayEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a request task dequeues. `stream_close` from the wire is normalised
/// to the `StreamEnd` sentinel here.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    Headers {
        status: u16,
        headers: HashMap<String, String>,
    },
    Chunk {
        data: String,
    },
    Error {
        status: Option<u16>,
        message: String,
    },
    StreamEnd,
}

/// Why a timed dequeue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The queue was closed (request removed, or relay lost beyond grace)
    Closed,
    /// No message arrived within the deadline
    Timeout,
}

/// Consumer side of one request's queue.
pub struct RequestQueue {
    rx: mpsc::UnboundedReceiver<QueueMessage>,
}

impl RequestQueue {
    /// Dequeue the next message, failing deterministically on close or
    /// deadline expiry.
    pub async fn recv(&mut self, timeout: Duration) -> Result<QueueMessage, RecvError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(RecvError::Closed),
            Err(_) => Err(RecvError::Timeout),
        }
    }
}

#[derive(Default)]
pub struct RequestMultiplexer {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<QueueMessage>>>,
}

impl RequestMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue for a freshly minted request id.
    pub fn create_queue(&self, request_id: &str) -> RequestQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .queues
            .lock()
            .unwrap()
            .insert(request_id.to_string(), tx);
        // IDs are minted per request; a collision means a caller reused one
        debug_assert!(previous.is_none(), "duplicate request_id {}", request_id);
        RequestQueue { rx }
    }

    /// Close and remove a queue. Idempotent; pending receivers observe
    /// `Closed`.
    pub fn remove_queue(&self, request_id: &str) {
        self.queues.lock().unwrap().remove(request_id);
    }

    /// Route one relay event into its queue. Events for unknown ids are
    /// dropped.
    pub fn deliver(&self, event: RelayEvent) {
        let request_id = event.request_id().to_string();
        let message = match event {
            RelayEvent::ResponseHeaders {
                status, headers, ..
            } => QueueMessage::Headers { status, headers },
            RelayEvent::Chunk { data, .. } => QueueMessage::Chunk { data },
            RelayEvent::Error {
                status, message, ..
            } => QueueMessage::Error { status, message },
            RelayEvent::StreamClose { .. } => QueueMessage::StreamEnd,
        };

        let queues = self.queues.lock().unwrap();
        match queues.get(&request_id) {
            Some(tx) => {
                // Send fails only when the consumer already went away
                let _ = tx.send(message);
            }
            None => {
                tracing::debug!("Dropping relay event for unknown request {}", request_id);
            }
        }
    }

    /// Close every live queue. Used when the relay is lost beyond the
    /// reconnect grace window; consumers observe `Closed`, which is an
    /// operational failure and not counted against the credential.
    pub fn close_all(&self) {
        let mut queues = self.queues.lock().unwrap();
        let count = queues.len();
        queues.clear();
        if count > 0 {
            tracing::warn!("Closed {} in-flight request queue(s)", count);
        }
    }

    /// Number of live queues (in-flight requests from the relay's view).
    pub fn len(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_event(id: &str) -> RelayEvent {
        RelayEvent::ResponseHeaders {
            request_id: id.to_string(),
            status: 200,
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_events_route_to_their_queue() {
        let mux = RequestMultiplexer::new();
        let mut q1 = mux.create_queue("a");
        let mut q2 = mux.create_queue("b");

        mux.deliver(headers_event("a"));
        mux.deliver(RelayEvent::Chunk {
            request_id: "b".to_string(),
            data: "for b".to_string(),
        });

        match q1.recv(Duration::from_secs(1)).await.unwrap() {
            QueueMessage::Headers { status, .. } => assert_eq!(status, 200),
            other => panic!("unexpected: {:?}", other),
        }
        match q2.recv(Duration::from_secs(1)).await.unwrap() {
            QueueMessage::Chunk { data } => assert_eq!(data, "for b"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_close_becomes_sentinel() {
        let mux = RequestMultiplexer::new();
        let mut q = mux.create_queue("a");
        mux.deliver(RelayEvent::StreamClose {
            request_id: "a".to_string(),
        });
        assert_eq!(
            q.recv(Duration::from_secs(1)).await.unwrap(),
            QueueMessage::StreamEnd
        );
    }

    #[tokio::test]
    async fn test_close_fails_pending_receiver() {
        let mux = RequestMultiplexer::new();
        let mut q = mux.create_queue("a");

        let mux = std::sync::Arc::new(mux);
        let mux2 = mux.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            mux2.remove_queue("a");
        });

        assert_eq!(
            q.recv(Duration::from_secs(5)).await.unwrap_err(),
            RecvError::Closed
        );
    }

    #[tokio::test]
    async fn test_remove_queue_is_idempotent() {
        let mux = RequestMultiplexer::new();
        let _q = mux.create_queue("a");
        mux.remove_queue("a");
        mux.remove_queue("a");
        assert_eq!(mux.len(), 0);
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let mux = RequestMultiplexer::new();
        let mut q = mux.create_queue("a");
        assert_eq!(
            q.recv(Duration::from_millis(20)).await.unwrap_err(),
            RecvError::Timeout
        );
        // Queue still usable after a timeout
        mux.deliver(headers_event("a"));
        assert!(q.recv(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let mux = RequestMultiplexer::new();
        let mut q = mux.create_queue("known");
        mux.deliver(headers_event("unknown"));
        assert_eq!(
            q.recv(Duration::from_millis(20)).await.unwrap_err(),
            RecvError::Timeout
        );
    }

    #[tokio::test]
    async fn test_close_all() {
        let mux = RequestMultiplexer::new();
        let mut q1 = mux.create_queue("a");
        let mut q2 = mux.create_queue("b");
        mux.close_all();
        assert_eq!(
            q1.recv(Duration::from_secs(1)).await.unwrap_err(),
            RecvError::Closed
        );
        assert_eq!(
            q2.recv(Duration::from_secs(1)).await.unwrap_err(),
            RecvError::Closed
        );
    }

    #[tokio::test]
    async fn test_order_preserved_within_request() {
        let mux = RequestMultiplexer::new();
        let mut q = mux.create_queue("a");
        mux.deliver(headers_event("a"));
        for i in 0..3 {
            mux.deliver(RelayEvent::Chunk {
                request_id: "a".to_string(),
                data: format!("chunk {}", i),
            });
        }
        mux.deliver(RelayEvent::StreamClose {
            request_id: "a".to_string(),
        });

        assert!(matches!(
            q.recv(Duration::from_secs(1)).await.unwrap(),
            QueueMessage::Headers { .. }
        ));
        for i in 0..3 {
            assert_eq!(
                q.recv(Duration::from_secs(1)).await.unwrap(),
                QueueMessage::Chunk {
                    data: format!("chunk {}", i)
                }
            );
        }
        assert_eq!(
            q.recv(Duration::from_secs(1)).await.unwrap(),
            QueueMessage::StreamEnd
        );
    }
}
