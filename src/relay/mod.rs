// Relay module - the bidirectional link to the in-page relay script
//
// The page script inside the authenticated browser context connects to the
// WebSocket listener and performs the actual upstream HTTP calls. The proxy
// sends it framed requests and receives framed response events, routed to
// per-request queues by the multiplexer.

pub mod channel;
pub mod multiplexer;
pub mod protocol;

pub use channel::RelayChannel;
pub use multiplexer::{QueueMessage, RecvError, RequestMultiplexer, RequestQueue};
pub use protocol::{ControlFrame, RelayEvent, RelayRequest};
