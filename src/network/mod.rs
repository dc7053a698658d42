//! Network subsystem: backend connection, inbound routing and health checks

pub mod connection;
pub mod health;
pub mod router;
pub mod transport;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use health::{HealthProbe, HealthReport};
pub use router::{InboundRouter, RouteOutcome};
pub use transport::{Connection, Transport, WebSocketTransport};
