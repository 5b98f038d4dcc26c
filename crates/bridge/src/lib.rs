pub mod protocol;
pub mod sidecar;
pub mod transport;

pub use protocol::{ClientMessage, ServerMessage};
pub use sidecar::{SidecarClient, SidecarHost};
pub use transport::{BridgeEvent, BridgeTransport};
