pub mod context;
pub mod filter;
pub mod forwarder;
mod router;

pub use context::BoxBody;
pub use forwarder::{Forwarder, HyperForwarder};
pub use router::GatewayRouter;
