pub mod circuit_breaker;
pub mod loadbalance;

pub use circuit_breaker::{BreakerBank, BreakerCheck, BreakerPermit, BreakerState, BreakerView};
pub use loadbalance::{LbPolicy, LoadBalancer, Selection};
