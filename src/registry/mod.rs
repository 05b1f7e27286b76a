pub mod clock;
pub mod ledger;
pub mod monitor;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use ledger::{
    InstanceLedger, InstanceStatus, InstanceView, RegistryEvent, ServiceInstance, MAX_LEASE,
};
pub use monitor::{LeaseMonitor, MonitorSettings, SweepOutcome};
