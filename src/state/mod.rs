pub mod backoff;
pub mod command;
pub mod event;
pub mod reachability;
pub mod working;

pub use backoff::{BackoffConfig, ProbeBackoff};
pub use command::Command;
pub use event::{Cadence, Event};
pub use reachability::{MachineConfig, Published, Reachability, ReachabilityMachine};
pub use working::WorkingProtocolSet;
