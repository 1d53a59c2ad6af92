pub mod announcer;
pub mod identity;
pub mod node;
pub mod port_mapping;
pub mod probe;
pub mod protocol;
pub mod publisher;
pub mod shutdown;
pub mod state;
pub mod traits;
pub mod transport;
pub mod types;
pub mod wire;

#[cfg(test)]
pub mod test_utils;
