//! Process utilities shared by the binaries and the bus.

pub mod bootstrap;
pub mod retry;
