//! Key provider implementations.

pub mod software;

pub mod hardware;

#[cfg(feature = "mock")]
pub mod mock;
