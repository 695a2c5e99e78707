//! Types shared between the session core and anything that talks to it:
//! the computation configuration, the remote compute wire bodies, the push
//! channel framing, and the on-disk client configuration.

pub mod config;
pub mod configuration;
pub mod platform;
pub mod protocol;
