//! Session core for the NDVI trend client.
//!
//! One `SessionCore` per user session owns every piece of mutable state
//! (request registry, layer cache, overlays, alerts) and is driven by a single
//! event loop.  Remote calls and the push channel run as spawned tasks that
//! report back over an mpsc channel.

pub mod action;
pub mod alerts;
pub mod channel;
pub mod fingerprint;
pub mod layer_cache;
pub mod overlay;
pub mod registry;
pub mod remote;
pub mod session;

use std::fmt;

/// Name of an independently cacheable unit of output.  Auxiliary operations
/// reuse the type with their alert id as the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerName(String);

impl LayerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the alert that tracks this layer's request and tile loading.
    pub fn alert_id(&self) -> String {
        format!("layer-{}", self.0)
    }
}

impl From<&str> for LayerName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for LayerName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
