//! Last dispatched fingerprint per layer.

use std::collections::HashMap;

use crate::fingerprint::Fingerprint;
use crate::LayerName;

#[derive(Debug, Default)]
pub struct LayerCache {
    entries: HashMap<LayerName, Fingerprint>,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `fingerprint` is what was last dispatched for `layer`.
    pub fn is_current(&self, layer: &LayerName, fingerprint: &Fingerprint) -> bool {
        self.entries.get(layer) == Some(fingerprint)
    }

    pub fn get(&self, layer: &LayerName) -> Option<&Fingerprint> {
        self.entries.get(layer)
    }

    pub fn record(&mut self, layer: LayerName, fingerprint: Fingerprint) {
        self.entries.insert(layer, fingerprint);
    }

    pub fn forget(&mut self, layer: &LayerName) -> Option<Fingerprint> {
        self.entries.remove(layer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
