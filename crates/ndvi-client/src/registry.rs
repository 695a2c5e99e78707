//! RequestRegistry: single-flight bookkeeping for remote operations.
//!
//! Every logical name (a layer, or the alert id of a chart/export/download)
//! owns at most one `PendingRequest`.  Issuing a new request for a name
//! cancels the previous request's token *before* the new one is registered,
//! and every request carries a generation number.  A completion is applied
//! only if `settle` still finds its generation registered; anything else is a
//! superseded or cancelled request and is dropped silently.
//!
//! The token is the transport-level abort (the spawned task stops awaiting
//! the HTTP call); the generation check is what guarantees a late completion
//! has no effect when that abort loses the race.

use std::collections::HashMap;

use ndvi_proto::configuration::Configuration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fingerprint::{fingerprint, Fingerprint};
use crate::layer_cache::LayerCache;
use crate::LayerName;

pub type Generation = u64;

#[derive(Debug)]
pub struct PendingRequest {
    pub generation: Generation,
    pub fingerprint: Fingerprint,
    cancel: CancellationToken,
}

/// Everything the caller needs to run an issued request.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub name: LayerName,
    pub generation: Generation,
    pub fingerprint: Fingerprint,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum Dispatch {
    /// The layer already shows, or is already loading, this fingerprint.
    Unchanged,
    /// A new request must be issued.  `superseded` is the generation that was
    /// cancelled to make room for it, if any.
    Issued {
        ticket: Ticket,
        superseded: Option<Generation>,
    },
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: HashMap<LayerName, PendingRequest>,
    next_generation: Generation,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch `config` for `layer` unless the cache says it is already
    /// current.  On a miss the fingerprint is recorded immediately, so a
    /// second identical edit arriving before completion is also a no-op.
    pub fn dispatch(
        &mut self,
        cache: &mut LayerCache,
        layer: &LayerName,
        config: &Configuration,
    ) -> Dispatch {
        let fingerprint = fingerprint(config);
        if cache.is_current(layer, &fingerprint) {
            debug!("registry: {} unchanged, dispatch suppressed", layer);
            return Dispatch::Unchanged;
        }
        cache.record(layer.clone(), fingerprint.clone());
        let (ticket, superseded) = self.register(layer, fingerprint);
        Dispatch::Issued { ticket, superseded }
    }

    /// Register a request without consulting any cache.  Used for auxiliary
    /// operations, which are single-flight per target but never deduplicated.
    pub fn issue(&mut self, name: &LayerName, fingerprint: Fingerprint) -> Ticket {
        self.register(name, fingerprint).0
    }

    fn register(
        &mut self,
        name: &LayerName,
        fingerprint: Fingerprint,
    ) -> (Ticket, Option<Generation>) {
        let superseded = self.cancel(name);
        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        self.pending.insert(
            name.clone(),
            PendingRequest {
                generation,
                fingerprint: fingerprint.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(
            "registry: {} issued generation {} (superseded {:?})",
            name, generation, superseded
        );
        let ticket = Ticket {
            name: name.clone(),
            generation,
            fingerprint,
            cancel,
        };
        (ticket, superseded)
    }

    /// Cancel and forget the pending request for `name`.  Returns the
    /// cancelled generation; calling it again is a no-op.
    pub fn cancel(&mut self, name: &LayerName) -> Option<Generation> {
        let pending = self.pending.remove(name)?;
        pending.cancel.cancel();
        debug!(
            "registry: {} cancelled generation {}",
            name, pending.generation
        );
        Some(pending.generation)
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.cancel.cancel();
        }
    }

    /// Claim the right to apply a completion.  Succeeds at most once per
    /// generation and only while that generation is still the live one.
    pub fn settle(&mut self, name: &LayerName, generation: Generation) -> Option<PendingRequest> {
        match self.pending.get(name) {
            Some(p) if p.generation == generation && !p.cancel.is_cancelled() => {
                self.pending.remove(name)
            }
            _ => {
                debug!(
                    "registry: {} dropped stale completion of generation {}",
                    name, generation
                );
                None
            }
        }
    }

    pub fn pending(&self, name: &LayerName) -> Option<&PendingRequest> {
        self.pending.get(name)
    }

    pub fn is_pending(&self, name: &LayerName) -> bool {
        self.pending.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
