//! Command enum: everything a UI can ask of a session.

use ndvi_proto::configuration::Configuration;

use crate::LayerName;

/// Inputs from the UI side.  The session validates and applies them in order.
#[derive(Debug, Clone)]
pub enum Command {
    // ── Layers ───────────────────────────────────────────────────────────────
    /// The option form changed.  Dispatched unless the layer already shows
    /// (or is loading) exactly this configuration.
    ConfigurationChanged(LayerName, Configuration),
    /// Re-run the layer's last configuration even if it is cached.
    Refresh(LayerName),
    RemoveLayer(LayerName),

    // ── Band controls ────────────────────────────────────────────────────────
    BandSelected(LayerName, String),
    BlankToggled(LayerName, bool),
    /// Renderer report: `remaining` tiles still loading for one band.
    TileProgress {
        layer: LayerName,
        band: String,
        remaining: u32,
    },

    // ── Alerts ───────────────────────────────────────────────────────────────
    AlertDismissed(String),
    /// Renderer acknowledges that an alert finished fading out.
    AlertTransitionFinished(String),

    // ── Auxiliary operations ─────────────────────────────────────────────────
    RequestChart(Configuration),
    RequestExport(Configuration),
    RequestDownload(Configuration),
    CancelExport(String),
    DeleteExport(String),

    Shutdown,
}
