//! OverlayManager: the bands of each layer and which one is shown.
//!
//! A layer's bands are created together when its request completes and
//! destroyed together when it is replaced or removed.  Visibility follows a
//! radio-group-plus-checkbox model: exactly one band control is checked, and
//! the separate blank control hides everything while leaving that choice
//! intact.  At most one band is visible at any time.

use std::collections::HashMap;

use ndvi_proto::protocol::BandInfo;
use tracing::{debug, info, trace};

use crate::alerts::{AlertBoard, RemovalEpoch};
use crate::layer_cache::LayerCache;
use crate::registry::{Generation, RequestRegistry};
use crate::LayerName;

/// Name of the synthetic control that blanks a layer.
pub const BLANK_CONTROL: &str = "blank";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opacity {
    Visible,
    Hidden,
}

/// What the map needs to draw one band's tiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverlayHandle {
    pub layer: LayerName,
    pub band: String,
    pub mapid: String,
    pub token: String,
}

/// The map side.  Implemented by whatever draws tiles.
pub trait BandRenderer: Send {
    /// Attach the overlay if needed and set its opacity.
    fn render_band(&mut self, handle: &OverlayHandle, opacity: Opacity);
    /// Detach the overlay.
    fn remove_band(&mut self, handle: &OverlayHandle);
}

/// Renderer for headless sessions: records nothing, logs every call.
#[derive(Debug, Default)]
pub struct LoggingRenderer;

impl BandRenderer for LoggingRenderer {
    fn render_band(&mut self, handle: &OverlayHandle, opacity: Opacity) {
        info!(
            "render {}/{} mapid={} {:?}",
            handle.layer, handle.band, handle.mapid, opacity
        );
    }

    fn remove_band(&mut self, handle: &OverlayHandle) {
        info!("remove {}/{}", handle.layer, handle.band);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub name: String,
    pub handle: OverlayHandle,
    pub opacity: Opacity,
    /// `None` until the renderer reports progress for this band.
    pub remaining_tiles: Option<u32>,
}

/// Lifecycle of a layer.  Layers without an entry are `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Idle,
    Loading,
    Ready,
    Error,
}

/// One entry of the layer's control group, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandControl {
    pub name: String,
    pub checked: bool,
}

/// Result of a tile-progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileProgress {
    /// Tiles still outstanding across the bands that have reported.
    Loading { remaining: u32 },
    /// Every band of the layer has reached zero.
    Loaded,
}

/// Everything `remove_layer` tore down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRemoval {
    pub bands: usize,
    pub cancelled: Option<Generation>,
    pub alert_epoch: Option<RemovalEpoch>,
}

#[derive(Debug)]
struct LayerOverlay {
    state: LayerState,
    bands: Vec<Band>,
    /// Index into `bands`.  Names may repeat, so selection is positional.
    checked: Option<usize>,
    blank: bool,
}

impl LayerOverlay {
    fn new() -> Self {
        Self {
            state: LayerState::Idle,
            bands: Vec::new(),
            checked: None,
            blank: false,
        }
    }

    fn target_opacity(&self, index: usize) -> Opacity {
        if !self.blank && self.checked == Some(index) {
            Opacity::Visible
        } else {
            Opacity::Hidden
        }
    }

    /// Bring every band's opacity in line with `checked`/`blank`, telling the
    /// renderer only about bands that changed.
    fn sync(&mut self, renderer: &mut dyn BandRenderer) {
        for i in 0..self.bands.len() {
            let target = self.target_opacity(i);
            let band = &mut self.bands[i];
            if band.opacity != target {
                band.opacity = target;
                renderer.render_band(&band.handle, target);
            }
        }
    }

    fn detach_all(&mut self, renderer: &mut dyn BandRenderer) -> usize {
        let count = self.bands.len();
        for band in self.bands.drain(..) {
            renderer.remove_band(&band.handle);
        }
        self.checked = None;
        count
    }
}

pub struct OverlayManager {
    layers: HashMap<LayerName, LayerOverlay>,
    renderer: Box<dyn BandRenderer>,
}

impl OverlayManager {
    pub fn new(renderer: Box<dyn BandRenderer>) -> Self {
        Self {
            layers: HashMap::new(),
            renderer,
        }
    }

    pub fn begin_loading(&mut self, layer: &LayerName) {
        let overlay = self
            .layers
            .entry(layer.clone())
            .or_insert_with(LayerOverlay::new);
        if overlay.state != LayerState::Loading {
            debug!("overlay: {} {:?} → Loading", layer, overlay.state);
            overlay.state = LayerState::Loading;
        }
    }

    /// Replace the whole band set of `layer`.  The first band is shown, the
    /// rest are attached hidden, and blank mode is cleared.
    pub fn apply_result(&mut self, layer: &LayerName, bands: Vec<BandInfo>) -> usize {
        let overlay = self
            .layers
            .entry(layer.clone())
            .or_insert_with(LayerOverlay::new);
        let replaced = overlay.detach_all(self.renderer.as_mut());

        overlay.checked = if bands.is_empty() { None } else { Some(0) };
        overlay.blank = false;
        overlay.state = LayerState::Ready;
        overlay.bands = bands
            .into_iter()
            .map(|info| {
                let handle = OverlayHandle {
                    layer: layer.clone(),
                    band: info.name.clone(),
                    mapid: info.mapid,
                    token: info.token,
                };
                Band {
                    name: info.name,
                    handle,
                    opacity: Opacity::Hidden,
                    remaining_tiles: None,
                }
            })
            .collect();

        for i in 0..overlay.bands.len() {
            let opacity = overlay.target_opacity(i);
            let band = &mut overlay.bands[i];
            band.opacity = opacity;
            self.renderer.render_band(&band.handle, opacity);
        }

        info!(
            "overlay: {} ready with {} bands (replaced {})",
            layer,
            overlay.bands.len(),
            replaced
        );
        overlay.bands.len()
    }

    /// Failed request: keep whatever is displayed, mark the layer errored.
    pub fn fail(&mut self, layer: &LayerName) {
        let overlay = self
            .layers
            .entry(layer.clone())
            .or_insert_with(LayerOverlay::new);
        debug!("overlay: {} {:?} → Error", layer, overlay.state);
        overlay.state = LayerState::Error;
    }

    /// Check `band` and show it, leaving blank mode.  Unknown bands are
    /// ignored and return `false`.
    pub fn set_visible(&mut self, layer: &LayerName, band: &str) -> bool {
        let Some(overlay) = self.layers.get_mut(layer) else {
            return false;
        };
        let Some(index) = overlay.bands.iter().position(|b| b.name == band) else {
            debug!("overlay: {} has no band {:?}", layer, band);
            return false;
        };
        overlay.checked = Some(index);
        overlay.blank = false;
        overlay.sync(self.renderer.as_mut());
        true
    }

    /// Toggle blank mode.  Turning it off shows the checked band again.
    pub fn set_blank(&mut self, layer: &LayerName, enabled: bool) -> bool {
        let Some(overlay) = self.layers.get_mut(layer) else {
            return false;
        };
        overlay.blank = enabled;
        overlay.sync(self.renderer.as_mut());
        true
    }

    /// Record the renderer's outstanding tile count for one band.  Loading is
    /// reported per layer: `Loaded` only once every band is at zero.
    ///
    /// Only a `Ready` layer reports.  While a newer request is loading or the
    /// last one failed, the bands on screen are leftovers and their progress
    /// must not overwrite the layer's alert.
    pub fn on_tile_progress(
        &mut self,
        layer: &LayerName,
        band: &str,
        remaining: u32,
    ) -> Option<TileProgress> {
        let overlay = self.layers.get_mut(layer)?;
        let entry = overlay.bands.iter_mut().find(|b| b.name == band)?;
        entry.remaining_tiles = Some(remaining);
        trace!("overlay: {}/{} {} tiles remaining", layer, band, remaining);
        if overlay.state != LayerState::Ready {
            return None;
        }

        let all_loaded = overlay
            .bands
            .iter()
            .all(|b| b.remaining_tiles == Some(0));
        if all_loaded {
            Some(TileProgress::Loaded)
        } else {
            let remaining = overlay
                .bands
                .iter()
                .filter_map(|b| b.remaining_tiles)
                .sum();
            Some(TileProgress::Loading { remaining })
        }
    }

    /// Tear a layer down completely: cancel its in-flight request first so a
    /// late completion cannot re-add bands, then drop the cache entry, start
    /// removing its alert and detach its bands.
    pub fn remove_layer(
        &mut self,
        layer: &LayerName,
        registry: &mut RequestRegistry,
        cache: &mut LayerCache,
        alerts: &mut AlertBoard,
    ) -> LayerRemoval {
        let cancelled = registry.cancel(layer);
        cache.forget(layer);
        let alert_epoch = alerts.remove(&layer.alert_id());
        let bands = match self.layers.remove(layer) {
            Some(mut overlay) => overlay.detach_all(self.renderer.as_mut()),
            None => 0,
        };
        info!(
            "overlay: {} removed ({} bands, cancelled {:?})",
            layer, bands, cancelled
        );
        LayerRemoval {
            bands,
            cancelled,
            alert_epoch,
        }
    }

    pub fn state(&self, layer: &LayerName) -> LayerState {
        self.layers
            .get(layer)
            .map(|o| o.state)
            .unwrap_or(LayerState::Idle)
    }

    pub fn bands(&self, layer: &LayerName) -> &[Band] {
        self.layers
            .get(layer)
            .map(|o| o.bands.as_slice())
            .unwrap_or(&[])
    }

    pub fn visible_band(&self, layer: &LayerName) -> Option<&Band> {
        self.bands(layer)
            .iter()
            .find(|b| b.opacity == Opacity::Visible)
    }

    pub fn visible_count(&self, layer: &LayerName) -> usize {
        self.bands(layer)
            .iter()
            .filter(|b| b.opacity == Opacity::Visible)
            .count()
    }

    pub fn is_blank(&self, layer: &LayerName) -> bool {
        self.layers.get(layer).map(|o| o.blank).unwrap_or(false)
    }

    /// Band controls followed by the blank control.  A layer that has never
    /// produced bands still gets its blank control.
    pub fn controls(&self, layer: &LayerName) -> Vec<BandControl> {
        let (checked, blank) = match self.layers.get(layer) {
            Some(o) => (o.checked, o.blank),
            None => (None, false),
        };
        self.bands(layer)
            .iter()
            .enumerate()
            .map(|(i, b)| BandControl {
                name: b.name.clone(),
                checked: checked == Some(i),
            })
            .chain(std::iter::once(BandControl {
                name: BLANK_CONTROL.to_string(),
                checked: blank,
            }))
            .collect()
    }
}
