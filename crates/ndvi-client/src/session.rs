/// SessionCore: single-owner event loop for one user session.
///
/// The core owns the request registry, layer cache, overlays and alert board
/// exclusively.  Remote calls run as spawned tasks racing their cancellation
/// token and report back as `SessionEvent`s; the push channel does the same.
/// Because every mutation happens inside `handle_event`, a completion is
/// always checked against the registry before it can touch any state.
///
/// After each event that changes something observable the core broadcasts a
/// `SessionUpdate` so UIs can redraw.
use std::collections::HashMap;
use std::time::Duration;

use ndvi_proto::config::Config;
use ndvi_proto::configuration::{Configuration, ValidationError};
use ndvi_proto::protocol::{AlertMessage, BandInfo, OperationResponse};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::Command;
use crate::alerts::{Alert, AlertBoard, RemovalEpoch, Severity};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::layer_cache::LayerCache;
use crate::overlay::{Band, BandControl, BandRenderer, LayerState, OverlayManager, TileProgress};
use crate::registry::{Dispatch, Generation, RequestRegistry, Ticket};
use crate::remote::{RemoteClient, RemoteError};
use crate::LayerName;

const EVENT_CAPACITY: usize = 64;

// ── SessionEvent ──────────────────────────────────────────────────────────────

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    /// A layer request resolved.  Applied only if `generation` is still live.
    LayerCompleted {
        name: LayerName,
        generation: Generation,
        result: Result<Vec<BandInfo>, RemoteError>,
    },
    /// An auxiliary operation resolved.  `name` is its registry key, which
    /// is not always the id of the alert it reports under.
    OperationCompleted {
        name: LayerName,
        generation: Generation,
        result: Result<OperationResponse, RemoteError>,
        alert_id: String,
        on_success: OnSuccess,
    },
    /// Alert pushed by the server.
    Push(AlertMessage),
    /// The fade-out timer of a removed alert ran out.
    FadeElapsed { id: String, epoch: RemovalEpoch },
    /// The push channel is gone for good.
    ChannelClosed(Option<String>),
}

/// What an accepted auxiliary operation does to its alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSuccess {
    /// The server reports the outcome over the push channel.
    AwaitPush,
    /// Nothing follows; show this line.
    Show(&'static str),
    /// The server pushes only when it actually did something.  Hide the
    /// alert if it still reads `started`, i.e. no push replaced it.
    Withdraw { started: &'static str },
}

/// What observers see.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Alerts(Vec<Alert>),
    Bands {
        layer: LayerName,
        bands: Vec<Band>,
        controls: Vec<BandControl>,
    },
    LayerState {
        layer: LayerName,
        state: LayerState,
    },
    /// A command was refused before anything was dispatched.
    Rejected { target: String, reason: String },
    ChannelClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("session has shut down")]
    Closed,
}

// ── Auxiliary operations ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Operation {
    Chart(Configuration),
    Export(Configuration),
    Download(Configuration),
    CancelExport(String),
    DeleteExport(String),
}

impl Operation {
    fn alert_id(&self) -> String {
        match self {
            Operation::Chart(c) => format!("chart-{}", c.filename),
            Operation::Export(c) => format!("export-{}", c.filename),
            Operation::Download(c) => format!("download-{}", c.filename),
            Operation::CancelExport(task) => format!("cancel-{}", task),
            // The server confirms a delete under the export's id.
            Operation::DeleteExport(filename) => format!("export-{}", filename),
        }
    }

    /// Registry key.  Kept apart from the alert id so a delete never
    /// cancels the export request it shares an alert with.
    fn request_key(&self) -> LayerName {
        match self {
            Operation::DeleteExport(filename) => LayerName::new(format!("delete-{}", filename)),
            other => LayerName::new(other.alert_id()),
        }
    }

    fn started_line(&self) -> &'static str {
        match self {
            Operation::Chart(_) => "Calculating chart.",
            Operation::Export(_) => "Starting export.",
            Operation::Download(_) => "Preparing download.",
            Operation::CancelExport(_) => "Cancelling export.",
            Operation::DeleteExport(_) => "Deleting exported files.",
        }
    }

    fn on_success(&self) -> OnSuccess {
        match self {
            Operation::CancelExport(_) => OnSuccess::Show("Export cancelled."),
            Operation::DeleteExport(_) => OnSuccess::Withdraw {
                started: self.started_line(),
            },
            _ => OnSuccess::AwaitPush,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Operation::Chart(c) => {
                c.validate()?;
                c.require_point("chart").map(|_| ())
            }
            Operation::Export(c) => {
                c.validate()?;
                c.require_region("export").map(|_| ())
            }
            Operation::Download(c) => {
                c.validate()?;
                c.require_region("download").map(|_| ())
            }
            Operation::CancelExport(_) | Operation::DeleteExport(_) => Ok(()),
        }
    }

    fn fingerprint(&self) -> Fingerprint {
        match self {
            Operation::Chart(c) | Operation::Export(c) | Operation::Download(c) => fingerprint(c),
            Operation::CancelExport(target) | Operation::DeleteExport(target) => {
                Fingerprint::for_target(target)
            }
        }
    }

    async fn run(self, remote: RemoteClient) -> Result<OperationResponse, RemoteError> {
        match self {
            Operation::Chart(c) => remote.chart(&c).await,
            Operation::Export(c) => remote.export(&c).await,
            Operation::Download(c) => remote.download(&c).await,
            Operation::CancelExport(task) => remote.cancel_export(&task).await,
            Operation::DeleteExport(filename) => remote.delete_export(&filename).await,
        }
    }
}

// ── SessionHandle ─────────────────────────────────────────────────────────────

/// Cheap, cloneable front door to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.events
            .send(SessionEvent::Command(command))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Validate synchronously, then hand the configuration to the session.
    pub async fn configuration_changed(
        &self,
        layer: LayerName,
        config: Configuration,
    ) -> Result<(), SessionError> {
        config.validate()?;
        self.send(Command::ConfigurationChanged(layer, config)).await
    }

    pub async fn band_selected(&self, layer: LayerName, band: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::BandSelected(layer, band.into())).await
    }

    pub async fn blank_toggled(&self, layer: LayerName, enabled: bool) -> Result<(), SessionError> {
        self.send(Command::BlankToggled(layer, enabled)).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Sender for tasks that feed the loop directly, such as the push channel.
    pub fn event_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }
}

/// Build a session and spawn its loop.
pub fn start(
    config: &Config,
    remote: RemoteClient,
    renderer: Box<dyn BandRenderer>,
) -> (SessionHandle, JoinHandle<()>) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let (update_tx, _) = broadcast::channel(config.session.update_capacity.max(1));
    let handle = SessionHandle {
        events: event_tx.clone(),
        updates: update_tx.clone(),
    };
    let core = SessionCore::new(config, remote, renderer, event_tx, update_tx);
    let task = tokio::spawn(core.run(event_rx));
    (handle, task)
}

// ── SessionCore ───────────────────────────────────────────────────────────────

pub struct SessionCore {
    registry: RequestRegistry,
    cache: LayerCache,
    overlays: OverlayManager,
    alerts: AlertBoard,
    remote: RemoteClient,
    /// Last configuration seen per layer, for `Refresh`.
    configurations: HashMap<LayerName, Configuration>,
    fade_out: Duration,
    event_tx: mpsc::Sender<SessionEvent>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionCore {
    pub fn new(
        config: &Config,
        remote: RemoteClient,
        renderer: Box<dyn BandRenderer>,
        event_tx: mpsc::Sender<SessionEvent>,
        updates: broadcast::Sender<SessionUpdate>,
    ) -> Self {
        Self {
            registry: RequestRegistry::new(),
            cache: LayerCache::new(),
            overlays: OverlayManager::new(renderer),
            alerts: AlertBoard::new(),
            remote,
            configurations: HashMap::new(),
            fade_out: Duration::from_millis(config.alerts.fade_out_ms),
            event_tx,
            updates,
        }
    }

    /// Run until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) {
        info!("SessionCore: starting event loop (client {})", self.remote.client_id());
        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt) {
                info!("SessionCore: shutdown requested");
                break;
            }
        }
        self.registry.cancel_all();
        info!("SessionCore: stopped");
    }

    /// Apply one event.  Returns `false` when the loop should stop.
    pub fn handle_event(&mut self, evt: SessionEvent) -> bool {
        match evt {
            SessionEvent::Command(Command::Shutdown) => return false,
            SessionEvent::Command(cmd) => self.handle_command(cmd),
            SessionEvent::LayerCompleted {
                name,
                generation,
                result,
            } => self.on_layer_completed(name, generation, result),
            SessionEvent::OperationCompleted {
                name,
                generation,
                result,
                alert_id,
                on_success,
            } => self.on_operation_completed(name, generation, result, alert_id, on_success),
            SessionEvent::Push(message) => {
                debug!("SessionCore: push alert {}", message.id);
                self.alerts.upsert_message(message);
                self.publish_alerts();
            }
            SessionEvent::FadeElapsed { id, epoch } => {
                if self.alerts.removal_elapsed(&id, epoch) {
                    self.publish_alerts();
                }
            }
            SessionEvent::ChannelClosed(reason) => {
                warn!(
                    "SessionCore: push channel closed ({})",
                    reason.as_deref().unwrap_or("end of stream")
                );
                let _ = self.updates.send(SessionUpdate::ChannelClosed);
            }
        }
        true
    }

    fn handle_command(&mut self, cmd: Command) {
        debug!("SessionCore: command {:?}", cmd);
        match cmd {
            Command::ConfigurationChanged(layer, config) => {
                self.on_configuration_changed(layer, config)
            }
            Command::Refresh(layer) => self.on_refresh(layer),
            Command::RemoveLayer(layer) => self.on_remove_layer(layer),
            Command::BandSelected(layer, band) => self.on_band_selected(layer, &band),
            Command::BlankToggled(layer, enabled) => self.on_blank_toggled(layer, enabled),
            Command::TileProgress {
                layer,
                band,
                remaining,
            } => self.on_tile_progress(layer, &band, remaining),
            Command::AlertDismissed(id) => {
                if let Some(epoch) = self.alerts.remove(&id) {
                    self.schedule_fade(id, epoch);
                    self.publish_alerts();
                }
            }
            Command::AlertTransitionFinished(id) => {
                if self.alerts.transition_finished(&id) {
                    self.publish_alerts();
                }
            }
            Command::RequestChart(config) => self.start_operation(Operation::Chart(config)),
            Command::RequestExport(config) => self.start_operation(Operation::Export(config)),
            Command::RequestDownload(config) => self.start_operation(Operation::Download(config)),
            Command::CancelExport(task) => self.start_operation(Operation::CancelExport(task)),
            Command::DeleteExport(filename) => {
                self.start_operation(Operation::DeleteExport(filename))
            }
            Command::Shutdown => {}
        }
    }

    // ── Layer requests ────────────────────────────────────────────────────────

    pub fn on_configuration_changed(&mut self, layer: LayerName, config: Configuration) {
        if let Err(e) = config.validate() {
            self.reject(layer.to_string(), e);
            return;
        }
        self.configurations.insert(layer.clone(), config.clone());
        match self.registry.dispatch(&mut self.cache, &layer, &config) {
            Dispatch::Unchanged => {}
            Dispatch::Issued { ticket, superseded } => {
                if let Some(old) = superseded {
                    info!("SessionCore: {} superseded generation {}", layer, old);
                }
                self.spawn_layer_request(ticket, config);
            }
        }
    }

    fn on_refresh(&mut self, layer: LayerName) {
        let Some(config) = self.configurations.get(&layer).cloned() else {
            debug!("SessionCore: refresh of unknown layer {}", layer);
            return;
        };
        self.cache.forget(&layer);
        self.on_configuration_changed(layer, config);
    }

    fn spawn_layer_request(&mut self, ticket: Ticket, config: Configuration) {
        let Ticket {
            name,
            generation,
            cancel,
            ..
        } = ticket;

        self.overlays.begin_loading(&name);
        self.alerts
            .upsert(name.alert_id(), Severity::Info, "Computing layer.", None);
        self.publish_layer_state(&name);
        self.publish_alerts();

        let remote = self.remote.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("layer request {} generation {} aborted", name, generation);
                    return;
                }
                result = remote.request_layer(&config) => result,
            };
            let _ = tx
                .send(SessionEvent::LayerCompleted {
                    name,
                    generation,
                    result,
                })
                .await;
        });
    }

    fn on_layer_completed(
        &mut self,
        name: LayerName,
        generation: Generation,
        result: Result<Vec<BandInfo>, RemoteError>,
    ) {
        if self.registry.settle(&name, generation).is_none() {
            return;
        }
        match result {
            Ok(bands) => {
                self.overlays.apply_result(&name, bands);
                if let Some(epoch) = self.alerts.remove(&name.alert_id()) {
                    self.schedule_fade(name.alert_id(), epoch);
                }
                self.publish_bands(&name);
            }
            Err(e) => {
                warn!("SessionCore: layer {} failed: {}", name, e);
                self.overlays.fail(&name);
                // Let the same configuration be retried.
                self.cache.forget(&name);
                self.alerts.upsert(
                    name.alert_id(),
                    Severity::Danger,
                    e.headline(),
                    Some(e.message().to_string()),
                );
            }
        }
        self.publish_layer_state(&name);
        self.publish_alerts();
    }

    fn on_remove_layer(&mut self, layer: LayerName) {
        let removal = self.overlays.remove_layer(
            &layer,
            &mut self.registry,
            &mut self.cache,
            &mut self.alerts,
        );
        self.configurations.remove(&layer);
        if let Some(epoch) = removal.alert_epoch {
            self.schedule_fade(layer.alert_id(), epoch);
        }
        self.publish_bands(&layer);
        self.publish_layer_state(&layer);
        self.publish_alerts();
    }

    // ── Band controls ─────────────────────────────────────────────────────────

    pub fn on_band_selected(&mut self, layer: LayerName, band: &str) {
        if self.overlays.set_visible(&layer, band) {
            self.publish_bands(&layer);
        }
    }

    pub fn on_blank_toggled(&mut self, layer: LayerName, enabled: bool) {
        if self.overlays.set_blank(&layer, enabled) {
            self.publish_bands(&layer);
        }
    }

    fn on_tile_progress(&mut self, layer: LayerName, band: &str, remaining: u32) {
        match self.overlays.on_tile_progress(&layer, band, remaining) {
            Some(TileProgress::Loading { remaining }) => {
                self.alerts.upsert(
                    layer.alert_id(),
                    Severity::Info,
                    format!("{} tiles remaining.", remaining),
                    None,
                );
                self.publish_alerts();
            }
            Some(TileProgress::Loaded) => {
                if let Some(epoch) = self.alerts.remove(&layer.alert_id()) {
                    self.schedule_fade(layer.alert_id(), epoch);
                    self.publish_alerts();
                }
            }
            None => {}
        }
    }

    // ── Auxiliary operations ──────────────────────────────────────────────────

    fn start_operation(&mut self, operation: Operation) {
        let id = operation.alert_id();
        if let Err(e) = operation.validate() {
            self.reject(id, e);
            return;
        }
        let name = operation.request_key();
        let ticket = self.registry.issue(&name, operation.fingerprint());
        self.alerts
            .upsert(id.clone(), Severity::Info, operation.started_line(), None);
        self.publish_alerts();

        let remote = self.remote.clone();
        let tx = self.event_tx.clone();
        let Ticket {
            generation, cancel, ..
        } = ticket;
        let on_success = operation.on_success();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("operation {} generation {} aborted", name, generation);
                    return;
                }
                result = operation.run(remote) => result,
            };
            let _ = tx
                .send(SessionEvent::OperationCompleted {
                    name,
                    generation,
                    result,
                    alert_id: id,
                    on_success,
                })
                .await;
        });
    }

    fn on_operation_completed(
        &mut self,
        name: LayerName,
        generation: Generation,
        result: Result<OperationResponse, RemoteError>,
        id: String,
        on_success: OnSuccess,
    ) {
        if self.registry.settle(&name, generation).is_none() {
            return;
        }
        match result {
            Ok(response) => {
                info!("SessionCore: operation {} accepted", name);
                if let Some(url) = &response.url {
                    debug!("SessionCore: {} returned {}", name, url);
                }
                match on_success {
                    OnSuccess::AwaitPush => {}
                    OnSuccess::Show(line) => {
                        self.alerts.upsert(id, Severity::Success, line, None);
                        self.publish_alerts();
                    }
                    OnSuccess::Withdraw { started } => {
                        let untouched = self
                            .alerts
                            .find(&id)
                            .is_some_and(|a| a.visible && a.line1 == started);
                        if untouched {
                            debug!("SessionCore: {} changed nothing, withdrawing {}", name, id);
                            if let Some(epoch) = self.alerts.remove(&id) {
                                self.schedule_fade(id, epoch);
                            }
                            self.publish_alerts();
                        }
                    }
                }
            }
            Err(e) => {
                warn!("SessionCore: operation {} failed: {}", id, e);
                self.alerts.upsert(
                    id,
                    Severity::Danger,
                    e.headline(),
                    Some(e.message().to_string()),
                );
                self.publish_alerts();
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn reject(&mut self, target: String, err: ValidationError) {
        warn!("SessionCore: rejected {}: {}", target, err);
        let _ = self.updates.send(SessionUpdate::Rejected {
            target,
            reason: err.to_string(),
        });
    }

    fn schedule_fade(&self, id: String, epoch: RemovalEpoch) {
        if self.fade_out.is_zero() {
            return;
        }
        let delay = self.fade_out;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionEvent::FadeElapsed { id, epoch }).await;
        });
    }

    fn publish_alerts(&self) {
        let _ = self
            .updates
            .send(SessionUpdate::Alerts(self.alerts.snapshot()));
    }

    fn publish_bands(&self, layer: &LayerName) {
        let _ = self.updates.send(SessionUpdate::Bands {
            layer: layer.clone(),
            bands: self.overlays.bands(layer).to_vec(),
            controls: self.overlays.controls(layer),
        });
    }

    fn publish_layer_state(&self, layer: &LayerName) {
        let _ = self.updates.send(SessionUpdate::LayerState {
            layer: layer.clone(),
            state: self.overlays.state(layer),
        });
    }

    pub fn alerts(&self) -> &AlertBoard {
        &self.alerts
    }

    pub fn overlays(&self) -> &OverlayManager {
        &self.overlays
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }
}
