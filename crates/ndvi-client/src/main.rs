//! `ndvi-session`: headless driver for one NDVI trend session.
//!
//! Dispatches a single configuration built from the config file defaults and
//! the command line, then logs every session update until Ctrl-C.

use std::time::Duration;

use clap::Parser;
use ndvi_client::channel::NotificationChannel;
use ndvi_client::overlay::LoggingRenderer;
use ndvi_client::remote::{generate_client_id, RemoteClient};
use ndvi_client::session::{self, SessionUpdate};
use ndvi_client::LayerName;
use ndvi_proto::config::{Config, DefaultsConfig};
use ndvi_proto::configuration::{parse_point, parse_region, Configuration, ValidationError};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compute an NDVI trend layer and follow its alerts")]
struct Args {
    /// Layer to dispatch (default: session.layer_name from the config file)
    #[arg(long)]
    layer: Option<String>,

    /// Point of interest: "lon,lat"
    #[arg(long)]
    point: Option<String>,

    /// Region polygon as JSON: "[[lon,lat],[lon,lat],[lon,lat]]"
    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    start: Option<i32>,

    #[arg(long)]
    end: Option<i32>,

    /// Sensor collection (e.g. land5, land7, all)
    #[arg(long)]
    source: Option<String>,

    /// Regression model (e.g. linear, poly1)
    #[arg(long)]
    regression: Option<String>,

    /// Cloud score threshold, clamped into 1..=100
    #[arg(long)]
    cloudscore: Option<i64>,

    #[arg(long)]
    filename: Option<String>,
}

impl Args {
    fn configuration(&self, defaults: &DefaultsConfig) -> Result<Configuration, ValidationError> {
        let mut config = defaults.configuration();
        if let Some(start) = self.start {
            config.start = start;
        }
        if let Some(end) = self.end {
            config.end = end;
        }
        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if let Some(regression) = &self.regression {
            config.regression = regression.clone();
        }
        if let Some(filename) = &self.filename {
            config.filename = filename.clone();
        }
        if let Some(cloudscore) = self.cloudscore {
            config = config.with_cloudscore(cloudscore);
        }
        if let Some(point) = &self.point {
            config = config.with_point(parse_point(point)?);
        }
        if let Some(region) = &self.region {
            config = config.with_region(parse_region(region)?);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = ndvi_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("session.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // Allow RUST_LOG override; keep HTTP client internals quiet by default.
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,hyper_util=warn,reqwest=warn,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("ndvi-session log: {}", log_path.display());
    info!("ndvi-session starting…");

    // ── Load config ──────────────────────────────────────────────────────────
    let config = Config::load().unwrap_or_default();
    let configuration = args.configuration(&config.defaults)?;
    let layer = LayerName::from(
        args.layer
            .clone()
            .unwrap_or_else(|| config.session.layer_name.clone()),
    );

    // ── Session ──────────────────────────────────────────────────────────────
    let client_id = generate_client_id();
    let connect_timeout = Duration::from_millis(config.backend.connect_timeout_ms);
    let remote = RemoteClient::new(&config.backend.base_url, &client_id, connect_timeout)?;
    let (handle, core_task) = session::start(&config, remote, Box::new(LoggingRenderer));
    let mut updates = handle.subscribe();

    // ── Push channel ─────────────────────────────────────────────────────────
    match NotificationChannel::connect(&config.backend.push_address, &client_id, connect_timeout)
        .await
    {
        Ok(channel) => {
            channel.spawn(handle.event_sender());
        }
        Err(e) => {
            warn!("continuing without push alerts: {}", e);
            eprintln!("ndvi-session: {}", e);
        }
    }

    handle.configuration_changed(layer, configuration).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => log_update(&update),
                Err(RecvError::Lagged(n)) => warn!("missed {} session updates", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = handle.shutdown().await;
    let _ = core_task.await;
    Ok(())
}

fn log_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::Alerts(alerts) => {
            for alert in alerts.iter().filter(|a| a.visible) {
                info!(
                    "alert {} [{}] {}{}",
                    alert.id,
                    alert.severity.as_style(),
                    alert.line1,
                    alert
                        .line2
                        .as_deref()
                        .map(|l| format!(" / {}", l))
                        .unwrap_or_default()
                );
            }
        }
        SessionUpdate::Bands { layer, controls, .. } => {
            let names: Vec<String> = controls
                .iter()
                .map(|c| {
                    if c.checked {
                        format!("[{}]", c.name)
                    } else {
                        c.name.clone()
                    }
                })
                .collect();
            info!("layer {} bands: {}", layer, names.join(" "));
        }
        SessionUpdate::LayerState { layer, state } => info!("layer {} is {:?}", layer, state),
        SessionUpdate::Rejected { target, reason } => warn!("rejected {}: {}", target, reason),
        SessionUpdate::ChannelClosed => warn!("push channel closed"),
    }
}
