//! Alert board: keyed, user-visible notifications.
//!
//! Alerts are identified by id and kept in insertion order.  Setting an id
//! that already exists rewrites that alert in place.  Removal is two-phase:
//! `remove` hides the alert and hands out a removal epoch, and the alert is
//! only deleted once the fade-out is confirmed.  An upsert in between wins
//! and brings the alert back.

use chrono::{DateTime, Local};
use ndvi_proto::protocol::AlertMessage;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Danger,
}

impl Severity {
    /// Map a push-channel style name.  Unknown styles render as info.
    pub fn from_style(style: &str) -> Self {
        match style {
            "success" => Severity::Success,
            "warning" => Severity::Warning,
            "danger" | "error" => Severity::Danger,
            "info" => Severity::Info,
            other => {
                debug!("alerts: unknown style {:?}, using info", other);
                Severity::Info
            }
        }
    }

    pub fn as_style(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        }
    }
}

/// Token for one hide → delete cycle of an alert.
pub type RemovalEpoch = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub line1: String,
    pub line2: Option<String>,
    pub visible: bool,
    pub updated_at: DateTime<Local>,
    removal: Option<RemovalEpoch>,
}

impl Alert {
    /// True while hidden and waiting for its fade-out to finish.
    pub fn is_pending_removal(&self) -> bool {
        self.removal.is_some()
    }
}

#[derive(Debug, Default)]
pub struct AlertBoard {
    alerts: Vec<Alert>,
    next_epoch: RemovalEpoch,
}

impl AlertBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the alert `id` and make it visible.  Returns `true`
    /// when a new entry was appended.
    pub fn upsert(
        &mut self,
        id: impl Into<String>,
        severity: Severity,
        line1: impl Into<String>,
        line2: Option<String>,
    ) -> bool {
        let id = id.into();
        let line1 = line1.into();
        let now = Local::now();

        if let Some(alert) = self.alerts.iter_mut().find(|a| a.id == id) {
            if alert.removal.take().is_some() {
                debug!("alerts: {} re-set while fading out, removal cancelled", id);
            }
            alert.severity = severity;
            alert.line1 = line1;
            alert.line2 = line2;
            alert.visible = true;
            alert.updated_at = now;
            return false;
        }

        debug!("alerts: {} created ({})", id, severity.as_style());
        self.alerts.push(Alert {
            id,
            severity,
            line1,
            line2,
            visible: true,
            updated_at: now,
            removal: None,
        });
        true
    }

    /// Upsert straight from a push-channel message.
    pub fn upsert_message(&mut self, message: AlertMessage) -> bool {
        let severity = Severity::from_style(&message.style);
        self.upsert(message.id, severity, message.line1, message.line2)
    }

    /// Hide the alert and start its removal.  Returns the epoch the fade-out
    /// confirmation must carry, or `None` if there is no such alert.  Calling
    /// it again while already fading keeps the original epoch.
    pub fn remove(&mut self, id: &str) -> Option<RemovalEpoch> {
        let alert = self.alerts.iter_mut().find(|a| a.id == id)?;
        if let Some(epoch) = alert.removal {
            return Some(epoch);
        }
        self.next_epoch += 1;
        alert.visible = false;
        alert.removal = Some(self.next_epoch);
        debug!("alerts: {} hidden, removal epoch {}", id, self.next_epoch);
        Some(self.next_epoch)
    }

    /// The renderer finished fading `id` out.  Deletes it unless it was
    /// re-set in the meantime.
    pub fn transition_finished(&mut self, id: &str) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|a| !(a.id == id && a.removal.is_some()));
        let deleted = self.alerts.len() != before;
        if deleted {
            debug!("alerts: {} deleted", id);
        }
        deleted
    }

    /// Timer-driven variant: only deletes if the alert is still in the same
    /// removal cycle that scheduled the timer.
    pub fn removal_elapsed(&mut self, id: &str, epoch: RemovalEpoch) -> bool {
        let current = self.find(id).and_then(|a| a.removal);
        if current != Some(epoch) {
            return false;
        }
        self.transition_finished(id)
    }

    pub fn find(&self, id: &str) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    /// All alerts in insertion order, including ones that are fading out.
    pub fn iter(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    pub fn visible(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.visible)
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts.clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut board = AlertBoard::new();
        assert!(board.upsert("layer-ndvi", Severity::Info, "Loading layer.", None));
        assert!(board.upsert("export-a", Severity::Info, "Export started.", None));
        assert!(!board.upsert(
            "layer-ndvi",
            Severity::Danger,
            "Layer failed.",
            Some("quota exceeded".to_string())
        ));

        assert_eq!(board.len(), 2);
        let alert = board.find("layer-ndvi").unwrap();
        assert_eq!(alert.severity, Severity::Danger);
        assert_eq!(alert.line1, "Layer failed.");
        assert_eq!(alert.line2.as_deref(), Some("quota exceeded"));
        // Position is kept.
        assert_eq!(board.iter().next().unwrap().id, "layer-ndvi");
    }

    #[test]
    fn test_remove_waits_for_transition() {
        let mut board = AlertBoard::new();
        board.upsert("layer-ndvi", Severity::Info, "Loading layer.", None);

        let epoch = board.remove("layer-ndvi").unwrap();
        let alert = board.find("layer-ndvi").unwrap();
        assert!(!alert.visible);
        assert!(alert.is_pending_removal());
        assert_eq!(board.visible().count(), 0);
        assert_eq!(board.remove("layer-ndvi"), Some(epoch));

        assert!(board.transition_finished("layer-ndvi"));
        assert!(board.find("layer-ndvi").is_none());
        assert_eq!(board.remove("layer-ndvi"), None);
    }

    #[test]
    fn test_upsert_during_fade_cancels_deletion() {
        let mut board = AlertBoard::new();
        board.upsert("chart-a", Severity::Info, "Chart in progress.", None);
        let epoch = board.remove("chart-a").unwrap();

        board.upsert("chart-a", Severity::Success, "Chart ready.", None);
        assert!(!board.transition_finished("chart-a"));
        assert!(!board.removal_elapsed("chart-a", epoch));

        let alert = board.find("chart-a").unwrap();
        assert!(alert.visible);
        assert_eq!(alert.severity, Severity::Success);
        assert_eq!(alert.line1, "Chart ready.");
    }

    #[test]
    fn test_stale_timer_does_not_cut_second_fade_short() {
        let mut board = AlertBoard::new();
        board.upsert("export-a", Severity::Info, "Export running.", None);
        let first = board.remove("export-a").unwrap();
        board.upsert("export-a", Severity::Info, "Export running.", None);
        let second = board.remove("export-a").unwrap();
        assert_ne!(first, second);

        assert!(!board.removal_elapsed("export-a", first));
        assert!(board.find("export-a").is_some());
        assert!(board.removal_elapsed("export-a", second));
        assert!(board.find("export-a").is_none());
    }

    #[test]
    fn test_push_message_styles() {
        let mut board = AlertBoard::new();
        board.upsert_message(AlertMessage {
            id: "layer-ndvi".to_string(),
            style: "warning".to_string(),
            line1: "3 tiles remaining.".to_string(),
            line2: None,
        });
        board.upsert_message(AlertMessage {
            id: "odd".to_string(),
            style: "sparkly".to_string(),
            line1: "?".to_string(),
            line2: Some("second".to_string()),
        });
        assert_eq!(board.find("layer-ndvi").unwrap().severity, Severity::Warning);
        assert_eq!(board.find("odd").unwrap().severity, Severity::Info);
        assert_eq!(Severity::from_style("danger").as_style(), "danger");
    }
}
