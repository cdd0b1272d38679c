//! ---
//! ward_section: "01-core-functionality"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Typed notifications published by the resilience core."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use ward_persistence::{BackupInfo, BackupKind};
use ward_resilience::{
    DegradationTrigger, Fault, ModeChange, OperationMode, RecoveryResult, RecoveryStrategy,
};

/// Everything the core announces to UI-side subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    ModeChanged {
        mode: OperationMode,
        previous: OperationMode,
        reason: String,
        trigger: DegradationTrigger,
    },
    BackupCompleted {
        info: BackupInfo,
    },
    BackupFailed {
        kind: BackupKind,
        reason: String,
    },
    IssuesDetected {
        scope: String,
        total: usize,
        critical: usize,
    },
    RecoveryFinished {
        fault: Fault,
        strategy: RecoveryStrategy,
        result: RecoveryResult,
    },
    /// A fault survived recovery or needs the user.
    AlertRaised {
        fault: Fault,
        message: String,
        requires_user: bool,
    },
    RestartRequested {
        fault: Fault,
    },
}

impl ResilienceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::ModeChanged { .. } => "mode_changed",
            ResilienceEvent::BackupCompleted { .. } => "backup_completed",
            ResilienceEvent::BackupFailed { .. } => "backup_failed",
            ResilienceEvent::IssuesDetected { .. } => "issues_detected",
            ResilienceEvent::RecoveryFinished { .. } => "recovery_finished",
            ResilienceEvent::AlertRaised { .. } => "alert_raised",
            ResilienceEvent::RestartRequested { .. } => "restart_requested",
        }
    }
}

impl From<ModeChange> for ResilienceEvent {
    fn from(change: ModeChange) -> Self {
        ResilienceEvent::ModeChanged {
            mode: change.mode,
            previous: change.previous,
            reason: change.reason,
            trigger: change.trigger,
        }
    }
}

/// Broadcast channel carrying [`ResilienceEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: ResilienceEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(target: "ward::events", event = name, receivers, "event published"),
            Err(_) => trace!(target: "ward::events", event = name, "event dropped; no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }
}
