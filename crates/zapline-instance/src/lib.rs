use chrono::{DateTime, Utc};

/// Persisted bot identifier. Also the key of the live instance table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct BotId(pub i32);

impl std::fmt::Display for BotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one worker instance.
///
/// `starting -> connecting -> {qr_ready -> active} | error`, and any state may
/// move to `stopped`. `error` and `stopped` are terminal for a given instance
/// record; a restart always produces a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Connecting,
    QrReady,
    Active,
    Error,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Connecting => "connecting",
            InstanceStatus::QrReady => "qr_ready",
            InstanceStatus::Active => "active",
            InstanceStatus::Error => "error",
            InstanceStatus::Stopped => "stopped",
        }
    }

    /// Value written to the bot record's `status` column.
    pub fn persisted_label(self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "inactive",
            other => other.as_str(),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Error | InstanceStatus::Stopped)
    }

    fn progress(self) -> Option<u8> {
        match self {
            InstanceStatus::Starting => Some(0),
            InstanceStatus::Connecting => Some(1),
            InstanceStatus::QrReady => Some(2),
            InstanceStatus::Active => Some(3),
            InstanceStatus::Error | InstanceStatus::Stopped => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal state change.
    /// Staying in the same state is not a change and returns false.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        if self == next {
            return false;
        }
        match (self, next) {
            (InstanceStatus::Stopped, _) => false,
            (InstanceStatus::Error, InstanceStatus::Stopped) => true,
            (InstanceStatus::Error, _) => false,
            (_, InstanceStatus::Error | InstanceStatus::Stopped) => true,
            (from, to) => match (from.progress(), to.progress()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// Maps the free-form status string reported by a worker's control API.
    /// Returns `None` for values the supervisor does not recognise.
    pub fn from_worker(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "initializing" | "starting" | "connecting" | "authenticated" => {
                Some(InstanceStatus::Connecting)
            }
            "qr_ready" | "qr" => Some(InstanceStatus::QrReady),
            "ready" | "active" | "connected" => Some(InstanceStatus::Active),
            "auth_failure" | "disconnected" | "error" => Some(InstanceStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceSnapshot {
    pub bot_id: BotId,
    pub generation: u64,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub qr_code: Option<String>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
}
