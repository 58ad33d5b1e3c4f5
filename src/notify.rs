// =============================================================================
// Notifications — operator alerts with per-key rate limiting
// =============================================================================
//
// The push channel itself (Pushover) is an external collaborator; in-tree the
// engine talks to a `Notifier` trait and ships a tracing-backed
// implementation. Env toggles follow the QTSW2_* convention with legacy
// PUSHOVER_* fallback.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

/// Alert priority. Critical bypasses rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, priority: Priority, title: &str, message: &str);
}

/// Push-channel credentials and toggles resolved from the environment.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub user_key: Option<String>,
    pub app_token: Option<String>,
}

impl NotifyConfig {
    /// Resolve from env. `QTSW2_PUSHOVER_*` wins over legacy `PUSHOVER_*`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("QTSW2_PUSHOVER_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let user_key = std::env::var("QTSW2_PUSHOVER_USER_KEY")
            .or_else(|_| std::env::var("PUSHOVER_USER_KEY"))
            .ok();
        let app_token = std::env::var("QTSW2_PUSHOVER_APP_TOKEN")
            .or_else(|_| std::env::var("PUSHOVER_APP_TOKEN"))
            .ok();
        Self {
            enabled,
            user_key,
            app_token,
        }
    }
}

/// Default notifier: structured log lines, rate-limited per title so a
/// repeating condition cannot flood the event log.
pub struct LogNotifier {
    min_interval: Duration,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl LogNotifier {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    fn should_emit(&self, key: &str) -> bool {
        let mut map = self.last_emitted.lock();
        let now = Instant::now();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, priority: Priority, title: &str, message: &str) {
        if priority != Priority::Critical && !self.should_emit(title) {
            return;
        }
        match priority {
            Priority::Normal => info!(priority = %priority, title, "{message}"),
            Priority::High => warn!(priority = %priority, title, "{message}"),
            Priority::Critical => error!(priority = %priority, title, "{message}"),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Captures notifications for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(Priority, String, String)>>,
    }

    impl RecordingNotifier {
        pub fn count_titled(&self, title: &str) -> usize {
            self.sent.lock().iter().filter(|(_, t, _)| t == title).count()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, priority: Priority, title: &str, message: &str) {
            self.sent
                .lock()
                .push((priority, title.to_string(), message.to_string()));
        }
    }
}
