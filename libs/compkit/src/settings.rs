use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Container tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSettings {
    /// How often the progress reporter lists the components still being
    /// constructed.
    #[serde(default = "default_progress_report_period_secs")]
    pub progress_report_period_secs: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            progress_report_period_secs: default_progress_report_period_secs(),
        }
    }
}

impl ContextSettings {
    pub(crate) fn progress_report_period(&self) -> Duration {
        Duration::from_secs(self.progress_report_period_secs)
    }
}

fn default_progress_report_period_secs() -> u64 {
    10
}
