use serde::{Deserialize, Serialize};

/// Monitor tunables, persisted inside the encrypted registry payload. The
/// embedding shell edits these; the service validates before accepting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_relock_cycles")]
    pub relock_after_idle_cycles: u32,
    /// Critical files kept immutable while the monitor runs.
    #[serde(default)]
    pub protected_paths: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_audit_interval_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_relock_cycles() -> u32 {
    10
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            audit_interval_secs: default_audit_interval_secs(),
            max_attempts: default_max_attempts(),
            relock_after_idle_cycles: default_relock_cycles(),
            protected_paths: vec![],
        }
    }
}

impl MonitorSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(200..=10_000).contains(&self.poll_interval_ms) {
            anyhow::bail!("poll interval must be between 200 and 10000 ms");
        }
        if !(5..=3600).contains(&self.audit_interval_secs) {
            anyhow::bail!("audit interval must be between 5 and 3600 seconds");
        }
        if !(1..=10).contains(&self.max_attempts) {
            anyhow::bail!("max password attempts must be between 1 and 10");
        }
        if self.relock_after_idle_cycles == 0 {
            anyhow::bail!("relock cycle count must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MonitorSettings::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_rejected() {
        let mut s = MonitorSettings::default();
        s.poll_interval_ms = 50;
        assert!(s.validate().is_err());
        s.poll_interval_ms = 1000;
        s.max_attempts = 0;
        assert!(s.validate().is_err());
    }
}
