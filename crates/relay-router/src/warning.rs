//! In-memory warning store.
//!
//! The core only ever writes warnings; operators read and acknowledge them
//! through the stats surface. Old entries are aged out so the store stays
//! bounded.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use relay_core::{Warning, WarningKind, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Warnings older than this are dropped by cleanup.
    pub max_warning_age_hours: i64,
    /// Hard cap on stored warnings; oldest 10% dropped when reached.
    pub max_warnings: usize,
    /// Warnings older than this are auto-acknowledged by cleanup.
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
            auto_acknowledge_hours: 8,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_warning(
        &self,
        kind: WarningKind,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(kind, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::drop_oldest(&mut warnings);
        }

        debug!(id = %id, kind = ?kind, severity = ?severity, "Warning recorded");
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn by_kind(&self, kind: WarningKind) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect()
    }

    pub fn by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn unacknowledged(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(chrono::Utc::now());
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .count()
    }

    pub fn has_critical(&self) -> bool {
        self.warnings
            .read()
            .values()
            .any(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
    }

    /// Periodic maintenance: auto-acknowledge stale warnings, drop ancient
    /// ones.
    pub fn cleanup(&self) {
        let auto_ack_minutes = self.config.auto_acknowledge_hours * 60;
        let max_age_minutes = self.config.max_warning_age_hours * 60;

        let mut warnings = self.warnings.write();
        let now = chrono::Utc::now();

        for warning in warnings.values_mut() {
            if !warning.acknowledged && warning.age_minutes() > auto_ack_minutes {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
            }
        }

        let before = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= max_age_minutes);
        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed, "Cleared old warnings");
        }
    }

    fn drop_oldest(warnings: &mut HashMap<String, Warning>) {
        let to_remove = warnings.len() / 10;
        if to_remove == 0 {
            return;
        }

        let mut by_age: Vec<_> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        for (id, _) in by_age.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}
