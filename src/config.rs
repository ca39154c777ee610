//! History settings and per-branch override resolution.
//!
//! Global settings are held behind a `SettingsHandle` and injected into
//! every operation; a branch may carry a partial override that applies
//! only when the global config is not marked `is_global`.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

/// Global history settings supplied by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySettings {
    /// Maximum versions retained per note branch
    pub max_versions_per_note: u32,
    /// Whether age-based cleanup is enabled
    pub auto_cleanup_old_versions: bool,
    /// Age threshold in days for age-based cleanup
    pub auto_cleanup_days: u32,
    /// Whether branches are exported to on-disk archives
    pub enable_disk_persistence: bool,
    /// When true, branch-level overrides are ignored
    pub is_global: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_versions_per_note: 50,
            auto_cleanup_old_versions: false,
            auto_cleanup_days: 30,
            enable_disk_persistence: true,
            is_global: true,
        }
    }
}

/// Partial per-branch settings stored inside a branch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_versions_per_note: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cleanup_old_versions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cleanup_days: Option<u32>,
}

impl HistorySettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_versions_per_note == 0 {
            return Err(HistoryError::InvalidState(
                "maxVersionsPerNote must be greater than zero".into(),
            ));
        }
        if self.auto_cleanup_days == 0 {
            return Err(HistoryError::InvalidState(
                "autoCleanupDays must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the settings in effect for a branch. Branch overrides apply
    /// only when the global config is not marked `is_global`.
    pub fn effective(&self, branch: Option<&BranchSettings>) -> HistorySettings {
        let mut resolved = self.clone();
        if self.is_global {
            return resolved;
        }
        if let Some(overrides) = branch {
            if let Some(max) = overrides.max_versions_per_note {
                resolved.max_versions_per_note = max;
            }
            if let Some(auto) = overrides.auto_cleanup_old_versions {
                resolved.auto_cleanup_old_versions = auto;
            }
            if let Some(days) = overrides.auto_cleanup_days {
                resolved.auto_cleanup_days = days;
            }
        }
        resolved
    }
}

/// Shared settings handle. Operations take a snapshot at the point they
/// need one; updates are validated before they land.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<HistorySettings>>,
}

impl SettingsHandle {
    pub fn new(settings: HistorySettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> HistorySettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn update(&self, settings: HistorySettings) -> Result<()> {
        settings.validate()?;
        *self.inner.write().expect("settings lock poisoned") = settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_overrides_ignored_when_global() {
        let global = HistorySettings {
            max_versions_per_note: 10,
            is_global: true,
            ..Default::default()
        };
        let overrides = BranchSettings {
            max_versions_per_note: Some(3),
            ..Default::default()
        };
        assert_eq!(global.effective(Some(&overrides)).max_versions_per_note, 10);
    }

    #[test]
    fn test_branch_overrides_applied_when_not_global() {
        let global = HistorySettings {
            max_versions_per_note: 10,
            is_global: false,
            ..Default::default()
        };
        let overrides = BranchSettings {
            max_versions_per_note: Some(3),
            auto_cleanup_old_versions: Some(true),
            auto_cleanup_days: None,
        };
        let eff = global.effective(Some(&overrides));
        assert_eq!(eff.max_versions_per_note, 3);
        assert!(eff.auto_cleanup_old_versions);
        assert_eq!(eff.auto_cleanup_days, global.auto_cleanup_days);
    }

    #[test]
    fn test_zero_max_versions_rejected() {
        let handle = SettingsHandle::new(HistorySettings::default());
        let bad = HistorySettings {
            max_versions_per_note: 0,
            ..Default::default()
        };
        assert!(handle.update(bad).is_err());
        assert_eq!(handle.snapshot(), HistorySettings::default());
    }
}
