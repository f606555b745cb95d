//! Lookup of per-subject agent settings.

use cadence_types::agent::AgentSettings;
use dashmap::DashMap;

/// Read-only source of the agent settings governing a subject.
pub trait SettingsSource: Send + Sync {
    /// Settings for `subject_id`, already clamped.
    fn settings_for(&self, subject_id: &str) -> AgentSettings;
}

impl SettingsSource for AgentSettings {
    fn settings_for(&self, _subject_id: &str) -> AgentSettings {
        self.clamped()
    }
}

/// A default plus per-subject overrides.
pub struct SubjectSettings {
    default: AgentSettings,
    overrides: DashMap<String, AgentSettings>,
}

impl SubjectSettings {
    pub fn new(default: AgentSettings) -> Self {
        Self {
            default,
            overrides: DashMap::new(),
        }
    }

    pub fn set(&self, subject_id: impl Into<String>, settings: AgentSettings) {
        self.overrides.insert(subject_id.into(), settings);
    }

    pub fn clear(&self, subject_id: &str) {
        self.overrides.remove(subject_id);
    }
}

impl SettingsSource for SubjectSettings {
    fn settings_for(&self, subject_id: &str) -> AgentSettings {
        self.overrides
            .get(subject_id)
            .map(|s| s.clamped())
            .unwrap_or_else(|| self.default.clamped())
    }
}
