//! Status condition shape shared by every resource that carries a
//! conjunction of boolean conditions. Mirrors `metav1.Condition`,
//! the same shape the pack's `kaniop` operator manipulates through a
//! per-resource `status` submodule.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Condition {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: 0,
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// A small ordered set of conditions, keyed by `type`. Setting a
/// condition that already exists with the same status is a no-op aside
/// from refreshing `reason`/`message`/`observed_generation` — it does not
/// bump `last_transition_time`, matching the usual Kubernetes condition
/// idiom of only touching the transition time when `status` itself flips.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    pub fn set(&mut self, type_: &str, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>, observed_generation: i64) {
        let reason = reason.into();
        let message = message.into();
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                let status_changed = existing.status != status;
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.observed_generation = observed_generation;
                if status_changed {
                    existing.last_transition_time = Utc::now();
                }
            }
            None => {
                let mut c = Condition::new(type_, status, reason, message);
                c.observed_generation = observed_generation;
                self.0.push(c);
            }
        }
    }
}
