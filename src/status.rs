//! Status conditions
//!
//! Every component-like resource reports a status with a list of conditions.
//! `Ready` is derived from the others: true once all are true, false as soon
//! as one is false, unknown otherwise.

use crate::trace::ComponentSpan;
use crate::types::{Reference, Wit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const READY: &str = "Ready";
pub const DEPENDENCIES_RESOLVED: &str = "DependenciesResolved";
pub const COMPOSED: &str = "Composed";
pub const PACKAGED: &str = "Packaged";

/// Conditions that feed `Ready` for compositions
pub const COMPOSITION_CONDITIONS: [&str; 3] = [DEPENDENCIES_RESOLVED, COMPOSED, PACKAGED];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Tri-state readiness of a resource with the reason behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl Readiness {
    pub fn ready() -> Self {
        Readiness {
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn unknown(reason: &str, message: &str) -> Self {
        Readiness {
            status: ConditionStatus::Unknown,
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Per-dependency outcome recorded on a composition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Reference>,
    #[serde(default)]
    pub wit: Wit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wit: Option<Wit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<ComponentSpan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyStatus>,
}

impl ComponentStatus {
    /// Add any missing condition as unknown
    pub fn initialize_conditions(&mut self, kinds: &[&str]) {
        for kind in kinds.iter().copied().chain([READY]) {
            if self.condition(kind).is_none() {
                self.conditions.push(Condition {
                    kind: kind.to_string(),
                    status: ConditionStatus::Unknown,
                    reason: String::new(),
                    message: String::new(),
                    last_transition_time: Utc::now(),
                });
            }
        }
    }

    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Set a condition, then recompute `Ready`
    pub fn set_condition(
        &mut self,
        kind: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.put_condition(kind, status, reason, message.into());
        if kind != READY {
            self.aggregate_ready();
        }
    }

    pub fn mark_true(&mut self, kind: &str) {
        self.set_condition(kind, ConditionStatus::True, "", "");
    }

    pub fn mark_false(&mut self, kind: &str, reason: &str, message: impl Into<String>) {
        self.set_condition(kind, ConditionStatus::False, reason, message);
    }

    pub fn mark_unknown(&mut self, kind: &str, reason: &str, message: impl Into<String>) {
        self.set_condition(kind, ConditionStatus::Unknown, reason, message);
    }

    pub fn is_ready(&self) -> bool {
        self.condition(READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn readiness(&self) -> Readiness {
        match self.condition(READY) {
            Some(c) => Readiness {
                status: c.status,
                reason: c.reason.clone(),
                message: c.message.clone(),
            },
            None => Readiness::unknown("Initializing", "no Ready condition reported"),
        }
    }

    fn put_condition(&mut self, kind: &str, status: ConditionStatus, reason: &str, message: String) {
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                kind: kind.to_string(),
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: Utc::now(),
            }),
        }
    }

    fn aggregate_ready(&mut self) {
        let dependents: Vec<&Condition> =
            self.conditions.iter().filter(|c| c.kind != READY).collect();

        let (status, reason, message) = if let Some(failed) = dependents
            .iter()
            .find(|c| c.status == ConditionStatus::False)
        {
            (ConditionStatus::False, failed.reason.clone(), failed.message.clone())
        } else if let Some(pending) = dependents
            .iter()
            .find(|c| c.status == ConditionStatus::Unknown)
        {
            (ConditionStatus::Unknown, pending.reason.clone(), pending.message.clone())
        } else {
            (ConditionStatus::True, String::new(), String::new())
        };
        self.put_condition(READY, status, &reason, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> ComponentStatus {
        let mut status = ComponentStatus::default();
        status.initialize_conditions(&COMPOSITION_CONDITIONS);
        status
    }

    #[test]
    fn test_initialized_conditions_are_unknown() {
        let status = fresh();
        assert_eq!(status.conditions.len(), 4);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::Unknown));
        assert!(!status.is_ready());
    }

    #[test]
    fn test_ready_once_all_true() {
        let mut status = fresh();
        status.mark_true(DEPENDENCIES_RESOLVED);
        status.mark_true(COMPOSED);
        assert!(!status.is_ready());
        status.mark_true(PACKAGED);
        assert!(status.is_ready());
        assert_eq!(status.readiness(), Readiness::ready());
    }

    #[test]
    fn test_false_wins_over_unknown() {
        let mut status = fresh();
        status.mark_unknown(COMPOSED, "Pending", "waiting");
        status.mark_false(DEPENDENCIES_RESOLVED, "CycleDetected", "cycle (2 of 2)");
        let ready = status.readiness();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "CycleDetected");
        assert_eq!(ready.message, "cycle (2 of 2)");
    }

    #[test]
    fn test_missing_ready_is_unknown() {
        let status = ComponentStatus::default();
        assert_eq!(status.readiness().status, ConditionStatus::Unknown);
    }

    #[test]
    fn test_condition_json_shape() {
        let mut status = ComponentStatus::default();
        status.mark_false(COMPOSED, "Invalid", "bad");
        let json = serde_json::to_value(&status).unwrap();
        let condition = &json["conditions"][0];
        assert_eq!(condition["type"], "Composed");
        assert_eq!(condition["status"], "False");
        assert!(condition["lastTransitionTime"].is_string());
        assert_eq!(json["observedGeneration"], 0);
    }
}
