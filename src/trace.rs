//! Provenance traces and cycle detection
//!
//! A trace is the tree of component resources visited while resolving a
//! composition. Each referenced resource contributes a span carrying its own
//! recorded trace as children, so a walk over the tree reaches every resource
//! the dependency graph transitively touches.

use crate::types::{Digest, ResourceIdentity, ResourceRef};
use serde::{Deserialize, Serialize};

/// One visited resource in a provenance trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub uid: String,
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<ComponentSpan>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cycle_omitted: bool,
}

impl ComponentSpan {
    /// Build a span for a resource, carrying the trace it recorded for itself
    pub fn synthesize(
        identity: &ResourceIdentity,
        digest: Option<Digest>,
        trace: Vec<ComponentSpan>,
    ) -> Self {
        ComponentSpan {
            digest,
            uid: identity.uid.clone(),
            group: identity.reference.group.clone(),
            kind: identity.reference.kind.clone(),
            namespace: identity.reference.namespace.clone(),
            name: identity.reference.name.clone(),
            trace,
            cycle_omitted: false,
        }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Search `trace` for spans whose uid matches `uid`
///
/// Returns whether a cycle was found along with a rebuilt copy of the trace in
/// which every colliding span is marked `cycle_omitted` and stripped of its
/// children. The input is never modified.
pub fn detect_cycle(trace: &[ComponentSpan], uid: &str) -> (bool, Vec<ComponentSpan>) {
    let mut has_cycle = false;
    let sanitized = trace
        .iter()
        .map(|span| {
            if span.uid == uid {
                has_cycle = true;
                return ComponentSpan {
                    trace: Vec::new(),
                    cycle_omitted: true,
                    ..span.clone()
                };
            }
            let (nested_cycle, nested) = detect_cycle(&span.trace, uid);
            has_cycle |= nested_cycle;
            ComponentSpan {
                trace: nested,
                ..span.clone()
            }
        })
        .collect();
    (has_cycle, sanitized)
}

/// Append `span` to a copy of `trace` and check it for `owner_uid`
///
/// The returned trace always includes the appended span. When a cycle is
/// reported it is the sanitized form, suitable for recording on status.
pub fn check_and_append(
    trace: &[ComponentSpan],
    span: ComponentSpan,
    owner_uid: &str,
) -> (bool, Vec<ComponentSpan>) {
    let mut appended = Vec::with_capacity(trace.len() + 1);
    appended.extend_from_slice(trace);
    appended.push(span);
    detect_cycle(&appended, owner_uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(uid: &str, children: Vec<ComponentSpan>) -> ComponentSpan {
        ComponentSpan {
            digest: None,
            uid: uid.to_string(),
            group: "components.wacpack.dev".to_string(),
            kind: "Composition".to_string(),
            namespace: "default".to_string(),
            name: uid.to_string(),
            trace: children,
            cycle_omitted: false,
        }
    }

    #[test]
    fn test_no_cycle_returns_equal_trace() {
        let trace = vec![span("a", vec![span("b", vec![])]), span("c", vec![])];
        let (has_cycle, sanitized) = detect_cycle(&trace, "z");
        assert!(!has_cycle);
        assert_eq!(sanitized, trace);
    }

    #[test]
    fn test_cycle_at_top_level() {
        let trace = vec![span("a", vec![span("b", vec![])])];
        let (has_cycle, sanitized) = detect_cycle(&trace, "a");
        assert!(has_cycle);
        assert!(sanitized[0].cycle_omitted);
        assert!(sanitized[0].trace.is_empty());
    }

    #[test]
    fn test_cycle_deep_marks_only_colliding_node() {
        let trace = vec![
            span("x", vec![]),
            span(
                "a",
                vec![span("b", vec![span("owner", vec![span("a", vec![])])])],
            ),
        ];
        let (has_cycle, sanitized) = detect_cycle(&trace, "owner");
        assert!(has_cycle);

        assert!(!sanitized[0].cycle_omitted);
        let a = &sanitized[1];
        assert!(!a.cycle_omitted);
        let b = &a.trace[0];
        assert!(!b.cycle_omitted);
        let owner = &b.trace[0];
        assert!(owner.cycle_omitted);
        assert!(owner.trace.is_empty());
    }

    #[test]
    fn test_multiple_collisions_all_marked() {
        let trace = vec![
            span("owner", vec![span("q", vec![])]),
            span("p", vec![span("owner", vec![])]),
        ];
        let (has_cycle, sanitized) = detect_cycle(&trace, "owner");
        assert!(has_cycle);
        assert!(sanitized[0].cycle_omitted);
        assert!(sanitized[0].trace.is_empty());
        assert!(sanitized[1].trace[0].cycle_omitted);
    }

    #[test]
    fn test_input_trace_is_not_mutated() {
        let trace = vec![span("a", vec![span("owner", vec![span("c", vec![])])])];
        let before = trace.clone();
        let _ = detect_cycle(&trace, "owner");
        assert_eq!(trace, before);
    }

    #[test]
    fn test_check_and_append() {
        let trace = vec![span("a", vec![])];
        let (has_cycle, appended) = check_and_append(&trace, span("b", vec![]), "owner");
        assert!(!has_cycle);
        assert_eq!(appended.len(), 2);
        assert_eq!(trace.len(), 1);

        let (has_cycle, sanitized) =
            check_and_append(&appended, span("c", vec![span("owner", vec![])]), "owner");
        assert!(has_cycle);
        assert!(sanitized[2].trace[0].cycle_omitted);
    }

    #[test]
    fn test_span_json_shape() {
        let mut s = span("a", vec![]);
        s.cycle_omitted = true;
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["cycleOmitted"], true);
        assert!(json.get("trace").is_none());
    }
}
