//! Typed ID definitions.

use crate::define_id;
use crate::error::IdError;
use crate::macros::{is_id_char, MAX_ID_LEN};

/// Validates an ID string for the given kind.
#[doc(hidden)]
pub fn validate(kind: &'static str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            kind,
            max: MAX_ID_LEN,
        });
    }
    if let Some(ch) = s.chars().find(|c| !is_id_char(*c)) {
        return Err(IdError::InvalidCharacter {
            kind,
            value: s.to_string(),
            ch,
        });
    }
    Ok(())
}

define_id!(ProjectId, "project ID");
define_id!(EventId, "event ID");
define_id!(JobName, "job name");

// =============================================================================
// Pods
// =============================================================================

/// A pod identity that is unique across the whole cluster.
///
/// Rendered as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedPodName {
    namespace: String,
    name: String,
}

impl NamespacedPodName {
    /// Creates a namespaced pod name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the pod name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for NamespacedPodName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for NamespacedPodName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(IdError::InvalidPodName(s.to_string())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_project_id_parse() {
        let id: ProjectId = "italian-food".parse().unwrap();
        assert_eq!(id.as_str(), "italian-food");
        assert_eq!(id.to_string(), "italian-food");
    }

    #[test]
    fn test_empty_id_rejected() {
        let result: Result<EventId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[rstest]
    #[case("abc:def", ':')]
    #[case("abc/def", '/')]
    #[case("abc def", ' ')]
    #[case("ünïcode", 'ü')]
    #[case("build.linux", '.')]
    fn test_invalid_characters(#[case] input: &str, #[case] bad: char) {
        let err = JobName::parse(input).unwrap_err();
        assert!(matches!(err, IdError::InvalidCharacter { ch, .. } if ch == bad));
    }

    #[test]
    fn test_dotted_project_id_rejected() {
        let err = ProjectId::parse("my.project").unwrap_err();
        assert!(matches!(err, IdError::InvalidCharacter { ch: '.', .. }));
        assert!(ProjectId::parse("my_project-2").is_ok());
    }

    #[test]
    fn test_too_long() {
        let long = "a".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            ProjectId::parse(&long),
            Err(IdError::TooLong { .. })
        ));
        assert!(ProjectId::parse(&"a".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: EventId = serde_json::from_str("\"2b4fa0f8-5c4e\"").unwrap();
        assert_eq!(ok.as_str(), "2b4fa0f8-5c4e");

        let bad: Result<EventId, _> = serde_json::from_str("\"e1:build\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_namespaced_pod_name() {
        let pod = NamespacedPodName::new("brigade-italian", "worker-e1");
        assert_eq!(pod.to_string(), "brigade-italian/worker-e1");
        assert_eq!(pod.namespace(), "brigade-italian");
        assert_eq!(pod.name(), "worker-e1");

        let parsed: NamespacedPodName = "ns/pod".parse().unwrap();
        assert_eq!(parsed, NamespacedPodName::new("ns", "pod"));
    }

    #[rstest]
    #[case("no-slash")]
    #[case("/pod")]
    #[case("ns/")]
    #[case("a/b/c")]
    fn test_namespaced_pod_name_invalid(#[case] input: &str) {
        assert!(input.parse::<NamespacedPodName>().is_err());
    }
}
