//! Subscription metadata conventions
//!
//! The provider-side subscription metadata carries the internal student ids it
//! covers: `studentIds` is a JSON-encoded array of uuid strings, and older
//! subscriptions carry a single-id `studentId` field instead. Parsing fails
//! closed: anything malformed yields an empty set rather than an error, which
//! matches how legacy data behaves in production.

use std::collections::HashMap;

use uuid::Uuid;

pub const STUDENT_IDS_KEY: &str = "studentIds";
pub const LEGACY_STUDENT_ID_KEY: &str = "studentId";

/// Extract the covered student ids from subscription metadata.
///
/// Order of preference: `studentIds` JSON array, then the legacy single-id
/// `studentId` fallback. Returns an empty vec when neither parses.
pub fn covered_student_ids(metadata: &HashMap<String, String>) -> Vec<Uuid> {
    if let Some(raw) = metadata.get(STUDENT_IDS_KEY) {
        let ids = parse_id_array(raw);
        if !ids.is_empty() {
            return ids;
        }
    }

    if let Some(raw) = metadata.get(LEGACY_STUDENT_ID_KEY) {
        if let Ok(id) = raw.trim().parse::<Uuid>() {
            return vec![id];
        }
    }

    Vec::new()
}

fn parse_id_array(raw: &str) -> Vec<Uuid> {
    let parsed: Vec<String> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    // Skip individual bad entries instead of rejecting the whole list
    parsed
        .iter()
        .filter_map(|s| s.trim().parse::<Uuid>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_json_array_of_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let raw = format!(r#"["{}","{}"]"#, a, b);
        let m = meta(&[("studentIds", &raw)]);
        assert_eq!(covered_student_ids(&m), vec![a, b]);
    }

    #[test]
    fn falls_back_to_legacy_single_id() {
        let a = Uuid::new_v4();
        let m = meta(&[("studentId", &a.to_string())]);
        assert_eq!(covered_student_ids(&m), vec![a]);
    }

    #[test]
    fn malformed_json_yields_empty_not_error() {
        let m = meta(&[("studentIds", "not json at all")]);
        assert!(covered_student_ids(&m).is_empty());
    }

    #[test]
    fn array_wins_over_legacy_field() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let raw = format!(r#"["{}"]"#, a);
        let m = meta(&[("studentIds", &raw), ("studentId", &b.to_string())]);
        assert_eq!(covered_student_ids(&m), vec![a]);
    }

    #[test]
    fn empty_array_falls_through_to_legacy() {
        let b = Uuid::new_v4();
        let m = meta(&[("studentIds", "[]"), ("studentId", &b.to_string())]);
        assert_eq!(covered_student_ids(&m), vec![b]);
    }

    #[test]
    fn bad_entries_are_skipped() {
        let a = Uuid::new_v4();
        let raw = format!(r#"["{}", "oops"]"#, a);
        let m = meta(&[("studentIds", &raw)]);
        assert_eq!(covered_student_ids(&m), vec![a]);
    }

    #[test]
    fn no_metadata_means_no_students() {
        assert!(covered_student_ids(&HashMap::new()).is_empty());
    }
}
