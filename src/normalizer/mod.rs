//! Record normalization.
//!
//! Registry payloads are untyped nested JSON whose shape is not guaranteed. The
//! functions here are the only code that looks at raw records: they convert them
//! into the strict [`crate::models`] types. None of them fail; a missing or
//! malformed field yields an empty value.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::models::{Abstract, Researcher};

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Free keywords across all keyword groups, lower-cased and trimmed.
///
/// Walks `keywordGroups[].keywords[].freeKeywords[]`. Any level that is not the
/// expected object or array is skipped, as are non-string and blank keywords.
pub fn extract_keywords(record: &Value) -> BTreeSet<String> {
    let mut keywords = BTreeSet::new();
    for group in array(record, "keywordGroups") {
        if !group.is_object() {
            continue;
        }
        for entry in array(group, "keywords") {
            if !entry.is_object() {
                continue;
            }
            for keyword in array(entry, "freeKeywords") {
                if let Some(keyword) = keyword.as_str().and_then(non_empty) {
                    keywords.insert(keyword.to_lowercase());
                }
            }
        }
    }
    keywords
}

/// English abstract text (`abstract.en_GB`), or an empty string.
pub fn extract_abstract_text(record: &Value) -> String {
    record
        .get("abstract")
        .and_then(|a| a.get("en_GB"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// First email found scanning organisational associations in order.
///
/// Only the first listed email of each association is considered.
pub fn extract_email(record: &Value) -> Option<String> {
    array(record, "staffOrganizationAssociations")
        .iter()
        .filter_map(|association| {
            array(association, "emails")
                .first()
                .and_then(|email| email.get("value"))
                .and_then(Value::as_str)
                .and_then(non_empty)
        })
        .next()
}

/// Display name from `name.firstName` and `name.lastName`.
pub fn extract_name(record: &Value) -> Option<String> {
    let name = record.get("name")?;
    let parts: Vec<&str> = ["firstName", "lastName"]
        .iter()
        .filter_map(|key| name.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Publication title, given either as a string or as `{ "value": ... }`.
pub fn extract_title(record: &Value) -> Option<String> {
    match record.get("title")? {
        Value::String(title) => non_empty(title),
        other => other.get("value").and_then(Value::as_str).and_then(non_empty),
    }
}

/// English job titles of every organisational association, in order.
pub fn extract_job_titles(record: &Value) -> Vec<String> {
    array(record, "staffOrganizationAssociations")
        .iter()
        .filter_map(|association| {
            association
                .get("jobTitle")
                .and_then(|t| t.get("term"))
                .and_then(|t| t.get("en_GB"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

/// Person uuids of a publication's contributors, in order.
pub fn extract_contributor_uuids(record: &Value) -> Vec<String> {
    array(record, "contributors")
        .iter()
        .filter_map(|contributor| {
            contributor
                .get("person")
                .and_then(|p| p.get("uuid"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

/// Convert a publication record into an [`Abstract`].
///
/// Returns `None` unless the record has a uuid, a title and English abstract text.
pub fn normalize_abstract(record: &Value) -> Option<Abstract> {
    let uuid = record.get("uuid").and_then(Value::as_str)?.to_string();
    let title = extract_title(record)?;
    let text = non_empty(&extract_abstract_text(record))?;
    let url = record
        .get("portalUrl")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(Abstract::new(uuid, title, url, text))
}

/// Convert a person record into a [`Researcher`] without abstracts.
///
/// Returns `None` only when the record carries no uuid.
pub fn normalize_researcher(record: &Value) -> Option<Researcher> {
    let uuid = record.get("uuid").and_then(Value::as_str)?;
    let mut researcher = Researcher::new(uuid);
    researcher.name = extract_name(record);
    researcher.email = extract_email(record);
    researcher.keywords = extract_keywords(record);
    Some(researcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> Value {
        json!({
            "uuid": "p-1",
            "name": { "firstName": "Ada", "lastName": "Lovelace" },
            "staffOrganizationAssociations": [
                { "jobTitle": { "term": { "en_GB": "Postdoc" } }, "emails": [] },
                {
                    "jobTitle": { "term": { "en_GB": "Professor" } },
                    "emails": [{ "value": "ada@uni.dk" }, { "value": "other@uni.dk" }]
                }
            ],
            "keywordGroups": [
                { "keywords": [{ "freeKeywords": [" Machine Learning ", "robotics", "ROBOTICS", ""] }] },
                { "keywords": [{ "freeKeywords": ["Graphs"] }, "junk", { "freeKeywords": 7 }] },
                "not a group"
            ]
        })
    }

    #[test]
    fn test_extract_keywords_flattens_and_deduplicates() {
        let keywords = extract_keywords(&person());
        let expected: BTreeSet<String> = ["machine learning", "robotics", "graphs"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(keywords, expected);
    }

    #[test]
    fn test_extract_keywords_missing_groups_is_empty() {
        assert!(extract_keywords(&json!({ "uuid": "x" })).is_empty());
        assert!(extract_keywords(&json!({ "keywordGroups": "oops" })).is_empty());
        assert!(extract_keywords(&json!(null)).is_empty());
        assert!(extract_keywords(&json!([1, 2, 3])).is_empty());
    }

    #[test]
    fn test_extract_abstract_text() {
        let record = json!({ "abstract": { "en_GB": "We study graphs." } });
        assert_eq!(extract_abstract_text(&record), "We study graphs.");
        assert_eq!(extract_abstract_text(&json!({ "abstract": { "da_DK": "x" } })), "");
        assert_eq!(extract_abstract_text(&json!({ "abstract": null })), "");
        assert_eq!(extract_abstract_text(&json!({})), "");
    }

    #[test]
    fn test_extract_email_scans_associations_in_order() {
        assert_eq!(extract_email(&person()).as_deref(), Some("ada@uni.dk"));
        assert_eq!(extract_email(&json!({})), None);
        assert_eq!(
            extract_email(&json!({ "staffOrganizationAssociations": [{ "emails": [{}] }] })),
            None
        );
    }

    #[test]
    fn test_extract_name_and_titles() {
        assert_eq!(extract_name(&person()).as_deref(), Some("Ada Lovelace"));
        assert_eq!(extract_job_titles(&person()), vec!["Postdoc", "Professor"]);
        assert_eq!(extract_name(&json!({ "name": {} })), None);
    }

    #[test]
    fn test_extract_title_accepts_both_shapes() {
        assert_eq!(extract_title(&json!({ "title": "Plain" })).as_deref(), Some("Plain"));
        assert_eq!(
            extract_title(&json!({ "title": { "value": "Wrapped" } })).as_deref(),
            Some("Wrapped")
        );
        assert_eq!(extract_title(&json!({ "title": { "value": "  " } })), None);
    }

    #[test]
    fn test_normalize_abstract_requires_text_and_title() {
        let record = json!({
            "uuid": "o-1",
            "title": { "value": "On Graphs" },
            "abstract": { "en_GB": "We study graphs." },
            "portalUrl": "https://portal/o-1",
            "contributors": [{ "person": { "uuid": "p-1" } }, { "externalPerson": {} }]
        });
        let abs = normalize_abstract(&record).unwrap();
        assert_eq!(abs.title, "On Graphs");
        assert_eq!(abs.url.as_deref(), Some("https://portal/o-1"));
        assert_eq!(extract_contributor_uuids(&record), vec!["p-1"]);

        assert!(normalize_abstract(&json!({ "uuid": "o-2", "title": "T" })).is_none());
    }

    #[test]
    fn test_normalize_researcher() {
        let researcher = normalize_researcher(&person()).unwrap();
        assert_eq!(researcher.uuid, "p-1");
        assert_eq!(researcher.keywords.len(), 3);
        assert!(researcher.abstracts.is_empty());
        assert!(normalize_researcher(&json!({ "name": {} })).is_none());
    }
}
