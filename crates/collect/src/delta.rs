//! Field-delta tracking between crawls.
//!
//! Counts filled leaf fields in a nested document and diffs two snapshots so
//! the orchestrator can report whether a re-crawl actually found anything
//! new.

use std::collections::BTreeSet;

use serde_json::Value;

#[derive(Debug, Default, PartialEq)]
pub struct FieldDelta {
    pub new_fields: Vec<String>,
    pub updated_fields: Vec<String>,
    pub found_new_data: bool,
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Paths of filled leaf fields. Lists count as one filled field at their own
/// path, with object items sampled three deep for nested paths.
pub fn filled_fields(data: &Value) -> BTreeSet<String> {
    let mut filled = BTreeSet::new();
    recurse(data, "", &mut filled);
    filled
}

fn recurse(value: &Value, path: &str, filled: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                match child {
                    Value::Object(_) => recurse(child, &child_path, filled),
                    Value::Array(items) if !items.is_empty() => {
                        filled.insert(child_path.clone());
                        for (i, item) in items.iter().take(3).enumerate() {
                            if item.is_object() {
                                recurse(item, &format!("{child_path}[{i}]"), filled);
                            }
                        }
                    }
                    _ if is_filled(child) => {
                        filled.insert(child_path);
                    }
                    _ => {}
                }
            }
        }
        _ if is_filled(value) && !path.is_empty() => {
            filled.insert(path.to_string());
        }
        _ => {}
    }
}

fn value_at<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.replace('[', ".").replace(']', "").split('.') {
        current = match part.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(part)?,
        };
    }
    Some(current)
}

pub fn compute_field_delta(old: Option<&Value>, new: &Value) -> FieldDelta {
    let new_filled = filled_fields(new);
    let Some(old) = old else {
        let found = !new_filled.is_empty();
        return FieldDelta {
            new_fields: new_filled.into_iter().collect(),
            updated_fields: Vec::new(),
            found_new_data: found,
        };
    };

    let old_filled = filled_fields(old);
    let added: Vec<String> = new_filled.difference(&old_filled).cloned().collect();
    let updated: Vec<String> = new_filled
        .intersection(&old_filled)
        .filter(|path| value_at(old, path) != value_at(new, path))
        .cloned()
        .collect();

    FieldDelta {
        found_new_data: !added.is_empty() || !updated.is_empty(),
        new_fields: added,
        updated_fields: updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_only_filled_leaves() {
        let data = json!({
            "name": "Org",
            "mission": "",
            "website": null,
            "programs": ["a", "b"],
            "contact": {"email": "x@y.org", "phone": null}
        });
        let filled = filled_fields(&data);
        assert!(filled.contains("name"));
        assert!(filled.contains("programs"));
        assert!(filled.contains("contact.email"));
        assert!(!filled.contains("mission"));
        assert!(!filled.contains("website"));
        assert!(!filled.contains("contact.phone"));
    }

    #[test]
    fn delta_against_nothing_is_all_new() {
        let new = json!({"name": "Org", "mission": "Help"});
        let delta = compute_field_delta(None, &new);
        assert!(delta.found_new_data);
        assert_eq!(delta.new_fields.len(), 2);
    }

    #[test]
    fn delta_detects_updates_and_additions() {
        let old = json!({"name": "Org", "mission": "Old mission"});
        let new = json!({"name": "Org", "mission": "New mission", "ein": "12-3456789"});
        let delta = compute_field_delta(Some(&old), &new);
        assert_eq!(delta.new_fields, vec!["ein".to_string()]);
        assert_eq!(delta.updated_fields, vec!["mission".to_string()]);
        assert!(delta.found_new_data);
    }

    #[test]
    fn identical_documents_have_no_delta() {
        let doc = json!({"name": "Org", "programs": ["a"]});
        let delta = compute_field_delta(Some(&doc), &doc);
        assert!(!delta.found_new_data);
        assert!(delta.new_fields.is_empty());
        assert!(delta.updated_fields.is_empty());
    }
}
