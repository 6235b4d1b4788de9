// ABOUTME: Pluggable structural comparison of contract specifications
// ABOUTME: The default comparator diffs a JSON-Schema subset for breaking changes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

use super::ContractPayload;

/// Decides how one specification payload differs from its predecessor.
pub trait SpecComparator: Send + Sync {
    fn compare(&self, previous: &ContractPayload, next: &ContractPayload) -> ChangeReport;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub changes: Vec<SpecChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecChange {
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ChangeKind {
    FieldRemoved,
    RequiredFieldAdded,
    OptionalFieldAdded,
    BecameRequired,
    BecameOptional,
    TypeNarrowed { from: String, to: String },
    TypeWidened { from: String, to: String },
    TypeChanged { from: String, to: String },
    PayloadReplaced,
}

impl ChangeKind {
    pub fn is_breaking(&self) -> bool {
        matches!(
            self,
            ChangeKind::FieldRemoved
                | ChangeKind::RequiredFieldAdded
                | ChangeKind::BecameRequired
                | ChangeKind::TypeNarrowed { .. }
                | ChangeKind::TypeChanged { .. }
                | ChangeKind::PayloadReplaced
        )
    }
}

impl ChangeReport {
    pub fn is_breaking(&self) -> bool {
        self.changes.iter().any(|c| c.kind.is_breaking())
    }

    pub fn breaking_changes(&self) -> impl Iterator<Item = &SpecChange> {
        self.changes.iter().filter(|c| c.kind.is_breaking())
    }

    fn push(&mut self, path: &str, kind: ChangeKind) {
        self.changes.push(SpecChange {
            path: path.to_string(),
            kind,
        });
    }
}

impl fmt::Display for SpecChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ChangeKind::FieldRemoved => write!(f, "{}: field removed", self.path),
            ChangeKind::RequiredFieldAdded => write!(f, "{}: required field added", self.path),
            ChangeKind::OptionalFieldAdded => write!(f, "{}: optional field added", self.path),
            ChangeKind::BecameRequired => write!(f, "{}: field became required", self.path),
            ChangeKind::BecameOptional => write!(f, "{}: field became optional", self.path),
            ChangeKind::TypeNarrowed { from, to } => {
                write!(f, "{}: type narrowed {} -> {}", self.path, from, to)
            }
            ChangeKind::TypeWidened { from, to } => {
                write!(f, "{}: type widened {} -> {}", self.path, from, to)
            }
            ChangeKind::TypeChanged { from, to } => {
                write!(f, "{}: type changed {} -> {}", self.path, from, to)
            }
            ChangeKind::PayloadReplaced => write!(f, "{}: payload replaced", self.path),
        }
    }
}

/// Reads `properties`, `required`, `type` and `items` from object schemas.
///
/// A root payload that is not a schema is opaque: any difference is a
/// breaking replacement.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaComparator;

impl SpecComparator for SchemaComparator {
    fn compare(&self, previous: &ContractPayload, next: &ContractPayload) -> ChangeReport {
        let mut report = ChangeReport::default();
        compare_schema("$", &previous.0, &next.0, &mut report);
        report
    }
}

fn compare_schema(path: &str, old: &Value, new: &Value, report: &mut ChangeReport) {
    if old == new {
        return;
    }

    let (old_obj, new_obj) = match (old.as_object(), new.as_object()) {
        (Some(o), Some(n)) => (o, n),
        _ => {
            report.push(path, ChangeKind::PayloadReplaced);
            return;
        }
    };

    let old_props = old_obj.get("properties").and_then(Value::as_object);
    let new_props = new_obj.get("properties").and_then(Value::as_object);
    let structured = old_props.is_some() || new_props.is_some();

    compare_types(path, old_obj, new_obj, report);

    if let (Some(old_items), Some(new_items)) = (old_obj.get("items"), new_obj.get("items")) {
        compare_schema(&format!("{}[]", path), old_items, new_items, report);
    }

    if !structured {
        let schema_like = old_obj.contains_key("type") || old_obj.contains_key("items");
        if path == "$" && !schema_like {
            report.push(path, ChangeKind::PayloadReplaced);
        }
        return;
    }

    let empty = Map::new();
    let old_props = old_props.unwrap_or(&empty);
    let new_props = new_props.unwrap_or(&empty);
    let old_required = required_set(old_obj);
    let new_required = required_set(new_obj);

    for (field, old_schema) in old_props {
        let field_path = format!("{}.{}", path, field);
        match new_props.get(field) {
            None => report.push(&field_path, ChangeKind::FieldRemoved),
            Some(new_schema) => {
                match (old_required.contains(field), new_required.contains(field)) {
                    (false, true) => report.push(&field_path, ChangeKind::BecameRequired),
                    (true, false) => report.push(&field_path, ChangeKind::BecameOptional),
                    _ => {}
                }
                compare_schema(&field_path, old_schema, new_schema, report);
            }
        }
    }

    for field in new_props.keys() {
        if !old_props.contains_key(field) {
            let field_path = format!("{}.{}", path, field);
            if new_required.contains(field) {
                report.push(&field_path, ChangeKind::RequiredFieldAdded);
            } else {
                report.push(&field_path, ChangeKind::OptionalFieldAdded);
            }
        }
    }
}

fn compare_types(
    path: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    report: &mut ChangeReport,
) {
    let old_types = accepted_types(old);
    let new_types = accepted_types(new);
    if old_types == new_types {
        return;
    }

    let from = describe(&old_types);
    let to = describe(&new_types);

    // `None` accepts any type
    let kind = match (&old_types, &new_types) {
        (None, Some(_)) => ChangeKind::TypeNarrowed { from, to },
        (Some(_), None) => ChangeKind::TypeWidened { from, to },
        (Some(o), Some(n)) if n.is_subset(o) => ChangeKind::TypeNarrowed { from, to },
        (Some(o), Some(n)) if o.is_subset(n) => ChangeKind::TypeWidened { from, to },
        _ => ChangeKind::TypeChanged { from, to },
    };
    report.push(path, kind);
}

fn accepted_types(schema: &Map<String, Value>) -> Option<BTreeSet<String>> {
    let mut types: BTreeSet<String> = match schema.get("type")? {
        Value::String(t) => std::iter::once(t.clone()).collect(),
        Value::Array(ts) => ts
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => return None,
    };

    if types.contains("number") {
        types.insert("integer".to_string());
    }
    Some(types)
}

fn describe(types: &Option<BTreeSet<String>>) -> String {
    match types {
        None => "any".to_string(),
        Some(set) => set.iter().cloned().collect::<Vec<_>>().join("|"),
    }
}

fn required_set(schema: &Map<String, Value>) -> BTreeSet<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
