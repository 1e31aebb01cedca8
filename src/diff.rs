//! Change reporting between two published datasets.
//!
//! The report is advisory: it is printed for review before publication and
//! never blocks the write.

use crate::dataset::{Dataset, ProcessEntry};
use itertools::Itertools;
use serde_json::{json, Value};
use std::fmt;

/// Scores within this relative tolerance count as unchanged.
pub const REL_TOLERANCE: f64 = 1e-6;
/// Absolute floor so near-zero scores are not compared relatively.
pub const ABS_FLOOR: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone)]
pub struct FieldDelta {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: String,
    pub kind: ChangeKind,
    pub deltas: Vec<FieldDelta>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeReport {
    pub records: Vec<ChangeRecord>,
}

impl ChangeReport {
    pub fn added(&self) -> usize {
        self.count(ChangeKind::Added)
    }

    pub fn removed(&self) -> usize {
        self.count(ChangeKind::Removed)
    }

    pub fn modified(&self) -> usize {
        self.count(ChangeKind::Modified)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn count(&self, kind: ChangeKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }
}

fn scores_match(old: f64, new: f64) -> bool {
    let diff = (old - new).abs();
    if diff <= ABS_FLOOR {
        return true;
    }
    diff / old.abs().max(new.abs()) <= REL_TOLERANCE
}

fn entry_deltas(old: &ProcessEntry, new: &ProcessEntry) -> Vec<FieldDelta> {
    let mut deltas = Vec::new();

    for (field, old_value, new_value) in [
        ("name", &old.name, &new.name),
        ("unit", &old.unit, &new.unit),
        ("identifier", &old.identifier, &new.identifier),
        ("system_description", &old.system_description, &new.system_description),
    ] {
        if old_value != new_value {
            deltas.push(FieldDelta {
                field: field.to_string(),
                old: json!(old_value),
                new: json!(new_value),
            });
        }
    }

    for code in old.impacts.keys().chain(new.impacts.keys()).unique() {
        let field = format!("impacts.{}", code);
        match (old.impacts.get(code), new.impacts.get(code)) {
            (Some(o), Some(n)) if scores_match(*o, *n) => {}
            (Some(o), Some(n)) => deltas.push(FieldDelta {
                field,
                old: json!(o),
                new: json!(n),
            }),
            (Some(o), None) => deltas.push(FieldDelta {
                field,
                old: json!(o),
                new: Value::Null,
            }),
            (None, Some(n)) => deltas.push(FieldDelta {
                field,
                old: Value::Null,
                new: json!(n),
            }),
            (None, None) => {}
        }
    }

    deltas
}

/// Diff the freshly built dataset against the previously published one.
/// With no previous dataset every entry reports as added.
pub fn compare(previous: Option<&Dataset>, current: &Dataset) -> ChangeReport {
    let empty = Dataset::new();
    let previous = previous.unwrap_or(&empty);

    let mut records = Vec::new();

    for id in previous.keys() {
        if !current.contains_key(id) {
            records.push(ChangeRecord {
                id: id.clone(),
                kind: ChangeKind::Removed,
                deltas: Vec::new(),
            });
        }
    }

    for (id, new_entry) in current {
        match previous.get(id) {
            None => records.push(ChangeRecord {
                id: id.clone(),
                kind: ChangeKind::Added,
                deltas: Vec::new(),
            }),
            Some(old_entry) => {
                let deltas = entry_deltas(old_entry, new_entry);
                if !deltas.is_empty() {
                    records.push(ChangeRecord {
                        id: id.clone(),
                        kind: ChangeKind::Modified,
                        deltas,
                    });
                }
            }
        }
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));
    ChangeReport { records }
}

impl fmt::Display for ChangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.records.is_empty() {
            return writeln!(f, "No changes against the previous dataset");
        }
        writeln!(
            f,
            "{} added, {} removed, {} modified",
            self.added(),
            self.removed(),
            self.modified()
        )?;
        for record in &self.records {
            match record.kind {
                ChangeKind::Added => writeln!(f, "+ {}", record.id)?,
                ChangeKind::Removed => writeln!(f, "- {}", record.id)?,
                ChangeKind::Modified => {
                    writeln!(f, "~ {}", record.id)?;
                    for delta in &record.deltas {
                        match (delta.old.as_f64(), delta.new.as_f64()) {
                            (Some(o), Some(n)) => writeln!(
                                f,
                                "    {}: {} -> {} ({:+e})",
                                delta.field,
                                o,
                                n,
                                n - o
                            )?,
                            _ => writeln!(
                                f,
                                "    {}: {} -> {}",
                                delta.field, delta.old, delta.new
                            )?,
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
