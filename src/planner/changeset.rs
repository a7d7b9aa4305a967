//! Change records produced by the diff engine.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Operation planned for a resource.
///
/// Variant order is the tie-break order within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Tear the resource down.
    Delete,
    /// Create the resource.
    Create,
    /// Update the resource in place.
    Update,
    /// Nothing to do.
    NoOp,
}

/// Identifies a change record: a replacement has two records per name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChangeKey {
    /// Logical resource name.
    pub name: String,
    /// Planned operation.
    pub operation: ChangeOp,
}

/// How a top-level property changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyChangeKind {
    /// Key is new.
    Added,
    /// Value differs.
    Changed,
    /// Key is gone.
    Removed,
}

/// A single top-level property difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property key.
    pub key: String,
    /// Kind of change.
    pub kind: PropertyChangeKind,
    /// Previous value.
    pub old: Option<Value>,
    /// New value.
    pub new: Option<Value>,
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    /// Logical resource name.
    pub name: String,
    /// Type tag (the recorded one for deletes).
    pub resource_type: String,
    /// Planned operation.
    pub operation: ChangeOp,
    /// Desired dependencies for create/update, recorded ones for delete.
    pub dependencies: BTreeSet<String>,
    /// Dependencies as of the last apply.
    pub prior_dependencies: BTreeSet<String>,
    /// Desired unresolved properties (absent for deletes).
    pub properties: Option<Value>,
    /// Last applied unresolved properties.
    pub prior_properties: Option<Value>,
    /// Physical id of the existing resource.
    pub physical_id: Option<String>,
    /// Part of a delete-then-create replacement.
    pub replacement: bool,
    /// Why this change is needed.
    pub reason: String,
    /// Top-level property differences.
    pub details: Vec<PropertyChange>,
    /// The resource is protected from deletion.
    pub protect: bool,
}

/// The full result of a diff, sorted by name then operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    records: Vec<ChangeRecord>,
}

impl ChangeOp {
    /// Plan symbol for display.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Delete => "-",
            Self::Create => "+",
            Self::Update => "~",
            Self::NoOp => " ",
        }
    }
}

impl ChangeKey {
    /// Creates a key.
    #[must_use]
    pub fn new(name: impl Into<String>, operation: ChangeOp) -> Self {
        Self {
            name: name.into(),
            operation,
        }
    }
}

impl ChangeRecord {
    /// Key identifying this record.
    #[must_use]
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.name.clone(), self.operation)
    }

    /// Returns true unless the record is a no-op.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.operation != ChangeOp::NoOp
    }
}

impl ChangeSet {
    /// Creates a change set, sorting records by key.
    #[must_use]
    pub fn new(mut records: Vec<ChangeRecord>) -> Self {
        records.sort_by_key(ChangeRecord::key);
        Self { records }
    }

    /// All records, including no-ops.
    #[must_use]
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Records that change something.
    pub fn changes(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(|r| r.is_change())
    }

    /// Looks up a record by name and operation.
    #[must_use]
    pub fn get(&self, name: &str, operation: ChangeOp) -> Option<&ChangeRecord> {
        self.records
            .iter()
            .find(|r| r.name == name && r.operation == operation)
    }

    /// Operations planned for `name`, in tie-break order.
    #[must_use]
    pub fn operations_for(&self, name: &str) -> Vec<ChangeOp> {
        self.records
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.operation)
            .collect()
    }

    /// Returns true if nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    /// Number of records with the given operation.
    #[must_use]
    pub fn count(&self, operation: ChangeOp) -> usize {
        self.records.iter().filter(|r| r.operation == operation).count()
    }

    /// Number of replaced resources.
    #[must_use]
    pub fn replacement_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.replacement && r.operation == ChangeOp::Delete)
            .count()
    }

    /// Consumes the set, returning its records.
    #[must_use]
    pub fn into_records(self) -> Vec<ChangeRecord> {
        self.records
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delete => "delete",
            Self::Create => "create",
            Self::Update => "update",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.name)
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = if self.replacement {
            match self.operation {
                ChangeOp::Delete => "-/+",
                _ => "+/-",
            }
        } else {
            self.operation.symbol()
        };
        write!(f, "{symbol} {} ({})", self.name, self.resource_type)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |v: &Option<Value>| v.as_ref().map_or_else(String::new, Value::to_string);
        match self.kind {
            PropertyChangeKind::Added => write!(f, "+ {} = {}", self.key, render(&self.new)),
            PropertyChangeKind::Removed => write!(f, "- {} = {}", self.key, render(&self.old)),
            PropertyChangeKind::Changed => write!(
                f,
                "~ {}: {} -> {}",
                self.key,
                render(&self.old),
                render(&self.new)
            ),
        }
    }
}
