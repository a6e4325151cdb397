//! Shape check, type coercion and parent lookup for raw records.

use std::sync::Arc;

use thiserror::Error;

use crate::config::{ColumnSpec, ColumnType, TargetSchema};
use crate::identity::{IdentitySet, Identifier};
use crate::source::{RawRecord, RowDecodeError};

/// A coerced target value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Identifier(Identifier),
    Integer(i32),
    Text(String),
}

/// A row whose parent is in the identifier snapshot, typed for the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRecord {
    pub line: u64,
    pub parent: Identifier,
    /// In target column order.
    pub values: Vec<FieldValue>,
}

/// Why a row was dropped. Always recoverable, always counted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("line {line}: column `{column}`: {reason}")]
    Coercion {
        line: u64,
        column: String,
        reason: String,
    },
    #[error("line {line}: parent {parent} is not a known identifier")]
    MissingParent { line: u64, parent: Identifier },
}

impl Rejection {
    /// Source line of the rejected row.
    pub fn line(&self) -> u64 {
        match self {
            Rejection::Decode(err) => err.line(),
            Rejection::Coercion { line, .. } | Rejection::MissingParent { line, .. } => *line,
        }
    }
}

/// Stateless per-row filter. Holds only the shared snapshot and the schema.
#[derive(Debug, Clone)]
pub struct ReferentialFilter {
    identities: Arc<IdentitySet>,
    schema: Arc<TargetSchema>,
}

impl ReferentialFilter {
    pub fn new(identities: Arc<IdentitySet>, schema: Arc<TargetSchema>) -> Self {
        Self { identities, schema }
    }

    /// Validate one record, consuming it.
    pub fn check(&self, raw: RawRecord) -> Result<ValidatedRecord, Rejection> {
        let line = raw.line;
        let expected = self.schema.columns.len();
        if raw.len() != expected {
            return Err(RowDecodeError::FieldCount {
                line,
                expected,
                found: raw.len(),
            }
            .into());
        }

        let values = raw
            .into_fields()
            .into_iter()
            .zip(self.schema.columns.iter())
            .map(|(text, spec)| coerce(line, text, spec))
            .collect::<Result<Vec<_>, _>>()?;

        let fk = self.schema.foreign_key;
        let parent = match values.get(fk) {
            Some(FieldValue::Identifier(id)) => *id,
            Some(_) => {
                return Err(Rejection::Coercion {
                    line,
                    column: self.schema.columns[fk].name.clone(),
                    reason: "foreign key is not an identifier".into(),
                })
            }
            None => {
                return Err(Rejection::Coercion {
                    line,
                    column: format!("#{fk}"),
                    reason: format!("foreign key index {fk} is outside a {expected}-column row"),
                })
            }
        };

        if !self.identities.contains(&parent) {
            return Err(Rejection::MissingParent { line, parent });
        }

        Ok(ValidatedRecord {
            line,
            parent,
            values,
        })
    }
}

fn coerce(line: u64, text: String, spec: &ColumnSpec) -> Result<FieldValue, Rejection> {
    let fail = |reason: String| Rejection::Coercion {
        line,
        column: spec.name.clone(),
        reason,
    };

    if spec.nullable && text.is_empty() {
        return Ok(FieldValue::Null);
    }

    match spec.ty {
        ColumnType::Text => Ok(FieldValue::Text(text)),
        ColumnType::Integer => text
            .trim()
            .parse::<i32>()
            .map(FieldValue::Integer)
            .map_err(|e| fail(format!("`{text}` is not an integer: {e}"))),
        ColumnType::Identifier => text
            .trim()
            .parse::<Identifier>()
            .map(FieldValue::Identifier)
            .map_err(|e| fail(format!("`{text}` is not a uuid: {e}"))),
    }
}
