//! Conditions over job fields.
//!
//! A condition compares one field of a job against a literal fixed at load
//! time. Evaluation fails closed: if the field cannot be resolved, or its kind
//! does not match the literal, the condition is false.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{FieldPath, FieldValue, Job, PathIndex, ValueKind};

/// Something that decides which branch a job takes
pub trait Predicate: Send + Sync {
    fn evaluate(&self, job: &Job) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Job) -> bool + Send + Sync,
{
    fn evaluate(&self, job: &Job) -> bool {
        self(job)
    }
}

/// Supported comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,

    #[serde(rename = "==", alias = "eq")]
    Equal,

    #[serde(rename = "contains")]
    Contains,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::GreaterThan => ">",
            Self::Equal => "==",
            Self::Contains => "contains",
        };
        f.write_str(symbol)
    }
}

/// Comparison literal.
///
/// Integers of every width become `Number(f64)` on construction, and YAML
/// integers deserialize straight into the float variant, so numeric
/// comparisons are always float against float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Literal {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::String(_) => ValueKind::String,
        }
    }
}

macro_rules! numeric_literal {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Literal {
                fn from(n: $ty) -> Self {
                    Self::Number(n as f64)
                }
            }
        )*
    };
}

numeric_literal!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A named comparison over one job field
#[derive(Debug, Clone)]
pub struct Condition {
    name: String,
    path: FieldPath,
    operator: Operator,
    comparison: Literal,
}

impl Condition {
    pub fn new(
        name: impl Into<String>,
        element: &str,
        operator: Operator,
        comparison: impl Into<Literal>,
    ) -> Self {
        Self {
            name: name.into(),
            path: FieldPath::parse(element),
            operator,
            comparison: comparison.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn comparison(&self) -> &Literal {
        &self.comparison
    }

    /// Evaluate against a job. Never fails; unresolvable fields are false.
    pub fn evaluate(&self, job: &Job) -> bool {
        let value = match job.get_value(&self.path) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    condition = %self.name,
                    element = %self.path,
                    error = %e,
                    "Could not resolve condition field"
                );
                return false;
            }
        };

        match (value, self.path.index()) {
            (FieldValue::Sequence(items), Some(index)) => self.compare_element(items, index),
            (FieldValue::Sequence(_), None) => {
                warn!(
                    condition = %self.name,
                    element = %self.path,
                    "Sequence field compared without an index"
                );
                false
            }
            (other, Some(_)) => {
                warn!(
                    condition = %self.name,
                    element = %self.path,
                    kind = %other.kind(),
                    "Index applied to a field that is not a sequence"
                );
                false
            }
            (other, None) => self.compare(other),
        }
    }

    fn compare_element(&self, items: &[serde_json::Value], index: &PathIndex) -> bool {
        let position = match index {
            PathIndex::Position(position) => *position,
            PathIndex::Malformed(raw) => {
                warn!(
                    condition = %self.name,
                    element = %self.path,
                    index = %raw,
                    "Index is not an integer"
                );
                return false;
            }
        };

        let Some(item) = items.get(position) else {
            warn!(
                condition = %self.name,
                element = %self.path,
                len = items.len(),
                "Index out of bounds"
            );
            return false;
        };

        let element = FieldValue::from(item);
        if element.kind() != self.comparison.kind() {
            debug!(
                condition = %self.name,
                element_kind = %element.kind(),
                comparison_kind = %self.comparison.kind(),
                "Element kind does not match comparison"
            );
            return false;
        }

        self.compare(element)
    }

    fn compare(&self, value: FieldValue<'_>) -> bool {
        match (value, &self.comparison) {
            (FieldValue::String(actual), Literal::String(expected)) => match self.operator {
                Operator::Contains => actual.contains(expected.as_str()),
                Operator::Equal => actual == expected,
                Operator::GreaterThan => false,
            },
            (FieldValue::Number(actual), Literal::Number(expected)) => match self.operator {
                Operator::GreaterThan => actual > *expected,
                Operator::Equal => actual == *expected,
                Operator::Contains => false,
            },
            (FieldValue::Bool(actual), Literal::Bool(expected)) => {
                self.operator == Operator::Equal && actual == *expected
            }
            (other, _) => {
                debug!(
                    condition = %self.name,
                    operator = %self.operator,
                    kind = %other.kind(),
                    comparison_kind = %self.comparison.kind(),
                    "Field kind does not match comparison"
                );
                false
            }
        }
    }
}

impl Predicate for Condition {
    fn evaluate(&self, job: &Job) -> bool {
        Condition::evaluate(self, job)
    }
}
