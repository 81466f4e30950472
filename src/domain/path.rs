//! Field path parsing.
//!
//! A path is a dotted sequence of keys, optionally ending in a single
//! `[n]` index that applies to the value the keys resolve to:
//! `payload.args[2]`.

use std::fmt;

/// Index suffix of a [`FieldPath`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathIndex {
    /// A valid zero-based position
    Position(usize),

    /// Whatever sat between the brackets when it was not a valid position
    Malformed(String),
}

/// A parsed field address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
    index: Option<PathIndex>,
}

impl FieldPath {
    /// Parse a path. Never fails; a bad index is recorded as
    /// [`PathIndex::Malformed`].
    pub fn parse(raw: &str) -> Self {
        let (base, index) = match raw.find('[') {
            Some(open) => {
                let rest = &raw[open + 1..];
                let index = match rest.strip_suffix(']') {
                    Some(inner) => match inner.trim().parse::<usize>() {
                        Ok(position) => PathIndex::Position(position),
                        Err(_) => PathIndex::Malformed(inner.to_string()),
                    },
                    None => PathIndex::Malformed(rest.to_string()),
                };
                (&raw[..open], Some(index))
            }
            None => (raw, None),
        };

        Self {
            raw: raw.to_string(),
            segments: base.split('.').map(str::to_string).collect(),
            index,
        }
    }

    /// The path exactly as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Keys resolved left to right, index excluded
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn index(&self) -> Option<&PathIndex> {
        self.index.as_ref()
    }
}

impl From<&str> for FieldPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
