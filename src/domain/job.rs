//! Jobs read off a queue.
//!
//! A Job keeps the exact bytes it was read from next to the parsed payload.
//! Removal and requeueing work on those bytes, so a job fetched from a store
//! always addresses the same entry it came from.

use serde_json::Value;
use thiserror::Error;

use super::path::{FieldPath, PathIndex};
use super::value::{FieldValue, ValueKind};

/// Errors raised while decoding a job or resolving one of its fields
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Malformed job payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Job payload must be an object, got {0}")]
    NotAnObject(ValueKind),

    #[error("Field '{segment}' not found while resolving '{path}'")]
    MissingField { path: String, segment: String },

    #[error("Field '{segment}' in '{path}' is a {kind}, not a map")]
    NotAMap {
        path: String,
        segment: String,
        kind: ValueKind,
    },

    #[error("Field '{path}' is a {kind}, not a sequence")]
    NotASequence { path: String, kind: ValueKind },

    #[error("Index {index} out of bounds for '{path}' (length {len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Index '{index}' in '{path}' is not a valid position")]
    MalformedIndex { path: String, index: String },
}

/// A unit of work from a queue
#[derive(Debug, Clone)]
pub struct Job {
    /// Bytes exactly as stored
    raw: Vec<u8>,

    /// Parsed payload (always an object)
    data: Value,
}

impl Job {
    /// Decode a job from its stored bytes
    pub fn from_bytes(raw: impl Into<Vec<u8>>) -> Result<Self, JobError> {
        let raw = raw.into();
        let data: Value = serde_json::from_slice(&raw)?;

        if !data.is_object() {
            return Err(JobError::NotAnObject(FieldValue::from(&data).kind()));
        }

        Ok(Self { raw, data })
    }

    /// Build a job from a JSON value, serializing it to get the raw form
    pub fn from_value(data: &Value) -> Result<Self, JobError> {
        let raw = serde_json::to_vec(data)?;
        Self::from_bytes(raw)
    }

    /// The exact stored bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The parsed payload
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Job id (`jid`), used to tag log lines
    pub fn id(&self) -> Option<&str> {
        self.data.get("jid").and_then(Value::as_str)
    }

    /// Resolve the keys of a path, ignoring any trailing index.
    ///
    /// Every segment except the last must land on a map.
    pub fn get_value(&self, path: &FieldPath) -> Result<FieldValue<'_>, JobError> {
        let mut current = &self.data;

        for segment in path.segments() {
            let map = match current {
                Value::Object(map) => map,
                other => {
                    return Err(JobError::NotAMap {
                        path: path.to_string(),
                        segment: segment.clone(),
                        kind: FieldValue::from(other).kind(),
                    })
                }
            };

            current = map.get(segment).ok_or_else(|| JobError::MissingField {
                path: path.to_string(),
                segment: segment.clone(),
            })?;
        }

        Ok(FieldValue::from(current))
    }

    /// Resolve a path fully, applying its index when it has one
    pub fn lookup(&self, path: &FieldPath) -> Result<FieldValue<'_>, JobError> {
        let value = self.get_value(path)?;

        let Some(index) = path.index() else {
            return Ok(value);
        };

        let items = match value {
            FieldValue::Sequence(items) => items,
            other => {
                return Err(JobError::NotASequence {
                    path: path.to_string(),
                    kind: other.kind(),
                })
            }
        };

        match index {
            PathIndex::Position(position) => items
                .get(*position)
                .map(FieldValue::from)
                .ok_or_else(|| JobError::IndexOutOfBounds {
                    path: path.to_string(),
                    index: *position,
                    len: items.len(),
                }),
            PathIndex::Malformed(index) => Err(JobError::MalformedIndex {
                path: path.to_string(),
                index: index.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str =
        r#"{"name":"test","id": 1, "type":"json","payload":{"test":"test","args":[5,"x"]}}"#;

    #[test]
    fn test_raw_round_trip() {
        let job = Job::from_bytes(PAYLOAD).unwrap();
        assert_eq!(job.raw(), PAYLOAD.as_bytes());
        assert_eq!(job.data()["name"], "test");
    }

    #[test]
    fn test_get_string() {
        let job = Job::from_bytes(PAYLOAD).unwrap();
        let value = job.get_value(&"name".into()).unwrap();
        assert_eq!(value, FieldValue::String("test"));
    }

    #[test]
    fn test_get_nested() {
        let job = Job::from_bytes(PAYLOAD).unwrap();
        let value = job.get_value(&"payload.test".into()).unwrap();
        assert_eq!(value.kind(), ValueKind::String);
    }

    #[test]
    fn test_lookup_index() {
        let job = Job::from_bytes(PAYLOAD).unwrap();

        assert_eq!(
            job.lookup(&"payload.args[0]".into()).unwrap(),
            FieldValue::Number(5.0)
        );
        assert!(matches!(
            job.lookup(&"payload.args[2]".into()),
            Err(JobError::IndexOutOfBounds { index: 2, len: 2, .. })
        ));
        assert!(matches!(
            job.lookup(&"name[0]".into()),
            Err(JobError::NotASequence { .. })
        ));
    }

    #[test]
    fn test_missing_field() {
        let job = Job::from_bytes(PAYLOAD).unwrap();
        assert!(matches!(
            job.get_value(&"payload.missing".into()),
            Err(JobError::MissingField { .. })
        ));
    }

    #[test]
    fn test_intermediate_must_be_map() {
        let job = Job::from_bytes(PAYLOAD).unwrap();
        assert!(matches!(
            job.get_value(&"name.inner".into()),
            Err(JobError::NotAMap { kind: ValueKind::String, .. })
        ));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            Job::from_bytes("[1, 2]"),
            Err(JobError::NotAnObject(ValueKind::Sequence))
        ));
        assert!(matches!(Job::from_bytes("{not json"), Err(JobError::Decode(_))));
    }

    #[test]
    fn test_id() {
        let job = Job::from_bytes(r#"{"jid": "abc"}"#).unwrap();
        assert_eq!(job.id(), Some("abc"));
    }
}
