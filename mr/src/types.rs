use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MrError, Result};

/// Number of entries kept in the ranked summary.
pub const TOP_N: usize = 30;

/// One line of input, identified by its position in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub offset: u64,
    pub line: String,
}

impl InputRecord {
    pub fn new(offset: u64, line: impl Into<String>) -> Self {
        InputRecord {
            offset,
            line: line.into(),
        }
    }
}

/// A single `(word, 1)` pair emitted by the mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCount {
    pub word: String,
    pub count: u64,
}

/// Everything the mapper emitted for one input record, in token order.
pub type MapperOutput = Vec<WordCount>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedEntry {
    pub word: String,
    #[serde(default)]
    pub counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducedEntry {
    pub word: String,
    pub total: u64,
}

/// Final summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(rename = "num_input_lines")]
    pub input_count: u64,
    pub unique_words: u64,
    pub top_30: Vec<(String, u64)>,
    pub all_counts: BTreeMap<String, u64>,
}

/// Raw job payload as accepted at job start.
#[derive(Debug, Default, Clone, Deserialize)]
struct JobPayload {
    lines: Option<Vec<String>>,
    container: Option<String>,
    blobs: Option<Vec<String>>,
}

/// A validated job request. Either the lines are carried inline or they
/// are read from a container in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobRequest {
    Inline {
        lines: Vec<String>,
    },
    Store {
        container: Option<String>,
        blobs: Option<Vec<String>>,
    },
}

impl JobRequest {
    pub fn from_json(payload: &str) -> Result<JobRequest> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(JobRequest::Store {
                container: None,
                blobs: None,
            });
        }
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| MrError::Validation(format!("payload is not valid JSON: {}", e)))?;
        if !value.is_object() {
            return Err(MrError::Validation("payload must be a JSON object".to_string()));
        }
        let payload: JobPayload = serde_json::from_value(value)
            .map_err(|e| MrError::Validation(e.to_string()))?;

        match payload {
            JobPayload {
                lines: Some(_),
                container: Some(_),
                ..
            }
            | JobPayload {
                lines: Some(_),
                blobs: Some(_),
                ..
            } => Err(MrError::Validation(
                "`lines` cannot be combined with `container` or `blobs`".to_string(),
            )),
            JobPayload {
                lines: Some(lines), ..
            } => Ok(JobRequest::Inline { lines }),
            JobPayload {
                container, blobs, ..
            } => Ok(JobRequest::Store {
                container: container.filter(|c| !c.is_empty()),
                blobs: blobs.filter(|b| !b.is_empty()),
            }),
        }
    }
}
