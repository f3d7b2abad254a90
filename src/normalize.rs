//! Validation and normalisation of the model's etymology answer.
//!
//! The completion is untrusted text. `normalize` turns it into a strongly
//! typed [`EtymologyResult`] or an explicit [`NormalizeError`], recovering
//! from the deviations the model is known to produce:
//!
//! * `oldest_root` double-encoded as a JSON string instead of an object.
//! * `evolution` / `related_words` returned as objects or arrays. These are
//!   pretty-printed into strings rather than dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The origin entry of an etymology answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldestRoot {
    pub word: String,
    pub pronunciation: String,
    pub language: String,
    pub meaning: String,
}

/// Response contract of `POST /query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtymologyResult {
    pub oldest_root: OldestRoot,
    pub evolution: String,
    pub related_words: String,
}

/// A normalised answer together with the top-level fields that had to be
/// coerced into strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub result: EtymologyResult,
    pub coerced: Vec<&'static str>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The completion is not JSON at all. `raw` is kept for diagnostics and
    /// must never reach a client outside development mode.
    #[error("completion is not valid JSON: {source}")]
    Parse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("completion violates the etymology schema: {0}")]
    Schema(#[from] SchemaViolation),
}

impl NormalizeError {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizeError::Parse { .. } => "parse",
            NormalizeError::Schema(_) => "schema",
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaViolation {
    #[error("expected a JSON object at the top level, found {found}")]
    NotAnObject { found: &'static str },
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`oldest_root` is a string that does not contain valid JSON: {0}")]
    EmbeddedRootInvalid(#[source] serde_json::Error),
    #[error("`oldest_root` must be an object, found {found}")]
    RootNotObject { found: &'static str },
    #[error("`oldest_root` is missing required field `{0}`")]
    MissingRootField(&'static str),
    #[error("`oldest_root.{0}` must be a string")]
    RootFieldNotString(&'static str),
}

const TOP_LEVEL_FIELDS: [&str; 3] = ["oldest_root", "evolution", "related_words"];

/// Normalise a raw completion into the response contract.
pub fn normalize(raw: &str) -> Result<EtymologyResult, NormalizeError> {
    normalize_report(raw).map(|n| n.result)
}

/// Same as [`normalize`], but also reports which string fields were coerced.
pub fn normalize_report(raw: &str) -> Result<Normalized, NormalizeError> {
    let parsed: Value = serde_json::from_str(raw).map_err(|source| NormalizeError::Parse {
        raw: raw.to_string(),
        source,
    })?;
    let mut top = match parsed {
        Value::Object(map) => map,
        other => {
            return Err(SchemaViolation::NotAnObject {
                found: json_kind(&other),
            }
            .into())
        }
    };
    for field in TOP_LEVEL_FIELDS {
        if !top.contains_key(field) {
            return Err(SchemaViolation::MissingField(field).into());
        }
    }

    let oldest_root = normalize_root(take(&mut top, "oldest_root"))?;

    let mut coerced = Vec::new();
    let evolution = coerce_to_string("evolution", take(&mut top, "evolution"), &mut coerced);
    let related_words =
        coerce_to_string("related_words", take(&mut top, "related_words"), &mut coerced);

    if !top.is_empty() {
        let dropped: Vec<&str> = top.keys().map(String::as_str).collect();
        tracing::debug!(?dropped, "ignoring unexpected top-level fields in completion");
    }

    Ok(Normalized {
        result: EtymologyResult {
            oldest_root,
            evolution,
            related_words,
        },
        coerced,
    })
}

fn take(map: &mut Map<String, Value>, key: &str) -> Value {
    map.remove(key).unwrap_or(Value::Null)
}

fn normalize_root(value: Value) -> Result<OldestRoot, SchemaViolation> {
    // Some model revisions double-encode the root object as a string.
    let value = match value {
        Value::String(embedded) => {
            serde_json::from_str::<Value>(&embedded).map_err(SchemaViolation::EmbeddedRootInvalid)?
        }
        other => other,
    };
    let mut obj = match value {
        Value::Object(map) => map,
        other => {
            return Err(SchemaViolation::RootNotObject {
                found: json_kind(&other),
            })
        }
    };
    for field in crate::prompt::ROOT_FIELDS {
        if !obj.contains_key(field) {
            return Err(SchemaViolation::MissingRootField(field));
        }
    }
    Ok(OldestRoot {
        word: root_string(&mut obj, "word")?,
        pronunciation: root_string(&mut obj, "pronunciation")?,
        language: root_string(&mut obj, "language")?,
        meaning: root_string(&mut obj, "meaning")?,
    })
}

fn root_string(obj: &mut Map<String, Value>, field: &'static str) -> Result<String, SchemaViolation> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(SchemaViolation::RootFieldNotString(field)),
        None => Err(SchemaViolation::MissingRootField(field)),
    }
}

fn coerce_to_string(field: &'static str, value: Value, coerced: &mut Vec<&'static str>) -> String {
    match value {
        Value::String(s) => s,
        other => {
            coerced.push(field);
            serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string())
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
