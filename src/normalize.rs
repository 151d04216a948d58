//! Canonical results.
//!
//! Turns execution results and statement errors into one serializable shape that can be
//! compared textually. Documents keep the field order the server returned; values are
//! rendered as relaxed Extended JSON.

use crate::error::StatementError;
use crate::evaluator::ExecutionResult;
use mongodb::bson::{Bson, Document};
use regex::Regex;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value as Json;
use std::sync::LazyLock;

/// Reply fields that describe the server rather than the operation.
/// Stands in for the database name, which differs between workers.
pub const DATABASE_PLACEHOLDER: &str = "<db>";

const BOOKKEEPING: &[&str] = &[
    "ok",
    "$clusterTime",
    "operationTime",
    "electionId",
    "opTime",
    "$gleStats",
    "lastCommittedOpTime",
    "$configServerState",
    "$topologyTime",
];

static OBJECT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{24}\b").expect("object id pattern is valid"));

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .expect("uuid pattern is valid")
});

/// Comparison-ready outcome of one command block.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalResult {
    Document { value: Json },
    Documents { values: Vec<Json> },
    Scalar { value: Json },
    Error { kind: String, message: String },
    None,
}

impl CanonicalResult {
    /// Normalize an execution result. With `shape_only`, leaf values become type names.
    pub fn from_result(result: ExecutionResult, shape_only: bool) -> Self {
        let render = |value: Bson| {
            let value = if shape_only { shape(value) } else { value };
            value.into_relaxed_extjson()
        };
        match result {
            ExecutionResult::Document(d) => CanonicalResult::Document {
                value: render(Bson::Document(d)),
            },
            ExecutionResult::Documents(docs) => CanonicalResult::Documents {
                values: docs.into_iter().map(|d| render(Bson::Document(d))).collect(),
            },
            ExecutionResult::Scalar(value) => CanonicalResult::Scalar {
                value: render(value),
            },
            ExecutionResult::Nothing => CanonicalResult::None,
        }
    }

    /// Normalize a statement error. With `shape_only`, the message is the error kind.
    ///
    /// Server messages name namespaces as `<database>.<collection>`; the database part is
    /// replaced by `<db>` so results do not depend on which worker ran the fixture.
    pub fn from_error(error: &StatementError, shape_only: bool, database: &str) -> Self {
        let kind = error.kind().to_string();
        if shape_only {
            return CanonicalResult::Error {
                message: kind.clone(),
                kind,
            };
        }
        let full = match error {
            StatementError::Database(e) => e.message.clone(),
            other => other.to_string(),
        };
        let first_line = full.lines().next().unwrap_or_default();
        let message = first_line.replace(&format!("{database}."), &format!("{DATABASE_PLACEHOLDER}."));
        CanonicalResult::Error { kind, message }
    }
}

/// Remove server bookkeeping from a raw command reply.
pub fn strip_bookkeeping(mut reply: Document) -> Document {
    for key in BOOKKEEPING {
        reply.remove(*key);
    }
    reply
}

/// Replace every leaf value by its type name, keeping the document structure.
fn shape(value: Bson) -> Bson {
    match value {
        Bson::Document(d) => Bson::Document(d.into_iter().map(|(k, v)| (k, shape(v))).collect()),
        Bson::Array(items) => Bson::Array(items.into_iter().map(shape).collect()),
        other => Bson::String(type_name(&other).to_string()),
    }
}

/// Type alias as understood by the `$type` query operator.
pub fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
    }
}

/// Mask generated identifiers so snapshots are stable across runs.
pub fn mask(text: &str) -> String {
    let text = UUID.replace_all(text, "<UUID>");
    OBJECT_ID.replace_all(&text, "<ObjectID>").into_owned()
}
