//! Wire types for the remote sync API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of `POST /sync/{table}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub records: Vec<serde_json::Value>,
}

/// Response to a table push. Servers may answer with an empty body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    #[serde(default)]
    pub accepted: Option<usize>,
}

/// `GET /sync/pull` answer: table name to rows changed since the cursor.
pub type PullResponse = BTreeMap<String, Vec<serde_json::Value>>;

/// API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub code: String,
    pub message: String,
}
