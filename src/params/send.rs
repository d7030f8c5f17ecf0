use http::Method;
use serde_json::Value;
use std::path::PathBuf;

use super::{
    Common, DEFAULT_MIME_TYPE, Fields, PARAMETER_ABSOLUTE_FILE_PATH, PARAMETER_MIME_TYPE,
    PARAMETER_RETURN_RESPONSE, PARAMETER_TASK_ID, PARAMETER_URL, non_empty, strip_file_scheme,
};
use crate::Result;

/// Validated descriptor for streaming one file as the raw request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Shared transfer fields
    pub common: Common,
    /// File streamed as the body
    pub absolute_file_path: PathBuf,
    /// `Content-Type` of the body
    pub mime_type: String,
    /// Keep the response body instead of discarding it
    pub return_response: bool,
}

impl SendRequest {
    /// Validate a raw send map
    pub fn from_value(raw: &Value, default_interval_ms: u64) -> Result<Self> {
        let fields = Fields::root(raw)?;

        let task_id = fields.required_str(PARAMETER_TASK_ID)?;
        let url = fields.required_str(PARAMETER_URL)?;
        let path = fields.required_str(PARAMETER_ABSOLUTE_FILE_PATH)?;

        non_empty(PARAMETER_TASK_ID, task_id)?;
        non_empty(PARAMETER_URL, url)?;
        non_empty(PARAMETER_ABSOLUTE_FILE_PATH, path)?;

        let common = Common::build(&fields, task_id, url, Method::POST, default_interval_ms)?;
        let mime_type = fields
            .optional_str(PARAMETER_MIME_TYPE)?
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        let return_response = fields
            .optional_bool(PARAMETER_RETURN_RESPONSE)?
            .unwrap_or(false);

        Ok(Self {
            common,
            absolute_file_path: PathBuf::from(strip_file_scheme(path)),
            mime_type,
            return_response,
        })
    }
}
