use serde_json::Value;

use super::{Fields, PARAMETER_TASK_ID, non_empty};
use crate::Result;

/// Validated cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    /// Task to cancel
    pub task_id: String,
}

impl CancelRequest {
    /// Validate a raw `{taskId}` map
    pub fn from_value(raw: &Value) -> Result<Self> {
        let fields = Fields::root(raw)?;
        let task_id = fields.required_str(PARAMETER_TASK_ID)?;
        non_empty(PARAMETER_TASK_ID, task_id)?;

        Ok(Self {
            task_id: task_id.to_string(),
        })
    }
}
