//! Current time tool.

use async_trait::async_trait;
use chrono::Utc;
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolContext, ToolOutput};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let now = Utc::now();
        Ok(ToolOutput::json(serde_json::json!({
            "utc": now.to_rfc3339(),
            "unix": now.timestamp(),
        })))
    }
}
