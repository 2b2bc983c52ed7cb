//! Schedule adoption tool: books a pickup appointment for the caller.
//!
//! Appointments are always five days out. The appointment is made for the
//! verified principal of the turn, so this tool requires an authenticated
//! caller.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolContext, ToolOutput};
use serde::{Deserialize, Serialize};

const LEAD_TIME_DAYS: i64 = 5;

pub struct ScheduleAdoptionTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleArgs {
    dog_id: i64,
    #[serde(default)]
    dog_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Appointment {
    username: String,
    appointment: String,
    dog_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dog_name: Option<String>,
}

#[async_trait]
impl Tool for ScheduleAdoptionTool {
    fn name(&self) -> &str {
        "schedule_adoption"
    }

    fn description(&self) -> &str {
        "Schedule an appointment to pick up or adopt a dog from a Pooch Palace location. \
         Returns the appointment time for the signed-in user."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "dogId": {
                    "type": "integer",
                    "description": "The id of the dog to adopt"
                },
                "dogName": {
                    "type": "string",
                    "description": "The name of the dog"
                }
            },
            "required": ["dogId"]
        })
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let principal = ctx.principal.as_ref().ok_or_else(|| ToolError::Unauthorized {
            tool_name: self.name().into(),
            reason: "no caller identity on this call".into(),
        })?;
        let args: ScheduleArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("schedule_adoption: {e}")))?;

        let appointment = Appointment {
            username: principal.name.clone(),
            appointment: (Utc::now() + Duration::days(LEAD_TIME_DAYS)).to_rfc3339(),
            dog_id: args.dog_id,
            dog_name: args.dog_name,
        };
        tracing::info!(
            username = %appointment.username,
            dog_id = appointment.dog_id,
            "Adoption appointment scheduled"
        );

        let value = serde_json::to_value(&appointment)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        Ok(ToolOutput::json(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::auth::Principal;

    fn ctx(principal: Option<&str>) -> ToolContext {
        ToolContext {
            correlation_id: "call_1".into(),
            principal: principal.map(Principal::new),
        }
    }

    #[tokio::test]
    async fn books_five_days_out_for_caller() {
        let output = ScheduleAdoptionTool
            .execute(serde_json::json!({"dogId": 45, "dogName": "Prancer"}), &ctx(Some("george")))
            .await
            .unwrap();
        let value = output.structured.unwrap();
        assert_eq!(value["username"], "george");
        assert_eq!(value["dogId"], 45);

        let at = chrono::DateTime::parse_from_rfc3339(value["appointment"].as_str().unwrap()).unwrap();
        let hours = (at.with_timezone(&Utc) - Utc::now()).num_hours();
        assert!((119..=120).contains(&hours), "appointment {hours}h out");
    }

    #[tokio::test]
    async fn refuses_without_principal() {
        let err = ScheduleAdoptionTool
            .execute(serde_json::json!({"dogId": 45}), &ctx(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn missing_dog_id_is_invalid() {
        let err = ScheduleAdoptionTool
            .execute(serde_json::json!({"dogName": "Prancer"}), &ctx(Some("george")))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn declared_as_auth_required() {
        let descriptor = ScheduleAdoptionTool.descriptor("authserver");
        assert!(descriptor.auth.is_required());
        assert_eq!(descriptor.input_schema["required"][0], "dogId");
    }
}
