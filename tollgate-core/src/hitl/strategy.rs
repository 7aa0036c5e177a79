//! One stateless strategy per interaction type.
//!
//! A strategy turns caller data into a typed [`HitlRequest`], pulls the
//! useful value out of a raw response payload, and decides what a request
//! degrades to when nobody answers.

use log::warn;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use super::types::{
    ClarificationData, ConversationScope, DecisionData, EnvVarData, HitlError, HitlPayload,
    HitlRequest, InteractionOption, InteractionType, PermissionData,
};
use crate::config::HitlConfig;

/// Request construction, response extraction and defaulting for one
/// interaction type.
pub trait HitlStrategy: Send + Sync + fmt::Debug {
    /// The interaction type handled.
    fn interaction_type(&self) -> InteractionType;

    /// Wait used when the caller gives none.
    fn default_timeout(&self, config: &HitlConfig) -> Duration {
        config.timeout_for(self.interaction_type())
    }

    /// Validate caller data and build a pending request.
    fn create_request(
        &self,
        id: &str,
        scope: &ConversationScope,
        data: Value,
        timeout: Duration,
    ) -> Result<HitlRequest, HitlError>;

    /// The value handed back to the waiting caller for a response payload.
    fn extract_response_value(&self, request: &HitlRequest, payload: &Value) -> Value;

    /// Value used on timeout or cancellation. `None` means the request
    /// has no safe default and degrades to denial.
    fn default_response(&self, request: &HitlRequest) -> Option<Value>;
}

/// Strategy for an interaction type.
pub fn strategy_for(interaction_type: InteractionType) -> &'static dyn HitlStrategy {
    match interaction_type {
        InteractionType::Clarification => &ClarificationStrategy,
        InteractionType::Decision => &DecisionStrategy,
        InteractionType::EnvVar => &EnvVarStrategy,
        InteractionType::Permission => &PermissionStrategy,
    }
}

/// True when a payload marks the request as cancelled or timed out.
pub fn is_cancellation(payload: &Value) -> bool {
    ["cancelled", "timed_out", "timedOut"]
        .iter()
        .any(|key| payload.get(key).and_then(Value::as_bool) == Some(true))
}

fn parse<T: DeserializeOwned>(interaction_type: InteractionType, data: Value) -> Result<T, HitlError> {
    serde_json::from_value(data).map_err(|e| invalid(interaction_type, e.to_string()))
}

fn invalid(interaction_type: InteractionType, reason: impl Into<String>) -> HitlError {
    HitlError::InvalidRequest {
        interaction_type,
        reason: reason.into(),
    }
}

fn preferred_option(options: &[InteractionOption]) -> Option<&InteractionOption> {
    options
        .iter()
        .find(|o| o.recommended)
        .or_else(|| options.first())
}

/// Free-form questions with optional suggested answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClarificationStrategy;

impl HitlStrategy for ClarificationStrategy {
    fn interaction_type(&self) -> InteractionType {
        InteractionType::Clarification
    }

    fn create_request(
        &self,
        id: &str,
        scope: &ConversationScope,
        data: Value,
        timeout: Duration,
    ) -> Result<HitlRequest, HitlError> {
        let data: ClarificationData = parse(self.interaction_type(), data)?;
        if data.question.trim().is_empty() {
            return Err(invalid(self.interaction_type(), "question is empty"));
        }
        if !data.allow_custom && data.options.is_empty() {
            return Err(invalid(
                self.interaction_type(),
                "custom answers are disabled but no options were given",
            ));
        }
        Ok(HitlRequest::new(
            id,
            scope,
            HitlPayload::Clarification(data),
            timeout,
        ))
    }

    fn extract_response_value(&self, _request: &HitlRequest, payload: &Value) -> Value {
        payload.get("answer").cloned().unwrap_or_else(|| payload.clone())
    }

    fn default_response(&self, request: &HitlRequest) -> Option<Value> {
        let HitlPayload::Clarification(data) = &request.payload else {
            return None;
        };
        let answer = data
            .default_value
            .clone()
            .or_else(|| preferred_option(&data.options).map(|o| o.id.clone()))
            .unwrap_or_default();
        Some(Value::String(answer))
    }
}

/// Choice between explicit options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionStrategy;

impl HitlStrategy for DecisionStrategy {
    fn interaction_type(&self) -> InteractionType {
        InteractionType::Decision
    }

    fn create_request(
        &self,
        id: &str,
        scope: &ConversationScope,
        data: Value,
        timeout: Duration,
    ) -> Result<HitlRequest, HitlError> {
        let data: DecisionData = parse(self.interaction_type(), data)?;
        if data.options.is_empty() {
            return Err(invalid(self.interaction_type(), "no options given"));
        }
        if let Some(default) = &data.default_option {
            if !data.options.iter().any(|o| &o.id == default) {
                return Err(invalid(
                    self.interaction_type(),
                    format!("default option '{}' is not one of the options", default),
                ));
            }
        }
        Ok(HitlRequest::new(id, scope, HitlPayload::Decision(data), timeout))
    }

    fn extract_response_value(&self, _request: &HitlRequest, payload: &Value) -> Value {
        payload
            .get("decision")
            .cloned()
            .unwrap_or_else(|| payload.clone())
    }

    fn default_response(&self, request: &HitlRequest) -> Option<Value> {
        let HitlPayload::Decision(data) = &request.payload else {
            return None;
        };
        data.default_option
            .clone()
            .or_else(|| preferred_option(&data.options).map(|o| o.id.clone()))
            .map(Value::String)
    }
}

/// Collection of environment values such as credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvVarStrategy;

impl EnvVarStrategy {
    fn defaults(data: &EnvVarData) -> Map<String, Value> {
        data.fields
            .iter()
            .filter_map(|f| {
                f.default_value
                    .as_ref()
                    .map(|v| (f.name.clone(), Value::String(v.clone())))
            })
            .collect()
    }
}

impl HitlStrategy for EnvVarStrategy {
    fn interaction_type(&self) -> InteractionType {
        InteractionType::EnvVar
    }

    fn create_request(
        &self,
        id: &str,
        scope: &ConversationScope,
        data: Value,
        timeout: Duration,
    ) -> Result<HitlRequest, HitlError> {
        let data: EnvVarData = parse(self.interaction_type(), data)?;
        if data.fields.is_empty() {
            return Err(invalid(self.interaction_type(), "no fields given"));
        }
        if let Some(field) = data.fields.iter().find(|f| f.name.trim().is_empty()) {
            return Err(invalid(
                self.interaction_type(),
                format!("field with label {:?} has no name", field.label),
            ));
        }
        Ok(HitlRequest::new(id, scope, HitlPayload::EnvVar(data), timeout))
    }

    fn extract_response_value(&self, request: &HitlRequest, payload: &Value) -> Value {
        let HitlPayload::EnvVar(data) = &request.payload else {
            return payload.clone();
        };
        let supplied = payload.get("values").unwrap_or(payload);

        let mut values = Self::defaults(data);
        for field in &data.fields {
            match supplied.get(&field.name) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    values.insert(field.name.clone(), value.clone());
                }
            }
            if field.required && !values.contains_key(&field.name) {
                warn!(
                    "Request {} answered without required field {}",
                    request.id, field.name
                );
            }
        }
        Value::Object(values)
    }

    fn default_response(&self, request: &HitlRequest) -> Option<Value> {
        let HitlPayload::EnvVar(data) = &request.payload else {
            return None;
        };
        Some(Value::Object(Self::defaults(data)))
    }
}

/// Explicit approval of a tool action.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionStrategy;

fn action_grants(action: &str) -> bool {
    matches!(
        action.to_ascii_lowercase().as_str(),
        "allow" | "allow_always" | "approve" | "always" | "once"
    )
}

impl HitlStrategy for PermissionStrategy {
    fn interaction_type(&self) -> InteractionType {
        InteractionType::Permission
    }

    fn create_request(
        &self,
        id: &str,
        scope: &ConversationScope,
        data: Value,
        timeout: Duration,
    ) -> Result<HitlRequest, HitlError> {
        let data: PermissionData = parse(self.interaction_type(), data)?;
        if data.tool_name.trim().is_empty() {
            return Err(invalid(self.interaction_type(), "tool_name is empty"));
        }
        if let Some(action) = &data.default_action {
            if !matches!(action.as_str(), "allow" | "deny") {
                return Err(invalid(
                    self.interaction_type(),
                    format!("default_action must be 'allow' or 'deny', got '{}'", action),
                ));
            }
        }
        Ok(HitlRequest::new(id, scope, HitlPayload::Permission(data), timeout))
    }

    fn extract_response_value(&self, _request: &HitlRequest, payload: &Value) -> Value {
        let granted = match payload {
            Value::Bool(granted) => *granted,
            Value::String(action) => action_grants(action),
            _ => payload
                .get("granted")
                .and_then(Value::as_bool)
                .or_else(|| payload.get("action").and_then(Value::as_str).map(action_grants))
                .unwrap_or(false),
        };
        Value::Bool(granted)
    }

    fn default_response(&self, request: &HitlRequest) -> Option<Value> {
        let HitlPayload::Permission(data) = &request.payload else {
            return None;
        };
        data.default_action
            .as_deref()
            .map(|action| Value::Bool(action == "allow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> ConversationScope {
        ConversationScope::new("conv", "tenant", "project")
    }

    fn create(interaction_type: InteractionType, data: Value) -> Result<HitlRequest, HitlError> {
        strategy_for(interaction_type).create_request(
            "hitl_test",
            &scope(),
            data,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_lookup_matches_type() {
        for t in InteractionType::ALL {
            assert_eq!(strategy_for(t).interaction_type(), t);
        }
    }

    #[test]
    fn test_default_timeouts() {
        let config = HitlConfig::default();
        assert_eq!(
            strategy_for(InteractionType::EnvVar).default_timeout(&config),
            Duration::from_secs(600)
        );
        assert_eq!(
            strategy_for(InteractionType::Clarification).default_timeout(&config),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_clarification_defaults() {
        let free_form = create(
            InteractionType::Clarification,
            json!({"question": "What should the table be called?"}),
        )
        .unwrap();
        let strategy = ClarificationStrategy;
        assert_eq!(strategy.default_response(&free_form), Some(json!("")));

        let with_options = create(
            InteractionType::Clarification,
            json!({
                "question": "Which database?",
                "options": [
                    {"id": "sqlite", "label": "SQLite"},
                    {"id": "postgres", "label": "PostgreSQL", "recommended": true}
                ]
            }),
        )
        .unwrap();
        assert_eq!(strategy.default_response(&with_options), Some(json!("postgres")));

        let explicit = create(
            InteractionType::Clarification,
            json!({"question": "Name?", "default_value": "users"}),
        )
        .unwrap();
        assert_eq!(strategy.default_response(&explicit), Some(json!("users")));
    }

    #[test]
    fn test_clarification_validation() {
        assert!(create(InteractionType::Clarification, json!({"question": "  "})).is_err());
        assert!(create(
            InteractionType::Clarification,
            json!({"question": "Pick", "allow_custom": false})
        )
        .is_err());
        assert!(create(InteractionType::Clarification, json!({"prompt": "x"})).is_err());
    }

    #[test]
    fn test_clarification_extraction() {
        let request = create(InteractionType::Clarification, json!({"question": "Q?"})).unwrap();
        let strategy = ClarificationStrategy;
        assert_eq!(
            strategy.extract_response_value(&request, &json!({"answer": "yes"})),
            json!("yes")
        );
        assert_eq!(
            strategy.extract_response_value(&request, &json!({"answer": ["a", "b"]})),
            json!(["a", "b"])
        );
        assert_eq!(strategy.extract_response_value(&request, &json!("raw")), json!("raw"));
    }

    #[test]
    fn test_decision() {
        let err = create(
            InteractionType::Decision,
            json!({"question": "Deploy?", "options": []}),
        )
        .unwrap_err();
        assert!(matches!(err, HitlError::InvalidRequest { .. }));

        let err = create(
            InteractionType::Decision,
            json!({
                "question": "Deploy?",
                "options": [{"id": "now", "label": "Now"}],
                "default_option": "later"
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("later"));

        let request = create(
            InteractionType::Decision,
            json!({
                "question": "Deploy?",
                "options": [{"id": "now", "label": "Now"}, {"id": "later", "label": "Later"}],
                "default_option": "later"
            }),
        )
        .unwrap();
        let strategy = DecisionStrategy;
        assert_eq!(strategy.default_response(&request), Some(json!("later")));
        assert_eq!(
            strategy.extract_response_value(&request, &json!({"decision": "now"})),
            json!("now")
        );
    }

    #[test]
    fn test_env_var() {
        assert!(create(
            InteractionType::EnvVar,
            json!({"tool_name": "github", "fields": []})
        )
        .is_err());

        let request = create(
            InteractionType::EnvVar,
            json!({
                "tool_name": "github",
                "fields": [
                    {"name": "GITHUB_TOKEN", "secret": true},
                    {"name": "GITHUB_API", "required": false, "default_value": "https://api.github.com"}
                ]
            }),
        )
        .unwrap();
        let strategy = EnvVarStrategy;

        assert_eq!(
            strategy.default_response(&request),
            Some(json!({"GITHUB_API": "https://api.github.com"}))
        );

        let value = strategy.extract_response_value(
            &request,
            &json!({"values": {"GITHUB_TOKEN": "ghp_x", "UNRELATED": "dropped"}}),
        );
        assert_eq!(
            value,
            json!({"GITHUB_TOKEN": "ghp_x", "GITHUB_API": "https://api.github.com"})
        );
    }

    #[test]
    fn test_permission() {
        let bare = create(
            InteractionType::Permission,
            json!({"tool_name": "bash", "action": "rm -rf build"}),
        )
        .unwrap();
        let strategy = PermissionStrategy;
        assert_eq!(strategy.default_response(&bare), None);

        let defaulted = create(
            InteractionType::Permission,
            json!({"tool_name": "bash", "action": "ls", "default_action": "allow"}),
        )
        .unwrap();
        assert_eq!(strategy.default_response(&defaulted), Some(json!(true)));

        assert!(create(
            InteractionType::Permission,
            json!({"tool_name": "bash", "action": "ls", "default_action": "maybe"})
        )
        .is_err());

        assert_eq!(
            strategy.extract_response_value(&bare, &json!({"granted": true})),
            json!(true)
        );
        assert_eq!(
            strategy.extract_response_value(&bare, &json!({"action": "allow_always"})),
            json!(true)
        );
        assert_eq!(
            strategy.extract_response_value(&bare, &json!({"action": "deny"})),
            json!(false)
        );
        assert_eq!(strategy.extract_response_value(&bare, &json!({})), json!(false));
    }

    #[test]
    fn test_is_cancellation() {
        assert!(is_cancellation(&json!({"cancelled": true})));
        assert!(is_cancellation(&json!({"timed_out": true})));
        assert!(is_cancellation(&json!({"timedOut": true})));
        assert!(!is_cancellation(&json!({"cancelled": false, "answer": "x"})));
        assert!(!is_cancellation(&json!("cancelled")));
    }
}
