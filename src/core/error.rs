//! Error taxonomy for the orchestration core. Every variant maps to a stable
//! wire `error_code` so tool responses never leak untyped failures.

use serde_json::{Value, json};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied input failed validation; no state was changed.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("template '{name}' is missing required params: {missing:?}")]
    TemplateValidation { name: String, missing: Vec<String> },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' has expired")]
    SessionExpired(String),

    #[error("session '{session_id}' is {status} and accepts no further calls")]
    SessionTerminal { session_id: String, status: String },

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("flow '{flow_type}' not found")]
    FlowNotFound {
        flow_type: String,
        suggestion: Option<String>,
    },

    #[error("step '{step}' is not part of flow '{flow_type}'")]
    StepNotFound { flow_type: String, step: String },

    /// A `for_each` reference could not be resolved against the producer's
    /// structured output.
    #[error("for_each reference '{reference}' could not be resolved: {reason}")]
    ForEachResolution { reference: String, reason: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::TemplateValidation { .. } => {
                "ValidationError"
            }
            EngineError::SessionNotFound(_) => "SessionNotFound",
            EngineError::SessionExpired(_) => "SessionExpired",
            EngineError::SessionTerminal { .. } => "SessionTerminal",
            EngineError::TemplateNotFound(_) => "TemplateNotFound",
            EngineError::FlowNotFound { .. } => "FlowNotFound",
            EngineError::StepNotFound { .. } => "StepNotFound",
            EngineError::ForEachResolution { .. } => "ForEachResolutionError",
            EngineError::Storage(_) => "StorageError",
            EngineError::ConfigInvalid(_) | EngineError::Internal(_) => "InternalError",
        }
    }

    pub fn details(&self) -> Value {
        match self {
            EngineError::Validation(reason) => json!({ "reason": reason }),
            EngineError::TemplateValidation { name, missing } => {
                json!({ "template": name, "missing_params": missing })
            }
            EngineError::SessionNotFound(id)
            | EngineError::SessionExpired(id) => json!({ "session_id": id }),
            EngineError::SessionTerminal { session_id, status } => {
                json!({ "session_id": session_id, "status": status })
            }
            EngineError::TemplateNotFound(name) => json!({ "template": name }),
            EngineError::FlowNotFound {
                flow_type,
                suggestion,
            } => json!({ "flow_type": flow_type, "did_you_mean": suggestion }),
            EngineError::StepNotFound { flow_type, step } => {
                json!({ "flow_type": flow_type, "step": step })
            }
            EngineError::ForEachResolution { reference, reason } => {
                json!({ "reference": reference, "reason": reason })
            }
            EngineError::Storage(reason)
            | EngineError::ConfigInvalid(reason)
            | EngineError::Internal(reason) => json!({ "reason": reason }),
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        let suggestions: &[&str] = match self {
            EngineError::Validation(_) | EngineError::TemplateValidation { .. } => &[
                "check the tool input against the schema returned by tools/list",
            ],
            EngineError::SessionNotFound(_) => &[
                "verify the session id",
                "call start_thinking to begin a new session",
            ],
            EngineError::SessionExpired(_) => &[
                "the session idled past its timeout",
                "call start_thinking to begin a new session",
            ],
            EngineError::SessionTerminal { .. } => &[
                "this session already finished",
                "call start_thinking to begin a new session",
            ],
            EngineError::TemplateNotFound(_) => &[
                "check template names in the server configuration",
                "run `deepthink validate` against the config file",
            ],
            EngineError::FlowNotFound { .. } => &[
                "pick a flow_type defined in the server configuration",
            ],
            EngineError::StepNotFound { .. } => &[
                "pass a step_name that belongs to this session's flow",
            ],
            EngineError::ForEachResolution { .. } => &[
                "re-run the producer step so its reply contains the expected JSON array",
            ],
            EngineError::Storage(_) => &[
                "retry the call",
                "check that database_path is writable",
            ],
            EngineError::ConfigInvalid(_) | EngineError::Internal(_) => &[
                "retry the call",
                "inspect the server logs if the failure persists",
            ],
        };
        if let EngineError::FlowNotFound {
            suggestion: Some(name),
            ..
        } = self
        {
            let mut out: Vec<String> = suggestions.iter().map(|s| s.to_string()).collect();
            out.push(format!("did you mean '{name}'?"));
            return out;
        }
        suggestions.iter().map(|s| s.to_string()).collect()
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("JSON encoding failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_a_known_code() {
        let known = [
            "ValidationError",
            "SessionNotFound",
            "SessionExpired",
            "SessionTerminal",
            "TemplateNotFound",
            "FlowNotFound",
            "StepNotFound",
            "ForEachResolutionError",
            "StorageError",
            "InternalError",
        ];
        let samples = vec![
            EngineError::Validation("x".into()),
            EngineError::TemplateValidation {
                name: "t".into(),
                missing: vec!["a".into()],
            },
            EngineError::SessionNotFound("s".into()),
            EngineError::SessionExpired("s".into()),
            EngineError::SessionTerminal {
                session_id: "s".into(),
                status: "completed".into(),
            },
            EngineError::TemplateNotFound("t".into()),
            EngineError::FlowNotFound {
                flow_type: "f".into(),
                suggestion: None,
            },
            EngineError::StepNotFound {
                flow_type: "f".into(),
                step: "s".into(),
            },
            EngineError::ForEachResolution {
                reference: "a.b".into(),
                reason: "not an array".into(),
            },
            EngineError::Storage("disk".into()),
            EngineError::Internal("bug".into()),
        ];
        for err in samples {
            assert!(known.contains(&err.error_code()), "{err}");
            assert!(!err.recovery_suggestions().is_empty());
        }
    }

    #[test]
    fn flow_not_found_carries_did_you_mean() {
        let err = EngineError::FlowNotFound {
            flow_type: "comprehensive_analysi".into(),
            suggestion: Some("comprehensive_analysis".into()),
        };
        let all = err.recovery_suggestions().join("\n");
        assert!(all.contains("comprehensive_analysis"));
    }
}
