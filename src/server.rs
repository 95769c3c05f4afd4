//! MCP boundary: a line-delimited JSON-RPC 2.0 loop over stdio.
//!
//! This module is transport only. It advertises the four tools, decodes
//! `tools/call` requests into typed inputs, and wraps service results (or
//! error envelopes) as MCP content. No orchestration logic lives here.
//! Logging goes to stderr; stdout belongs to the protocol.

use std::{sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::core::error::EngineError;
use crate::service::{
    AnalyzeStepInput, CompleteThinkingInput, ErrorEnvelope, NextStepInput, StartThinkingInput,
    ThinkingService, ToolResult,
};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Background expiry cadence; sweeps also run on every session cache miss.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct McpServer {
    service: Arc<ThinkingService>,
}

impl McpServer {
    pub fn new(service: Arc<ThinkingService>) -> Self {
        Self { service }
    }

    /// Serve requests from stdin until it closes. SIGHUP re-reads the
    /// configuration file and swaps the snapshot.
    pub async fn run_stdio(&self) -> Result<()> {
        let sweeper = tokio::spawn(expiry_sweep(self.service.clone()));
        #[cfg(unix)]
        let reloader = tokio::spawn(reload_on_sighup(self.service.clone()));
        info!(protocol = PROTOCOL_VERSION, "MCP server listening on stdio");

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines.next_line().await.context("reading stdin")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(line) {
                let mut payload =
                    serde_json::to_string(&response).context("encoding response")?;
                payload.push('\n');
                stdout
                    .write_all(payload.as_bytes())
                    .await
                    .context("writing stdout")?;
                stdout.flush().await.context("flushing stdout")?;
            }
        }

        sweeper.abort();
        #[cfg(unix)]
        reloader.abort();
        info!("stdin closed, shutting down");
        Ok(())
    }

    /// Process one raw request line. Notifications produce no response.
    fn handle_line(&self, line: &str) -> Option<Value> {
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                return Some(rpc_error(Value::Null, -32700, &format!("parse error: {err}")));
            }
        };
        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = id else {
            debug!(method, "notification received");
            return None;
        };

        let result = match method.as_str() {
            "initialize" => initialize_result(),
            "ping" => json!({}),
            "tools/list" => json!({ "tools": tool_definitions() }),
            "tools/call" => self.call_tool(&params),
            other => {
                return Some(rpc_error(id, -32601, &format!("method '{other}' not found")));
            }
        };
        Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    fn call_tool(&self, params: &Value) -> Value {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let outcome: crate::core::error::Result<ToolResult> = match name {
            "start_thinking" => {
                parse_args::<StartThinkingInput>(arguments).and_then(|i| self.service.start_thinking(i))
            }
            "next_step" => {
                parse_args::<NextStepInput>(arguments).and_then(|i| self.service.next_step(i))
            }
            "analyze_step" => {
                parse_args::<AnalyzeStepInput>(arguments).and_then(|i| self.service.analyze_step(i))
            }
            "complete_thinking" => parse_args::<CompleteThinkingInput>(arguments)
                .and_then(|i| self.service.complete_thinking(i)),
            other => Err(EngineError::Validation(format!("unknown tool '{other}'"))),
        };

        match outcome {
            Ok(result) => {
                let payload = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
                tool_content(&payload, false)
            }
            Err(err) => {
                debug!(tool = name, code = err.error_code(), error = %err, "tool call failed");
                let envelope = ErrorEnvelope::from_error(&err);
                let payload = serde_json::to_value(&envelope).unwrap_or_else(|_| json!({}));
                tool_content(&payload, true)
            }
        }
    }
}

#[cfg(unix)]
async fn reload_on_sighup(service: Arc<ThinkingService>) {
    let Ok(mut hangup) =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
    else {
        error!("cannot install SIGHUP handler; reload disabled");
        return;
    };
    while hangup.recv().await.is_some() {
        match service.reload() {
            Ok(()) => info!("SIGHUP: configuration reloaded"),
            Err(err) => error!(error = %err, "SIGHUP: reload failed, keeping old snapshot"),
        }
    }
}

async fn expiry_sweep(service: Arc<ThinkingService>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match service.expire_stale() {
            Ok(0) => {}
            Ok(count) => info!(count, "expiry sweep marked sessions expired"),
            Err(err) => error!(error = %err, "expiry sweep failed"),
        }
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> crate::core::error::Result<T> {
    serde_json::from_value(arguments)
        .map_err(|err| EngineError::Validation(format!("invalid tool arguments: {err}")))
}

fn tool_content(payload: &Value, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
        "isError": is_error,
    })
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "deepthink",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "start_thinking",
            "description": "Begin a deep-thinking session on a topic and receive the first step's prompt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "topic": { "type": "string", "description": "What to think about (1..1000 characters)" },
                    "complexity": { "type": "string", "enum": ["simple", "moderate", "complex"], "description": "Depth of the workflow (default moderate)" },
                    "focus": { "type": "string", "description": "Optional angle to emphasize" },
                    "flow_type": { "type": "string", "description": "Flow to run (default from server config)" }
                },
                "required": ["topic"]
            }
        }),
        json!({
            "name": "next_step",
            "description": "Submit the result of the current step and receive the next step's prompt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "step_result": { "type": "string", "description": "Your full answer for the current step" },
                    "quality_feedback": {
                        "type": "object",
                        "properties": {
                            "quality_score": { "type": "number", "minimum": 0, "maximum": 1 },
                            "feedback": { "type": "string" },
                            "improvement_areas": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["quality_score"]
                    }
                },
                "required": ["session_id", "step_result"]
            }
        }),
        json!({
            "name": "analyze_step",
            "description": "Get an evaluation prompt for a step result without advancing the flow.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "step_name": { "type": "string" },
                    "step_result": { "type": "string" },
                    "analysis_type": { "type": "string", "enum": ["quality", "format", "completeness", "bias", "logic"] }
                },
                "required": ["session_id", "step_name", "step_result", "analysis_type"]
            }
        }),
        json!({
            "name": "complete_thinking",
            "description": "Close a session and receive the final summary prompt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "final_insights": { "type": "string", "description": "Optional closing insights to fold into the summary" }
                },
                "required": ["session_id"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::core::ports::ManualClock;
    use crate::persistence::SessionStore;

    const CONFIG: &str = r#"
server:
  default_flow: basic
templates:
  ask:
    required_params: [topic]
    body: "Reason about {{topic}}."
thinking_flows:
  basic:
    steps:
      - name: think
        template_name: ask
        final: true
"#;

    fn server() -> McpServer {
        let snapshot = config::load_from_str(CONFIG, None).unwrap();
        let store = SessionStore::open(":memory:").unwrap();
        let service =
            ThinkingService::from_parts(snapshot, store, Arc::new(ManualClock::new(0)));
        McpServer::new(Arc::new(service))
    }

    #[test]
    fn initialize_reports_tools_capability() {
        let server = server();
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .unwrap();
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert!(response["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn tools_list_exposes_all_four() {
        let server = server();
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["start_thinking", "next_step", "analyze_step", "complete_thinking"]
        );
    }

    #[test]
    fn notifications_get_no_response() {
        let server = server();
        assert!(
            server
                .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .is_none()
        );
    }

    #[test]
    fn unknown_method_is_rpc_error() {
        let server = server();
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#)
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[test]
    fn tool_call_returns_wrapped_result() {
        let server = server();
        let request = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"start_thinking","arguments":{"topic":"compilers"}}}"#;
        let response = server.handle_line(request).unwrap();
        assert_eq!(response["result"]["isError"], json!(false));
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["tool_name"], "start_thinking");
        assert_eq!(payload["step"], "think");
        assert!(payload["prompt_template"].as_str().unwrap().contains("compilers"));
    }

    #[test]
    fn invalid_arguments_become_error_envelope() {
        let server = server();
        let request = r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"next_step","arguments":{"session_id":"x"}}}"#;
        let response = server.handle_line(request).unwrap();
        assert_eq!(response["result"]["isError"], json!(true));
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["error"], json!(true));
        assert_eq!(payload["error_code"], "ValidationError");
        assert!(!payload["recovery_suggestions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn unknown_session_maps_to_error_code() {
        let server = server();
        let request = r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"next_step","arguments":{"session_id":"ghost","step_result":"hi"}}}"#;
        let response = server.handle_line(request).unwrap();
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["error_code"], "SessionNotFound");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let server = server();
        let response = server.handle_line("{not json").unwrap();
        assert_eq!(response["error"]["code"], -32700);
    }
}
