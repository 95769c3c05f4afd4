//! The tool surface: a container owning the config snapshot, session
//! manager, and flow engine, plus the four operations the MCP boundary
//! exposes. Each operation is synchronous end to end.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::config::{self, ConfigSnapshot};
use crate::core::domain::{
    COMPLETE_SENTINEL, Complexity, FlowDefinition, FlowStep, QualityFeedback, Session, StepKey,
};
use crate::core::error::{EngineError, Result};
use crate::core::ports::Clock;
use crate::engine::{FlowEngine, RecordOutcome, Selection};
use crate::persistence::SessionStore;
use crate::sessions::SessionManager;

/// Reserved template names the tool surface renders directly.
pub const COMPLETION_TEMPLATE: &str = "completion";
pub const SUMMARY_TEMPLATE: &str = "final_summary";

pub const ANALYSIS_TYPES: [&str; 5] = ["quality", "format", "completeness", "bias", "logic"];

const MAX_TOPIC_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct StartThinkingInput {
    pub topic: String,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub focus: Option<String>,
    #[serde(default)]
    pub flow_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NextStepInput {
    pub session_id: String,
    pub step_result: String,
    #[serde(default)]
    pub quality_feedback: Option<QualityFeedback>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeStepInput {
    pub session_id: String,
    pub step_name: String,
    pub step_result: String,
    pub analysis_type: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteThinkingInput {
    pub session_id: String,
    #[serde(default)]
    pub final_insights: Option<String>,
}

/// Successful tool response, identical in shape across all four tools.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub session_id: String,
    pub step: String,
    pub prompt_template: String,
    pub instructions: String,
    pub context: Value,
    pub next_action: String,
    pub metadata: Value,
}

/// Structured error envelope; the same shape regardless of the failing tool.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: bool,
    pub error_code: String,
    pub error_message: String,
    pub details: Value,
    pub recovery_suggestions: Vec<String>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &EngineError) -> Self {
        Self {
            error: true,
            error_code: err.error_code().to_string(),
            error_message: err.to_string(),
            details: err.details(),
            recovery_suggestions: err.recovery_suggestions(),
        }
    }
}

pub struct ThinkingService {
    config_path: Option<PathBuf>,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    sessions: SessionManager,
    engine: FlowEngine,
    clock: Arc<dyn Clock>,
}

impl ThinkingService {
    /// Load the config at `path` and wire the full container.
    pub fn bootstrap(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let snapshot = config::load(path)?;
        let store = SessionStore::open(&snapshot.server.resolved_database_path())?;
        Ok(Self::assemble(snapshot, store, clock, Some(path.to_path_buf())))
    }

    /// Wire the container from pre-built parts; used by tests.
    pub fn from_parts(snapshot: ConfigSnapshot, store: SessionStore, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(snapshot, store, clock, None)
    }

    fn assemble(
        snapshot: ConfigSnapshot,
        store: SessionStore,
        clock: Arc<dyn Clock>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let sessions = SessionManager::new(
            store,
            clock.clone(),
            snapshot.server.session_cache_size,
            snapshot.server.session_timeout_minutes,
            snapshot.server.max_sessions,
        );
        Self {
            config_path,
            snapshot: RwLock::new(Arc::new(snapshot)),
            sessions,
            engine: FlowEngine::new(),
            clock,
        }
    }

    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().clone()
    }

    /// Re-read the config file and swap the snapshot. In-flight calls keep
    /// the snapshot they cloned at entry.
    pub fn reload(&self) -> Result<()> {
        let path = self.config_path.as_ref().ok_or_else(|| {
            EngineError::ConfigInvalid("no config path to reload from".into())
        })?;
        let fresh = config::load(path)?;
        *self.snapshot.write() = Arc::new(fresh);
        info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }

    pub fn expire_stale(&self) -> Result<usize> {
        self.sessions.expire_stale()
    }

    #[instrument(skip_all, fields(tool = "start_thinking"))]
    pub fn start_thinking(&self, input: StartThinkingInput) -> Result<ToolResult> {
        let topic = input.topic.trim().to_string();
        if topic.is_empty() {
            return Err(EngineError::Validation("topic must not be empty".into()));
        }
        if input.topic.chars().count() > MAX_TOPIC_CHARS {
            return Err(EngineError::Validation(format!(
                "topic exceeds {MAX_TOPIC_CHARS} characters"
            )));
        }
        let complexity = match input.complexity.as_deref() {
            None => Complexity::default(),
            Some(raw) => Complexity::parse(raw).ok_or_else(|| {
                EngineError::Validation(format!(
                    "complexity must be one of simple, moderate, complex; got '{raw}'"
                ))
            })?,
        };

        let snapshot = self.snapshot();
        let flow_type = input
            .flow_type
            .unwrap_or_else(|| snapshot.server.default_flow.clone());
        let flow = snapshot
            .flow(&flow_type)
            .cloned()
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_type: flow_type.clone(),
                suggestion: closest_name(&flow_type, &snapshot.flow_names()),
            })?;

        let now = self.clock.now_ms();
        let mut context = Map::new();
        context.insert("topic".into(), json!(topic));
        context.insert("complexity".into(), json!(complexity.as_str()));
        if let Some(focus) = &input.focus {
            context.insert("focus".into(), json!(focus));
        }
        context.insert("created_at".into(), json!(now));

        let first_step_name = flow.first_step().name.clone();
        let mut session = self
            .sessions
            .create(&topic, &flow_type, &first_step_name, context)?;
        let mut touched = Vec::new();
        self.engine.begin(&mut session, &flow, now, &mut touched);

        let step = flow.first_step();
        let params = step_params(&session, step, None);
        let (prompt, fallback) =
            self.render_step(&snapshot, &mut session, step, &params, now, &mut touched)?;
        self.commit_or_fail(&mut session, &touched)?;

        info!(session_id = %session.session_id, flow_type, step = %step.name, "thinking session started");
        Ok(ToolResult {
            tool_name: "start_thinking".into(),
            session_id: session.session_id.clone(),
            step: step.name.clone(),
            prompt_template: prompt,
            instructions: step.instructions.clone(),
            context: Value::Object(params),
            next_action: "Work through the prompt above, then call next_step with your full answer as step_result.".into(),
            metadata: step_metadata(&flow, step, &session, fallback, None),
        })
    }

    #[instrument(skip_all, fields(tool = "next_step", session_id = %input.session_id))]
    pub fn next_step(&self, input: NextStepInput) -> Result<ToolResult> {
        if let Some(feedback) = &input.quality_feedback
            && !(0.0..=1.0).contains(&feedback.quality_score)
        {
            return Err(EngineError::Validation(format!(
                "quality_score must be within [0, 1]; got {}",
                feedback.quality_score
            )));
        }
        let lock = self.sessions.lock(&input.session_id);
        let _guard = lock.lock();

        let snapshot = self.snapshot();
        let mut session = self.sessions.get(&input.session_id, true)?;
        let flow = self.flow_for(&snapshot, &session)?;
        let now = self.clock.now_ms();
        let mut touched = Vec::new();

        let outcome = self.engine.record_result(
            &mut session,
            &flow,
            &input.step_result,
            input.quality_feedback.as_ref(),
            now,
            &mut touched,
        )?;

        match outcome {
            RecordOutcome::AlreadyComplete => {
                return Ok(self.completion_result(&snapshot, &session, "next_step"));
            }
            RecordOutcome::GatedRetry { retry_count } => {
                let (_, step) = flow.step(&session.cursor.step_name).ok_or_else(|| {
                    EngineError::Internal("cursor step vanished mid-call".into())
                })?;
                let iteration = self.current_iteration(&session, step)?;
                let params = step_params(&session, step, iteration.as_ref());
                let prompt = match snapshot.templates.get(&step.template_name, &params) {
                    Ok(prompt) => prompt,
                    Err(EngineError::TemplateNotFound(name)) => {
                        snapshot.templates.fallback(&name, &params)
                    }
                    Err(err) => return Err(err),
                };
                self.commit_or_fail(&mut session, &touched)?;
                return Ok(ToolResult {
                    tool_name: "next_step".into(),
                    session_id: session.session_id.clone(),
                    step: step.name.clone(),
                    prompt_template: prompt,
                    instructions: step.instructions.clone(),
                    context: Value::Object(params),
                    next_action: format!(
                        "The previous answer scored below this step's threshold. Improve it and resubmit via next_step (attempt {} of 3).",
                        retry_count + 1
                    ),
                    metadata: step_metadata(&flow, step, &session, false, iteration.as_ref()),
                });
            }
            RecordOutcome::Recorded => {}
        }

        let selection = match self.engine.select_next(&mut session, &flow, now, &mut touched) {
            Ok(selection) => selection,
            Err(err @ EngineError::ForEachResolution { .. }) => {
                // The recorded result and the failed consumer entry survive.
                self.commit_or_fail(&mut session, &touched)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match &selection {
            Selection::Complete => {
                self.engine
                    .commit_selection(&mut session, &flow, &selection, now, &mut touched);
                self.commit_or_fail(&mut session, &touched)?;
                Ok(self.completion_result(&snapshot, &session, "next_step"))
            }
            Selection::Enter { step_index } => {
                let step = &flow.steps[*step_index];
                let params = step_params(&session, step, None);
                match snapshot.templates.get(&step.template_name, &params) {
                    Ok(prompt) => {
                        self.engine
                            .commit_selection(&mut session, &flow, &selection, now, &mut touched);
                        self.commit_or_fail(&mut session, &touched)?;
                        Ok(ToolResult {
                            tool_name: "next_step".into(),
                            session_id: session.session_id.clone(),
                            step: step.name.clone(),
                            prompt_template: prompt,
                            instructions: step.instructions.clone(),
                            context: Value::Object(params),
                            next_action: "Work through the prompt above, then call next_step with your full answer as step_result.".into(),
                            metadata: step_metadata(&flow, step, &session, false, None),
                        })
                    }
                    Err(err) => self.render_failure(
                        &snapshot, &mut session, &flow, step, None, params, err, now, touched,
                    ),
                }
            }
            Selection::Iterate {
                step_index,
                iteration,
                total,
                item,
            } => {
                let step = &flow.steps[*step_index];
                let iter_ctx = (*iteration, *total, item.clone());
                let params = step_params(&session, step, Some(&iter_ctx));
                match snapshot.templates.get(&step.template_name, &params) {
                    Ok(prompt) => {
                        self.engine
                            .commit_selection(&mut session, &flow, &selection, now, &mut touched);
                        self.commit_or_fail(&mut session, &touched)?;
                        Ok(ToolResult {
                            tool_name: "next_step".into(),
                            session_id: session.session_id.clone(),
                            step: step.name.clone(),
                            prompt_template: prompt,
                            instructions: step.instructions.clone(),
                            context: Value::Object(params),
                            next_action: format!(
                                "Answer for item {} of {}, then call next_step to continue.",
                                iteration + 1,
                                total
                            ),
                            metadata: step_metadata(&flow, step, &session, false, Some(&iter_ctx)),
                        })
                    }
                    Err(err) => self.render_failure(
                        &snapshot,
                        &mut session,
                        &flow,
                        step,
                        Some(*iteration),
                        params,
                        err,
                        now,
                        touched,
                    ),
                }
            }
        }
    }

    #[instrument(skip_all, fields(tool = "analyze_step", session_id = %input.session_id))]
    pub fn analyze_step(&self, input: AnalyzeStepInput) -> Result<ToolResult> {
        if !ANALYSIS_TYPES.contains(&input.analysis_type.as_str()) {
            return Err(EngineError::Validation(format!(
                "analysis_type must be one of {}; got '{}'",
                ANALYSIS_TYPES.join(", "),
                input.analysis_type
            )));
        }
        let snapshot = self.snapshot();
        let session = self.sessions.get(&input.session_id, true)?;
        let flow = self.flow_for(&snapshot, &session)?;
        if flow.step(&input.step_name).is_none() {
            return Err(EngineError::StepNotFound {
                flow_type: flow.flow_type.clone(),
                step: input.step_name.clone(),
            });
        }

        let template_name = format!("analyze_{}", input.analysis_type);
        let mut params = session.context.clone();
        params.insert("topic".into(), json!(session.topic));
        params.insert("step_name".into(), json!(input.step_name));
        params.insert("step_result".into(), json!(input.step_result));
        params.insert("analysis_type".into(), json!(input.analysis_type));

        let prompt = match snapshot.templates.get(&template_name, &params) {
            Ok(prompt) => prompt,
            Err(EngineError::TemplateNotFound(name)) => {
                snapshot.templates.fallback(&name, &params)
            }
            Err(err) => return Err(err),
        };

        Ok(ToolResult {
            tool_name: "analyze_step".into(),
            session_id: session.session_id.clone(),
            step: input.step_name.clone(),
            prompt_template: prompt,
            instructions: "Evaluate the step output and produce a quality_score between 0.0 and 1.0 with concrete findings.".into(),
            context: Value::Object(params),
            next_action: "Feed your score back through next_step.quality_feedback to drive the quality gate.".into(),
            metadata: json!({
                "flow_type": flow.flow_type,
                "analysis_type": input.analysis_type,
                "cursor_step": session.cursor.step_name,
            }),
        })
    }

    #[instrument(skip_all, fields(tool = "complete_thinking", session_id = %input.session_id))]
    pub fn complete_thinking(&self, input: CompleteThinkingInput) -> Result<ToolResult> {
        let lock = self.sessions.lock(&input.session_id);
        let _guard = lock.lock();

        let snapshot = self.snapshot();
        let mut session = self.sessions.get(&input.session_id, true)?;
        let flow = self.flow_for(&snapshot, &session)?;

        if let Some(insights) = &input.final_insights {
            session
                .context
                .insert("final_insights".into(), json!(insights));
        }
        session.status = crate::core::domain::SessionStatus::Completed;
        self.commit_or_fail(&mut session, &[])?;

        let mut params = session.context.clone();
        params.insert("topic".into(), json!(session.topic));
        params.insert("session_id".into(), json!(session.session_id));
        params.insert("step_history".into(), Value::Array(session.step_history()));
        params.insert(
            "final_insights".into(),
            json!(input.final_insights.as_deref().unwrap_or("")),
        );

        let prompt = match snapshot.templates.get(SUMMARY_TEMPLATE, &params) {
            Ok(prompt) => prompt,
            Err(EngineError::TemplateNotFound(name)) => {
                snapshot.templates.fallback(&name, &params)
            }
            Err(err) => return Err(err),
        };

        info!(session_id = %session.session_id, steps_completed = session.completed_results(), "thinking session completed");
        Ok(ToolResult {
            tool_name: "complete_thinking".into(),
            session_id: session.session_id.clone(),
            step: COMPLETE_SENTINEL.into(),
            prompt_template: prompt,
            instructions: "Produce the final report for the user from the prompt above.".into(),
            context: Value::Object(params),
            next_action: "Session closed. Start a new topic with start_thinking.".into(),
            metadata: json!({
                "flow_type": flow.flow_type,
                "steps_completed": session.completed_results(),
                "quality_scores": session.quality_scores,
            }),
        })
    }

    fn flow_for(
        &self,
        snapshot: &ConfigSnapshot,
        session: &Session,
    ) -> Result<Arc<FlowDefinition>> {
        snapshot
            .flow(&session.flow_type)
            .cloned()
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_type: session.flow_type.clone(),
                suggestion: closest_name(&session.flow_type, &snapshot.flow_names()),
            })
    }

    /// Items plus index for the cursor's active iteration, if any.
    fn current_iteration(
        &self,
        session: &Session,
        step: &FlowStep,
    ) -> Result<Option<(u32, u32, Value)>> {
        let (Some(for_each), Some(k)) = (&step.for_each, session.cursor.iteration_index) else {
            return Ok(None);
        };
        let items = self.engine.resolve_items(session, for_each)?;
        let item = items.get(k as usize).cloned().unwrap_or(Value::Null);
        Ok(Some((k, items.len() as u32, item)))
    }

    /// Render the prompt for a freshly entered step; a missing template
    /// degrades to the generic fallback and records the step as failed.
    fn render_step(
        &self,
        snapshot: &ConfigSnapshot,
        session: &mut Session,
        step: &FlowStep,
        params: &Map<String, Value>,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) -> Result<(String, bool)> {
        match snapshot.templates.get(&step.template_name, params) {
            Ok(prompt) => Ok((prompt, false)),
            Err(EngineError::TemplateNotFound(name)) => {
                warn!(template = %name, step = %step.name, "template missing, serving fallback");
                self.engine
                    .mark_step_failed(session, &step.name, None, now, touched);
                Ok((snapshot.templates.fallback(&name, params), true))
            }
            Err(err) => Err(err),
        }
    }

    /// Shared failure path when the next step's template cannot render: the
    /// target step is marked failed and the cursor stays put.
    #[allow(clippy::too_many_arguments)]
    fn render_failure(
        &self,
        snapshot: &ConfigSnapshot,
        session: &mut Session,
        flow: &FlowDefinition,
        step: &FlowStep,
        iteration: Option<u32>,
        params: Map<String, Value>,
        err: EngineError,
        now: i64,
        mut touched: Vec<StepKey>,
    ) -> Result<ToolResult> {
        let EngineError::TemplateNotFound(name) = err else {
            return Err(err);
        };
        warn!(template = %name, step = %step.name, "template missing, holding cursor");
        self.engine
            .mark_step_failed(session, &step.name, iteration, now, &mut touched);
        self.commit_or_fail(session, &touched)?;
        let prompt = snapshot.templates.fallback(&name, &params);
        Ok(ToolResult {
            tool_name: "next_step".into(),
            session_id: session.session_id.clone(),
            step: step.name.clone(),
            prompt_template: prompt,
            instructions: step.instructions.clone(),
            context: Value::Object(params),
            next_action: "The step's template is missing on this server; fix the configuration and call next_step again.".into(),
            metadata: json!({
                "flow_type": flow.flow_type,
                "template_fallback": true,
                "failed_template": name,
            }),
        })
    }

    fn completion_result(
        &self,
        snapshot: &ConfigSnapshot,
        session: &Session,
        tool_name: &str,
    ) -> ToolResult {
        let mut params = session.context.clone();
        params.insert("topic".into(), json!(session.topic));
        params.insert("session_id".into(), json!(session.session_id));
        params.insert("step_number".into(), json!(session.step_number));
        let prompt = match snapshot.templates.get(COMPLETION_TEMPLATE, &params) {
            Ok(prompt) => prompt,
            Err(_) => snapshot.templates.fallback(COMPLETION_TEMPLATE, &params),
        };
        ToolResult {
            tool_name: tool_name.into(),
            session_id: session.session_id.clone(),
            step: COMPLETE_SENTINEL.into(),
            prompt_template: prompt,
            instructions: String::new(),
            context: Value::Object(params),
            next_action: "All steps finished. Call complete_thinking to close the session with a final summary.".into(),
            metadata: json!({
                "flow_type": session.flow_type,
                "steps_completed": session.completed_results(),
            }),
        }
    }

    fn commit_or_fail(&self, session: &mut Session, touched: &[StepKey]) -> Result<()> {
        self.sessions.commit(session, touched).inspect_err(|_| {
            self.sessions.mark_failed(&session.session_id);
        })
    }
}

fn step_params(
    session: &Session,
    step: &FlowStep,
    iteration: Option<&(u32, u32, Value)>,
) -> Map<String, Value> {
    let mut params = session.context.clone();
    params.insert("topic".into(), json!(session.topic));
    params.insert("session_id".into(), json!(session.session_id));
    params.insert("step_name".into(), json!(step.name));
    params.insert("step_number".into(), json!(session.step_number));
    if let Some((index, total, item)) = iteration {
        params.insert("item".into(), item.clone());
        params.insert("iteration_index".into(), json!(index));
        params.insert("total_items".into(), json!(total));
    }
    params
}

fn step_metadata(
    flow: &FlowDefinition,
    step: &FlowStep,
    session: &Session,
    template_fallback: bool,
    iteration: Option<&(u32, u32, Value)>,
) -> Value {
    let mut metadata = json!({
        "flow_type": flow.flow_type,
        "total_steps": flow.steps.len(),
        "step_number": session.step_number,
        "quality_threshold": step.quality_threshold,
        "retry_count": session.cursor.retry_count,
        "expected_output": step.expected_output.as_str(),
        "final": step.is_final,
    });
    if template_fallback {
        metadata["template_fallback"] = json!(true);
    }
    if let Some((index, total, _)) = iteration {
        metadata["iteration"] = json!({ "index": index, "total": total });
    }
    metadata
}

/// Closest known name by Jaro-Winkler similarity, for "did you mean" hints.
fn closest_name(input: &str, known: &[String]) -> Option<String> {
    known
        .iter()
        .map(|name| (strsim::jaro_winkler(input, name), name))
        .filter(|(score, _)| *score > 0.8)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, name)| name.clone())
}
