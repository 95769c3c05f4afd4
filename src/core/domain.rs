//! Runtime state for thinking sessions and the immutable flow definitions
//! they execute against.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::expr::CompiledExpr;

/// Cursor value once a flow has no further steps.
pub const COMPLETE_SENTINEL: &str = "__complete__";

/// Maximum quality-gate retries per work unit (attempts = RETRY_MAX + 1).
pub const RETRY_MAX: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "simple" => Some(Complexity::Simple),
            "moderate" => Some(Complexity::Moderate),
            "complex" => Some(Complexity::Complex),
            _ => None,
        }
    }
}

/// One recorded execution of a work unit. Plain steps hold a single entry;
/// `for_each` steps hold one entry per iteration.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub iteration_index: Option<u32>,
    pub status: StepStatus,
    pub raw_text: Option<String>,
    pub structured_output: Option<Value>,
    pub quality_score: Option<f64>,
    pub retry_count: u32,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl StepResult {
    pub fn pending(step_name: &str, iteration_index: Option<u32>, now: i64) -> Self {
        Self {
            step_name: step_name.to_string(),
            iteration_index,
            status: StepStatus::Pending,
            raw_text: None,
            structured_output: None,
            quality_score: None,
            retry_count: 0,
            started_at: now,
            finished_at: None,
        }
    }
}

/// The next work unit for a session: a step name (or the completion
/// sentinel), an iteration index while fanned out, and the retry counter
/// for the current unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub step_name: String,
    pub iteration_index: Option<u32>,
    pub retry_count: u32,
}

impl Cursor {
    pub fn at(step_name: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            iteration_index: None,
            retry_count: 0,
        }
    }

    pub fn complete() -> Self {
        Self::at(COMPLETE_SENTINEL)
    }

    pub fn is_complete(&self) -> bool {
        self.step_name == COMPLETE_SENTINEL
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub topic: String,
    pub flow_type: String,
    pub cursor: Cursor,
    pub step_number: u32,
    pub status: SessionStatus,
    pub context: Map<String, Value>,
    pub step_results: IndexMap<String, Vec<StepResult>>,
    pub step_outputs: IndexMap<String, Value>,
    pub quality_scores: IndexMap<String, f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(
        session_id: String,
        topic: String,
        flow_type: String,
        first_step: &str,
        context: Map<String, Value>,
        now: i64,
    ) -> Self {
        Self {
            session_id,
            topic,
            flow_type,
            cursor: Cursor::at(first_step),
            step_number: 0,
            status: SessionStatus::Active,
            context,
            step_results: IndexMap::new(),
            step_outputs: IndexMap::new(),
            quality_scores: IndexMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn entry(&self, step_name: &str, iteration: Option<u32>) -> Option<&StepResult> {
        self.step_results
            .get(step_name)?
            .iter()
            .find(|r| r.iteration_index == iteration)
    }

    pub fn entry_mut(&mut self, step_name: &str, iteration: Option<u32>) -> Option<&mut StepResult> {
        self.step_results
            .get_mut(step_name)?
            .iter_mut()
            .find(|r| r.iteration_index == iteration)
    }

    /// Fetch the entry for a work unit, creating a pending one if absent.
    /// There is exactly one entry per (step, iteration) pair.
    pub fn ensure_entry(
        &mut self,
        step_name: &str,
        iteration: Option<u32>,
        now: i64,
    ) -> &mut StepResult {
        let entries = self.step_results.entry(step_name.to_string()).or_default();
        if let Some(pos) = entries.iter().position(|r| r.iteration_index == iteration) {
            &mut entries[pos]
        } else {
            entries.push(StepResult::pending(step_name, iteration, now));
            entries.last_mut().expect("entry just pushed")
        }
    }

    /// Count of completed work units; the source of truth for `step_number`.
    pub fn completed_results(&self) -> usize {
        self.step_results
            .values()
            .flatten()
            .filter(|r| r.status == StepStatus::Completed)
            .count()
    }

    /// Aggregated status of a named step over its entries. A `for_each` step
    /// only counts as completed once every iteration completed.
    pub fn step_status(&self, step_name: &str) -> Option<StepStatus> {
        let entries = self.step_results.get(step_name)?;
        if entries.is_empty() {
            return None;
        }
        if entries.iter().any(|r| r.status == StepStatus::Failed) {
            return Some(StepStatus::Failed);
        }
        if entries.iter().all(|r| r.status == StepStatus::Completed) {
            return Some(StepStatus::Completed);
        }
        entries.last().map(|r| r.status)
    }

    pub fn step_completed(&self, step_name: &str) -> bool {
        self.step_status(step_name) == Some(StepStatus::Completed)
    }

    /// Record a quality score, keeping insertion order so the most recently
    /// recorded score is last.
    pub fn record_quality(&mut self, step_name: &str, score: f64) {
        self.quality_scores.shift_remove(step_name);
        self.quality_scores.insert(step_name.to_string(), score);
    }

    pub fn last_quality_score(&self) -> Option<f64> {
        self.quality_scores.last().map(|(_, v)| *v)
    }

    /// History rows for the final summary render.
    pub fn step_history(&self) -> Vec<Value> {
        self.step_results
            .values()
            .flatten()
            .map(|r| {
                serde_json::json!({
                    "step": r.step_name,
                    "iteration_index": r.iteration_index,
                    "status": r.status.as_str(),
                    "quality_score": r.quality_score,
                    "retry_count": r.retry_count,
                })
            })
            .collect()
    }
}

/// Identity of one work unit, used to track which entries a tool call
/// touched so persistence can write just those rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepKey {
    pub step_name: String,
    pub iteration_index: Option<u32>,
}

impl StepKey {
    pub fn new(step_name: &str, iteration_index: Option<u32>) -> Self {
        Self {
            step_name: step_name.to_string(),
            iteration_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedOutput {
    #[default]
    Text,
    Json,
}

impl ExpectedOutput {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpectedOutput::Text => "text",
            ExpectedOutput::Json => "json",
        }
    }
}

/// Parsed `"<step>.<property>"` reference, resolved once at config load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForEachRef {
    pub step: String,
    pub property: String,
}

impl ForEachRef {
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let (step, property) = raw
            .split_once('.')
            .ok_or_else(|| format!("expected \"<step>.<property>\", got \"{raw}\""))?;
        if step.is_empty() || property.is_empty() || property.contains('.') {
            return Err(format!("expected \"<step>.<property>\", got \"{raw}\""));
        }
        Ok(Self {
            step: step.to_string(),
            property: property.to_string(),
        })
    }

    pub fn reference(&self) -> String {
        format!("{}.{}", self.step, self.property)
    }
}

/// One step of a flow, compiled from the raw YAML at load time.
#[derive(Debug, Clone)]
pub struct FlowStep {
    pub name: String,
    pub template_name: String,
    pub required: bool,
    pub quality_threshold: f64,
    pub conditional: Option<CompiledExpr>,
    pub depends_on: Vec<String>,
    pub for_each: Option<ForEachRef>,
    /// Declarative hint that `for_each` iterations are independent. Execution
    /// stays sequential under the tool protocol; the flag is preserved for
    /// callers that batch on top of it.
    pub parallel: bool,
    pub retry_on_failure: bool,
    pub is_final: bool,
    pub instructions: String,
    pub expected_output: ExpectedOutput,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub flow_type: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<FlowStep>,
}

impl FlowDefinition {
    pub fn step(&self, name: &str) -> Option<(usize, &FlowStep)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
    }

    pub fn first_step(&self) -> &FlowStep {
        &self.steps[0]
    }
}

/// Host-supplied evaluation of the previous step, fed back via `next_step`.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityFeedback {
    pub quality_score: f64,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub improvement_areas: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_each_ref_parses_step_and_property() {
        let r = ForEachRef::parse("decompose_problem.sub_questions").expect("valid reference");
        assert_eq!(r.step, "decompose_problem");
        assert_eq!(r.property, "sub_questions");
    }

    #[test]
    fn for_each_ref_rejects_malformed() {
        assert!(ForEachRef::parse("no_dot").is_err());
        assert!(ForEachRef::parse(".prop").is_err());
        assert!(ForEachRef::parse("step.").is_err());
        assert!(ForEachRef::parse("a.b.c").is_err());
    }

    #[test]
    fn ensure_entry_is_one_per_work_unit() {
        let mut session = Session::new(
            "s".into(),
            "topic".into(),
            "flow".into(),
            "first",
            Map::new(),
            0,
        );
        session.ensure_entry("first", None, 1);
        session.ensure_entry("first", None, 2);
        assert_eq!(session.step_results.get("first").unwrap().len(), 1);

        session.ensure_entry("fan", Some(0), 3);
        session.ensure_entry("fan", Some(1), 3);
        assert_eq!(session.step_results.get("fan").unwrap().len(), 2);
    }

    #[test]
    fn step_status_aggregates_iterations() {
        let mut session = Session::new(
            "s".into(),
            "topic".into(),
            "flow".into(),
            "fan",
            Map::new(),
            0,
        );
        session.ensure_entry("fan", Some(0), 0).status = StepStatus::Completed;
        session.ensure_entry("fan", Some(1), 0);
        assert_eq!(session.step_status("fan"), Some(StepStatus::Pending));
        session.entry_mut("fan", Some(1)).unwrap().status = StepStatus::Completed;
        assert_eq!(session.step_status("fan"), Some(StepStatus::Completed));
    }

    #[test]
    fn record_quality_keeps_latest_last() {
        let mut session = Session::new(
            "s".into(),
            "topic".into(),
            "flow".into(),
            "a",
            Map::new(),
            0,
        );
        session.record_quality("a", 0.5);
        session.record_quality("b", 0.9);
        session.record_quality("a", 0.7);
        assert_eq!(session.last_quality_score(), Some(0.7));
        assert_eq!(session.quality_scores.get("b"), Some(&0.9));
    }
}
