//! The flow engine: pure state transitions over a session against an
//! immutable flow definition.
//!
//! Execution is externally driven. The host LLM supplies each step's output
//! through `next_step`; the engine records it, applies the quality gate, and
//! walks the flow forward to pick the next work unit. Nothing here performs
//! I/O; the session manager persists whatever these transitions touch.

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::domain::{
    Cursor, ExpectedOutput, FlowDefinition, ForEachRef, QualityFeedback, RETRY_MAX, Session,
    StepKey, StepStatus,
};
use crate::core::error::{EngineError, Result};
use crate::expr::{Bindings, ExprValue};
use crate::output::extract_structured;

/// What happened to the current work unit when a result came in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Result stored; the cursor may now advance.
    Recorded,
    /// Score fell below the gate and the step retries; cursor unchanged.
    GatedRetry { retry_count: u32 },
    /// The cursor already sits on the completion sentinel; nothing recorded.
    AlreadyComplete,
}

/// The engine's choice of the next work unit. Applying it to the session is
/// a separate step so callers can resolve the target's template first.
#[derive(Debug, Clone)]
pub enum Selection {
    Enter {
        step_index: usize,
    },
    Iterate {
        step_index: usize,
        iteration: u32,
        total: u32,
        item: Value,
    },
    Complete,
}

#[derive(Debug, Default)]
pub struct FlowEngine;

impl FlowEngine {
    pub fn new() -> Self {
        Self
    }

    /// Point a fresh session at the first step of its flow.
    pub fn begin(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) {
        let first = flow.first_step();
        session.cursor = Cursor::at(&first.name);
        session.ensure_entry(&first.name, None, now);
        touched.push(StepKey::new(&first.name, None));
    }

    /// Record the host's reply for the current work unit and apply the
    /// quality gate.
    pub fn record_result(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        raw_text: &str,
        feedback: Option<&QualityFeedback>,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) -> Result<RecordOutcome> {
        if session.cursor.is_complete() {
            return Ok(RecordOutcome::AlreadyComplete);
        }
        let (_, step) = flow
            .step(&session.cursor.step_name)
            .ok_or_else(|| EngineError::StepNotFound {
                flow_type: flow.flow_type.clone(),
                step: session.cursor.step_name.clone(),
            })?;
        let iteration = session.cursor.iteration_index;
        let parsed = match step.expected_output {
            ExpectedOutput::Json => extract_structured(raw_text),
            ExpectedOutput::Text => None,
        };

        let entry = session.ensure_entry(&step.name, iteration, now);
        entry.raw_text = Some(raw_text.to_string());
        entry.finished_at = Some(now);
        entry.structured_output = parsed.clone();
        if let Some(fb) = feedback {
            entry.quality_score = Some(fb.quality_score);
        }
        touched.push(StepKey::new(&step.name, iteration));

        if let Some(fb) = feedback {
            session.record_quality(&step.name, fb.quality_score);
        }
        if let Some(value) = parsed {
            store_output(session, &step.name, iteration, value);
        }

        if let Some(fb) = feedback
            && fb.quality_score < step.quality_threshold
            && step.retry_on_failure
            && session.cursor.retry_count < RETRY_MAX
        {
            session.cursor.retry_count += 1;
            let retry_count = session.cursor.retry_count;
            if let Some(entry) = session.entry_mut(&step.name, iteration) {
                entry.status = StepStatus::Running;
                entry.retry_count = retry_count;
            }
            debug!(
                step = %step.name,
                score = fb.quality_score,
                threshold = step.quality_threshold,
                retry_count,
                "quality gate triggered retry"
            );
            return Ok(RecordOutcome::GatedRetry { retry_count });
        }

        let retry_count = session.cursor.retry_count;
        if let Some(entry) = session.entry_mut(&step.name, iteration)
            && entry.status != StepStatus::Completed
        {
            entry.status = StepStatus::Completed;
            entry.retry_count = retry_count;
            session.step_number += 1;
        }
        Ok(RecordOutcome::Recorded)
    }

    /// Choose the next work unit without moving the cursor. Conditional and
    /// dependency skips are recorded on the session as a side effect; a
    /// `for_each` resolution failure records the consumer as failed and
    /// surfaces the error with the cursor held.
    pub fn select_next(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) -> Result<Selection> {
        let (index, step) = flow
            .step(&session.cursor.step_name)
            .ok_or_else(|| EngineError::StepNotFound {
                flow_type: flow.flow_type.clone(),
                step: session.cursor.step_name.clone(),
            })?;

        if let (Some(for_each), Some(k)) = (&step.for_each, session.cursor.iteration_index) {
            let items = self.resolve_items(session, for_each)?;
            let next = k as usize + 1;
            if next < items.len() {
                return Ok(Selection::Iterate {
                    step_index: index,
                    iteration: next as u32,
                    total: items.len() as u32,
                    item: items[next].clone(),
                });
            }
        }
        if step.is_final {
            return Ok(Selection::Complete);
        }
        self.walk(session, flow, index + 1, now, touched)
    }

    fn walk(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        mut index: usize,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) -> Result<Selection> {
        while index < flow.steps.len() {
            let step = &flow.steps[index];

            if let Some(dep) = step
                .depends_on
                .iter()
                .find(|d| !session.step_completed(d))
            {
                warn!(step = %step.name, dependency = %dep, "dependency not completed, skipping step");
                mark_skipped(session, &step.name, now, touched);
                index += 1;
                continue;
            }

            if let Some(cond) = &step.conditional {
                let verdict = cond.eval(&SessionBindings { session });
                match verdict {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(step = %step.name, conditional = cond.source(), "conditional false, skipping step");
                        mark_skipped(session, &step.name, now, touched);
                        index += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(step = %step.name, conditional = cond.source(), error = %err, "conditional evaluation failed, skipping step");
                        mark_skipped(session, &step.name, now, touched);
                        index += 1;
                        continue;
                    }
                }
            }

            if let Some(for_each) = &step.for_each {
                match self.resolve_items(session, for_each) {
                    Ok(items) if items.is_empty() => {
                        debug!(step = %step.name, reference = %for_each.reference(), "empty fan-out, skipping step");
                        mark_skipped(session, &step.name, now, touched);
                        index += 1;
                        continue;
                    }
                    Ok(items) => {
                        return Ok(Selection::Iterate {
                            step_index: index,
                            iteration: 0,
                            total: items.len() as u32,
                            item: items[0].clone(),
                        });
                    }
                    Err(err) => {
                        let entry = session.ensure_entry(&step.name, None, now);
                        entry.status = StepStatus::Failed;
                        entry.finished_at = Some(now);
                        touched.push(StepKey::new(&step.name, None));
                        return Err(err);
                    }
                }
            }

            return Ok(Selection::Enter { step_index: index });
        }
        Ok(Selection::Complete)
    }

    /// Move the cursor onto the selected work unit and stamp its pending
    /// entry.
    pub fn commit_selection(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        selection: &Selection,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) {
        match selection {
            Selection::Complete => {
                session.cursor = Cursor::complete();
            }
            Selection::Enter { step_index } => {
                let name = flow.steps[*step_index].name.clone();
                session.cursor = Cursor::at(&name);
                reset_pending(session, &name, None, now, touched);
            }
            Selection::Iterate {
                step_index,
                iteration,
                ..
            } => {
                let name = flow.steps[*step_index].name.clone();
                session.cursor = Cursor {
                    step_name: name.clone(),
                    iteration_index: Some(*iteration),
                    retry_count: 0,
                };
                reset_pending(session, &name, Some(*iteration), now, touched);
            }
        }
    }

    /// Record a failure for a work unit while holding the cursor in place.
    pub fn mark_step_failed(
        &self,
        session: &mut Session,
        step_name: &str,
        iteration: Option<u32>,
        now: i64,
        touched: &mut Vec<StepKey>,
    ) {
        let entry = session.ensure_entry(step_name, iteration, now);
        entry.status = StepStatus::Failed;
        entry.finished_at = Some(now);
        touched.push(StepKey::new(step_name, iteration));
    }

    /// Resolve a `for_each` reference against the producer's stored output.
    pub fn resolve_items(&self, session: &Session, for_each: &ForEachRef) -> Result<Vec<Value>> {
        let fail = |reason: &str| EngineError::ForEachResolution {
            reference: for_each.reference(),
            reason: reason.to_string(),
        };
        let output = session
            .step_outputs
            .get(&for_each.step)
            .ok_or_else(|| fail("producer step has no structured output"))?;
        let property = output
            .get(&for_each.property)
            .ok_or_else(|| fail("property not present in producer output"))?;
        let items = property
            .as_array()
            .ok_or_else(|| fail("property is not an array"))?;
        Ok(items.clone())
    }
}

/// Expression bindings backed by live session state.
pub struct SessionBindings<'a> {
    pub session: &'a Session,
}

impl Bindings for SessionBindings<'_> {
    fn identifier(&self, name: &str) -> Option<ExprValue> {
        match name {
            "complexity" => self
                .session
                .context
                .get("complexity")
                .and_then(Value::as_str)
                .map(|s| ExprValue::Str(s.to_string())),
            "quality_score" => self.session.last_quality_score().map(ExprValue::Num),
            "step_count" => Some(ExprValue::Num(f64::from(self.session.step_number))),
            _ => None,
        }
    }

    fn property(&self, step: &str, property: &str) -> Option<ExprValue> {
        match property {
            "quality_score" => self
                .session
                .quality_scores
                .get(step)
                .copied()
                .map(ExprValue::Num),
            "status" => self
                .session
                .step_status(step)
                .map(|s| ExprValue::Str(s.as_str().to_string())),
            _ => None,
        }
    }
}

fn mark_skipped(session: &mut Session, step_name: &str, now: i64, touched: &mut Vec<StepKey>) {
    let entry = session.ensure_entry(step_name, None, now);
    if entry.status == StepStatus::Completed {
        return;
    }
    entry.status = StepStatus::Skipped;
    entry.finished_at = Some(now);
    touched.push(StepKey::new(step_name, None));
}

fn reset_pending(
    session: &mut Session,
    step_name: &str,
    iteration: Option<u32>,
    now: i64,
    touched: &mut Vec<StepKey>,
) {
    let entry = session.ensure_entry(step_name, iteration, now);
    if entry.status != StepStatus::Completed {
        entry.status = StepStatus::Pending;
        entry.raw_text = None;
        entry.structured_output = None;
        entry.finished_at = None;
        entry.retry_count = 0;
        entry.started_at = now;
    }
    touched.push(StepKey::new(step_name, iteration));
}

fn store_output(session: &mut Session, step_name: &str, iteration: Option<u32>, value: Value) {
    match iteration {
        None => {
            session.step_outputs.insert(step_name.to_string(), value);
        }
        Some(k) => {
            let slot = session
                .step_outputs
                .entry(step_name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let items = slot.as_array_mut().expect("array ensured above");
            while items.len() <= k as usize {
                items.push(Value::Null);
            }
            items[k as usize] = value;
        }
    }
}
