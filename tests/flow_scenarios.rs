//! End-to-end scenarios driven through the tool surface, with a hand-driven
//! clock and an in-memory store.

use std::sync::Arc;

use serde_json::json;

use deepthink::config;
use deepthink::core::domain::{SessionStatus, StepStatus};
use deepthink::core::ports::ManualClock;
use deepthink::persistence::SessionStore;
use deepthink::service::{
    AnalyzeStepInput, CompleteThinkingInput, NextStepInput, StartThinkingInput, ThinkingService,
    ToolResult,
};

const CONFIG: &str = r#"
server:
  default_flow: comprehensive_analysis
  session_timeout_minutes: 60
templates:
  decompose:
    required_params: [topic, complexity]
    expected_output: json
    body: "Decompose {{topic}} at {{complexity}} depth into sub-questions as JSON."
  collect:
    required_params: [topic, item]
    body: "Collect evidence on {{item}} for {{topic}}."
  evaluate:
    required_params: [topic]
    body: "Evaluate all evidence for {{topic}}."
  plain:
    required_params: [topic]
    body: "Work on {{topic}}."
  completion:
    required_params: [topic]
    body: "All steps for {{topic}} are done."
  final_summary:
    required_params: [topic, step_history]
    optional_params: [final_insights]
    body: "Summarize {{topic}} given {{step_history}} and {{final_insights}}."
  analyze_quality:
    required_params: [step_name, step_result]
    body: "Score the output of {{step_name}}: {{step_result}}"
thinking_flows:
  comprehensive_analysis:
    name: Comprehensive analysis
    steps:
      - name: decompose
        template_name: decompose
        instructions: Decompose the topic.
      - name: collect_evidence
        template_name: collect
        depends_on: [decompose]
        for_each: "decompose.sub_questions"
        instructions: Collect evidence for the sub-question.
      - name: evaluate
        template_name: evaluate
        final: true
        instructions: Evaluate the evidence.
  gated:
    steps:
      - name: step_a
        template_name: plain
        quality_threshold: 0.8
        retry_on_failure: true
      - name: step_b
        template_name: plain
        final: true
  conditional:
    steps:
      - name: step_a
        template_name: plain
      - name: step_b
        template_name: plain
        conditional: "complexity == 'complex'"
      - name: step_c
        template_name: plain
        final: true
"#;

struct Harness {
    service: ThinkingService,
    store: SessionStore,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let snapshot = config::load_from_str(CONFIG, None).expect("valid test config");
    let store = SessionStore::open(":memory:").expect("in-memory store");
    let clock = Arc::new(ManualClock::new(0));
    let service = ThinkingService::from_parts(snapshot, store.clone(), clock.clone());
    Harness {
        service,
        store,
        clock,
    }
}

fn start(h: &Harness, topic: &str, complexity: &str, flow_type: &str) -> ToolResult {
    h.service
        .start_thinking(StartThinkingInput {
            topic: topic.into(),
            complexity: Some(complexity.into()),
            focus: None,
            flow_type: Some(flow_type.into()),
        })
        .expect("start_thinking succeeds")
}

fn next(h: &Harness, session_id: &str, step_result: &str) -> ToolResult {
    next_scored(h, session_id, step_result, None).expect("next_step succeeds")
}

fn next_scored(
    h: &Harness,
    session_id: &str,
    step_result: &str,
    score: Option<f64>,
) -> deepthink::core::error::Result<ToolResult> {
    h.service.next_step(NextStepInput {
        session_id: session_id.into(),
        step_result: step_result.into(),
        quality_feedback: score.map(|quality_score| {
            serde_json::from_value(json!({ "quality_score": quality_score })).unwrap()
        }),
    })
}

#[test]
fn decomposition_fan_out_runs_once_per_sub_question() {
    let h = harness();
    let started = start(
        &h,
        "How to improve team productivity?",
        "moderate",
        "comprehensive_analysis",
    );
    assert_eq!(started.step, "decompose");
    assert!(started.prompt_template.contains("team productivity"));

    let sub_questions = json!({"sub_questions": [{"id": "1"}, {"id": "2"}, {"id": "3"}]});
    let result = next(&h, &started.session_id, &sub_questions.to_string());
    assert_eq!(result.step, "collect_evidence");
    assert_eq!(result.context["item"], json!({"id": "1"}));

    let result = next(&h, &started.session_id, "evidence for question 1");
    assert_eq!(result.step, "collect_evidence");
    assert_eq!(result.context["item"], json!({"id": "2"}));

    let result = next(&h, &started.session_id, "evidence for question 2");
    assert_eq!(result.step, "collect_evidence");
    assert_eq!(result.context["item"], json!({"id": "3"}));

    let result = next(&h, &started.session_id, "evidence for question 3");
    assert_eq!(result.step, "evaluate");

    let result = next(&h, &started.session_id, "conclusion with confidence");
    assert_eq!(result.step, "__complete__");

    let done = h
        .service
        .complete_thinking(CompleteThinkingInput {
            session_id: started.session_id.clone(),
            final_insights: Some("focus on meeting load".into()),
        })
        .unwrap();
    assert_eq!(done.step, "__complete__");
    assert_eq!(done.metadata["steps_completed"], json!(5));

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.step_number, 5);
    assert_eq!(session.completed_results(), 5);
    assert_eq!(
        session.step_results.get("collect_evidence").unwrap().len(),
        3
    );
}

#[test]
fn quality_gate_retries_twice_then_advances() {
    let h = harness();
    let started = start(&h, "retry topic", "moderate", "gated");
    assert_eq!(started.step, "step_a");

    let result = next_scored(&h, &started.session_id, "weak answer", Some(0.5)).unwrap();
    assert_eq!(result.step, "step_a");
    assert_eq!(result.metadata["retry_count"], json!(1));

    let result = next_scored(&h, &started.session_id, "still weak", Some(0.5)).unwrap();
    assert_eq!(result.step, "step_a");
    assert_eq!(result.metadata["retry_count"], json!(2));

    // Retry budget exhausted: a third low score advances regardless.
    let result = next_scored(&h, &started.session_id, "third try", Some(0.5)).unwrap();
    assert_eq!(result.step, "step_b");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    let entry = session.entry("step_a", None).unwrap();
    assert_eq!(entry.status, StepStatus::Completed);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(session.step_number, 1);
}

#[test]
fn score_exactly_at_threshold_passes() {
    let h = harness();
    let started = start(&h, "boundary topic", "moderate", "gated");
    let result = next_scored(&h, &started.session_id, "fine answer", Some(0.8)).unwrap();
    assert_eq!(result.step, "step_b");
}

#[test]
fn conditional_step_is_skipped_for_simple_topics() {
    let h = harness();
    let started = start(&h, "simple topic", "simple", "conditional");
    let result = next(&h, &started.session_id, "done a");
    assert_eq!(result.step, "step_c");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(session.step_status("step_b"), Some(StepStatus::Skipped));
}

#[test]
fn conditional_step_runs_for_complex_topics() {
    let h = harness();
    let started = start(&h, "complex topic", "complex", "conditional");
    let result = next(&h, &started.session_id, "done a");
    assert_eq!(result.step, "step_b");
}

#[test]
fn for_each_over_empty_array_skips_the_consumer() {
    let h = harness();
    let started = start(&h, "empty fan-out", "moderate", "comprehensive_analysis");
    let result = next(&h, &started.session_id, r#"{"sub_questions": []}"#);
    assert_eq!(result.step, "evaluate");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(
        session.step_status("collect_evidence"),
        Some(StepStatus::Skipped)
    );
}

#[test]
fn malformed_producer_output_fails_for_each_and_holds_cursor() {
    let h = harness();
    let started = start(&h, "malformed output", "moderate", "comprehensive_analysis");
    let err = next_scored(&h, &started.session_id, "no json at all", None).unwrap_err();
    assert_eq!(err.error_code(), "ForEachResolutionError");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.cursor.step_name, "decompose");
    assert_eq!(
        session.step_status("collect_evidence"),
        Some(StepStatus::Failed)
    );

    // analyze_step keeps working on the stuck session.
    let analysis = h
        .service
        .analyze_step(AnalyzeStepInput {
            session_id: started.session_id.clone(),
            step_name: "decompose".into(),
            step_result: "no json at all".into(),
            analysis_type: "quality".into(),
        })
        .unwrap();
    assert!(analysis.prompt_template.contains("decompose"));

    // A corrected reply recovers the session.
    let fixed = json!({"sub_questions": [{"id": "1"}]});
    let result = next(&h, &started.session_id, &fixed.to_string());
    assert_eq!(result.step, "collect_evidence");
}

#[test]
fn expired_session_rejects_next_step_but_new_sessions_work() {
    let h = harness();
    let started = start(&h, "expiring topic", "moderate", "gated");

    h.clock.set(61 * 60_000);
    let err = next_scored(&h, &started.session_id, "too late", None).unwrap_err();
    assert_eq!(err.error_code(), "SessionExpired");

    let fresh = start(&h, "fresh topic", "moderate", "gated");
    assert_eq!(fresh.step, "step_a");
}

#[test]
fn start_then_complete_leaves_one_pending_step() {
    let h = harness();
    let started = start(&h, "abandoned early", "moderate", "gated");
    let done = h
        .service
        .complete_thinking(CompleteThinkingInput {
            session_id: started.session_id.clone(),
            final_insights: None,
        })
        .unwrap();
    assert_eq!(done.step, "__complete__");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let entries: Vec<_> = session.step_results.values().flatten().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, StepStatus::Pending);
}

#[test]
fn terminal_session_rejects_every_tool() {
    let h = harness();
    let started = start(&h, "done topic", "moderate", "gated");
    h.service
        .complete_thinking(CompleteThinkingInput {
            session_id: started.session_id.clone(),
            final_insights: None,
        })
        .unwrap();

    let err = next_scored(&h, &started.session_id, "anything", None).unwrap_err();
    assert_eq!(err.error_code(), "SessionTerminal");

    let err = h
        .service
        .complete_thinking(CompleteThinkingInput {
            session_id: started.session_id.clone(),
            final_insights: None,
        })
        .unwrap_err();
    assert_eq!(err.error_code(), "SessionTerminal");
}

#[test]
fn analyze_step_is_idempotent() {
    let h = harness();
    let started = start(&h, "analysis topic", "moderate", "gated");
    let input = || AnalyzeStepInput {
        session_id: started.session_id.clone(),
        step_name: "step_a".into(),
        step_result: "some draft output".into(),
        analysis_type: "quality".into(),
    };
    let first = h.service.analyze_step(input()).unwrap();
    let second = h.service.analyze_step(input()).unwrap();
    assert_eq!(first.prompt_template, second.prompt_template);
    assert_eq!(first.step, second.step);

    // The flow cursor did not move.
    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(session.cursor.step_name, "step_a");
    assert_eq!(session.step_number, 0);
}

#[test]
fn step_number_matches_completed_results_after_every_call() {
    let h = harness();
    let started = start(
        &h,
        "invariant check",
        "moderate",
        "comprehensive_analysis",
    );
    let replies = [
        json!({"sub_questions": [{"id": "1"}, {"id": "2"}]}).to_string(),
        "evidence 1".to_string(),
        "evidence 2".to_string(),
        "final evaluation".to_string(),
    ];
    for reply in &replies {
        next(&h, &started.session_id, reply);
        let session = h.store.load(&started.session_id).unwrap().unwrap();
        assert_eq!(
            session.step_number as usize,
            session.completed_results(),
            "invariant broken after reply {reply}"
        );
    }
}

#[test]
fn fan_out_iteration_count_matches_producer_array() {
    let h = harness();
    let started = start(&h, "count check", "moderate", "comprehensive_analysis");
    let produced = json!({"sub_questions": [{"id": "1"}, {"id": "2"}]});
    next(&h, &started.session_id, &produced.to_string());
    next(&h, &started.session_id, "evidence 1");
    let result = next(&h, &started.session_id, "evidence 2");
    assert_eq!(result.step, "evaluate");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    let iterations = session.step_results.get("collect_evidence").unwrap();
    let completed = iterations
        .iter()
        .filter(|r| r.status == StepStatus::Completed)
        .count();
    let produced_len = session.step_outputs["decompose"]["sub_questions"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(completed, produced_len);
}

#[test]
fn next_step_after_completion_is_idempotent() {
    let h = harness();
    let started = start(&h, "idempotent end", "moderate", "gated");
    next(&h, &started.session_id, "a done");
    let first = next(&h, &started.session_id, "b done");
    assert_eq!(first.step, "__complete__");

    let again = next(&h, &started.session_id, "ignored");
    assert_eq!(again.step, "__complete__");

    let session = h.store.load(&started.session_id).unwrap().unwrap();
    assert_eq!(session.step_number, 2);
}

#[test]
fn unknown_flow_type_reports_flow_not_found() {
    let h = harness();
    let err = h
        .service
        .start_thinking(StartThinkingInput {
            topic: "topic".into(),
            complexity: None,
            focus: None,
            flow_type: Some("does_not_exist".into()),
        })
        .unwrap_err();
    assert_eq!(err.error_code(), "FlowNotFound");
}
