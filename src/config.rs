//! Configuration loading: one YAML document describing server options,
//! prompt templates, and thinking flows.
//!
//! Everything is validated here, at load time, so execution never meets a
//! dangling template reference, a dependency cycle, or a malformed
//! conditional. The result is an immutable snapshot; reload builds a new
//! snapshot and swaps it in whole.

use std::{
    fs,
    path::Path,
    sync::{Arc, OnceLock},
};

use handlebars::Handlebars;
use indexmap::IndexMap;
use petgraph::{algo::is_cyclic_directed, graph::DiGraph};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::domain::{ExpectedOutput, FlowDefinition, FlowStep, ForEachRef};
use crate::core::error::{EngineError, Result};
use crate::expr::CompiledExpr;
use crate::paths;
use crate::templates::{Template, TemplateManager};

/// Runtime knobs under the `server:` key.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerOptions {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: u64,
    #[serde(default = "default_template_cache_size")]
    pub template_cache_size: usize,
    #[serde(default = "default_session_cache_size")]
    pub session_cache_size: usize,
    pub default_flow: String,
    #[serde(default = "default_quality_threshold")]
    pub quality_gate_default_threshold: f64,
    #[serde(default)]
    pub database_path: Option<String>,
}

fn default_max_sessions() -> usize {
    100
}
fn default_session_timeout_minutes() -> u64 {
    60
}
fn default_template_cache_size() -> usize {
    50
}
fn default_session_cache_size() -> usize {
    20
}
fn default_quality_threshold() -> f64 {
    0.7
}

impl ServerOptions {
    /// Database location, defaulting to a file under the data dir.
    pub fn resolved_database_path(&self) -> String {
        match &self.database_path {
            Some(path) => path.clone(),
            None => paths::data_dir()
                .join("deepthink.sqlite3")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// Immutable result of a successful load. Tool calls clone the `Arc` at
/// entry and keep it for their whole execution.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub server: ServerOptions,
    pub flows: IndexMap<String, Arc<FlowDefinition>>,
    pub templates: TemplateManager,
}

impl ConfigSnapshot {
    pub fn flow(&self, flow_type: &str) -> Option<&Arc<FlowDefinition>> {
        self.flows.get(flow_type)
    }

    pub fn flow_names(&self) -> Vec<String> {
        self.flows.keys().cloned().collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: ServerOptions,
    #[serde(default)]
    templates: IndexMap<String, RawTemplate>,
    #[serde(default)]
    thinking_flows: IndexMap<String, RawFlow>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(default)]
    description: String,
    #[serde(default)]
    required_params: Vec<String>,
    #[serde(default)]
    optional_params: Vec<String>,
    #[serde(default)]
    expected_output: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFlow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    steps: Vec<RawFlowStep>,
}

#[derive(Debug, Deserialize)]
struct RawFlowStep {
    name: String,
    template_name: String,
    #[serde(default = "default_true")]
    required: bool,
    #[serde(default)]
    quality_threshold: Option<f64>,
    #[serde(default)]
    conditional: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    for_each: Option<String>,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    retry_on_failure: bool,
    #[serde(rename = "final", default)]
    is_final: bool,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

pub fn load(path: &Path) -> Result<ConfigSnapshot> {
    let raw = fs::read_to_string(path).map_err(|e| {
        EngineError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    load_from_str(&raw, path.parent())
}

pub fn load_from_str(yaml: &str, base_dir: Option<&Path>) -> Result<ConfigSnapshot> {
    let raw: RawConfig = serde_yaml::from_str(yaml)
        .map_err(|e| EngineError::ConfigInvalid(format!("YAML parse failed: {e}")))?;

    let server = raw.server;
    if !(0.0..=1.0).contains(&server.quality_gate_default_threshold) {
        return Err(EngineError::ConfigInvalid(format!(
            "quality_gate_default_threshold {} is outside [0, 1]",
            server.quality_gate_default_threshold
        )));
    }

    let templates = build_templates(raw.templates, base_dir)?;
    let mut flows = IndexMap::new();
    for (flow_type, raw_flow) in raw.thinking_flows {
        let flow = build_flow(&flow_type, raw_flow, &templates, &server)?;
        flows.insert(flow_type, Arc::new(flow));
    }

    if !flows.contains_key(&server.default_flow) {
        return Err(EngineError::ConfigInvalid(format!(
            "default_flow '{}' is not a defined flow",
            server.default_flow
        )));
    }

    let template_manager = TemplateManager::new(templates, server.template_cache_size);
    Ok(ConfigSnapshot {
        server,
        flows,
        templates: template_manager,
    })
}

fn build_templates(
    raw: IndexMap<String, RawTemplate>,
    base_dir: Option<&Path>,
) -> Result<IndexMap<String, Template>> {
    let mut syntax_check = Handlebars::new();
    let mut out = IndexMap::new();
    for (name, template) in raw {
        let (body, source) = match (template.body, template.file) {
            (Some(body), None) => (body, "inline".to_string()),
            (None, Some(file)) => {
                let path = match base_dir {
                    Some(dir) => dir.join(&file),
                    None => Path::new(&file).to_path_buf(),
                };
                let body = fs::read_to_string(&path).map_err(|e| {
                    EngineError::ConfigInvalid(format!(
                        "template '{name}': cannot read {}: {e}",
                        path.display()
                    ))
                })?;
                (body, path.to_string_lossy().into_owned())
            }
            (Some(_), Some(_)) => {
                return Err(EngineError::ConfigInvalid(format!(
                    "template '{name}' declares both body and file"
                )));
            }
            (None, None) => {
                return Err(EngineError::ConfigInvalid(format!(
                    "template '{name}' declares neither body nor file"
                )));
            }
        };

        syntax_check
            .register_template_string(&name, &body)
            .map_err(|e| {
                EngineError::ConfigInvalid(format!("template '{name}' does not compile: {e}"))
            })?;

        audit_placeholders(&name, &body, &template.required_params, &template.optional_params)?;

        let expected_output = parse_expected_output(template.expected_output.as_deref())
            .map_err(|e| EngineError::ConfigInvalid(format!("template '{name}': {e}")))?;

        out.insert(
            name.clone(),
            Template {
                name,
                description: template.description,
                required_params: template.required_params,
                optional_params: template.optional_params,
                expected_output,
                body,
                source,
            },
        );
    }
    Ok(out)
}

/// Placeholders and declared params must agree: every `{{ident}}` in the
/// body is declared, and every required param appears in the body.
fn audit_placeholders(
    name: &str,
    body: &str,
    required: &[String],
    optional: &[String],
) -> Result<()> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex")
    });
    let mut placeholders: Vec<&str> = re
        .captures_iter(body)
        .map(|c| c.get(1).expect("capture group").as_str())
        .collect();
    placeholders.sort_unstable();
    placeholders.dedup();

    for p in &placeholders {
        if !required.iter().any(|r| r == p) && !optional.iter().any(|o| o == p) {
            return Err(EngineError::ConfigInvalid(format!(
                "template '{name}' uses undeclared placeholder '{p}'"
            )));
        }
    }
    for r in required {
        if !placeholders.contains(&r.as_str()) {
            return Err(EngineError::ConfigInvalid(format!(
                "template '{name}' declares required param '{r}' that never appears in the body"
            )));
        }
    }
    Ok(())
}

fn parse_expected_output(raw: Option<&str>) -> std::result::Result<ExpectedOutput, String> {
    match raw {
        None | Some("text") => Ok(ExpectedOutput::Text),
        Some("json") => Ok(ExpectedOutput::Json),
        Some(other) => Err(format!(
            "expected_output must be 'text' or 'json', got '{other}'"
        )),
    }
}

fn build_flow(
    flow_type: &str,
    raw: RawFlow,
    templates: &IndexMap<String, Template>,
    server: &ServerOptions,
) -> Result<FlowDefinition> {
    let invalid =
        |msg: String| EngineError::ConfigInvalid(format!("flow '{flow_type}': {msg}"));

    if raw.steps.is_empty() {
        return Err(invalid("flow has no steps".into()));
    }

    let step_names: Vec<String> = raw.steps.iter().map(|s| s.name.clone()).collect();
    for (i, name) in step_names.iter().enumerate() {
        if step_names[..i].contains(name) {
            return Err(invalid(format!("duplicate step name '{name}'")));
        }
    }

    let last_index = raw.steps.len() - 1;
    let mut steps = Vec::with_capacity(raw.steps.len());
    for (index, raw_step) in raw.steps.into_iter().enumerate() {
        let step_name = raw_step.name.clone();
        let fail = |msg: String| invalid(format!("step '{step_name}': {msg}"));

        let template = templates.get(&raw_step.template_name).ok_or_else(|| {
            fail(format!(
                "references unknown template '{}'",
                raw_step.template_name
            ))
        })?;

        let quality_threshold = raw_step
            .quality_threshold
            .unwrap_or(server.quality_gate_default_threshold);
        if !(0.0..=1.0).contains(&quality_threshold) {
            return Err(fail(format!(
                "quality_threshold {quality_threshold} is outside [0, 1]"
            )));
        }

        for dep in &raw_step.depends_on {
            if !step_names.contains(dep) {
                return Err(fail(format!("depends_on references unknown step '{dep}'")));
            }
        }

        let conditional = raw_step
            .conditional
            .as_deref()
            .map(CompiledExpr::parse)
            .transpose()
            .map_err(|e| fail(format!("conditional does not parse: {e}")))?;
        if let Some(cond) = &conditional {
            for referenced in cond.referenced_steps() {
                if !step_names.iter().any(|n| n == referenced) {
                    return Err(fail(format!(
                        "conditional references unknown step '{referenced}'"
                    )));
                }
            }
        }

        let for_each = raw_step
            .for_each
            .as_deref()
            .map(ForEachRef::parse)
            .transpose()
            .map_err(|e| fail(format!("for_each does not parse: {e}")))?;
        if let Some(reference) = &for_each {
            let producer_index = step_names.iter().position(|n| n == &reference.step);
            match producer_index {
                Some(p) if p < index => {}
                Some(_) => {
                    return Err(fail(format!(
                        "for_each producer '{}' must be declared earlier in the flow",
                        reference.step
                    )));
                }
                None => {
                    return Err(fail(format!(
                        "for_each references unknown step '{}'",
                        reference.step
                    )));
                }
            }
        }

        if raw_step.is_final && index != last_index {
            return Err(fail("a final step must be the last step of the flow".into()));
        }

        // Step metadata may override the template's declared output contract.
        let expected_output = match raw_step.metadata.get("expected_output") {
            Some(value) => {
                let text = value.as_str().ok_or_else(|| {
                    fail("metadata.expected_output must be a string".into())
                })?;
                parse_expected_output(Some(text)).map_err(fail)?
            }
            None => template.expected_output,
        };

        steps.push(FlowStep {
            name: raw_step.name,
            template_name: raw_step.template_name,
            required: raw_step.required,
            quality_threshold,
            conditional,
            depends_on: raw_step.depends_on,
            for_each,
            parallel: raw_step.parallel,
            is_final: raw_step.is_final,
            retry_on_failure: raw_step.retry_on_failure,
            instructions: raw_step.instructions,
            expected_output,
            metadata: raw_step.metadata,
        });
    }

    reject_dependency_cycles(flow_type, &steps)?;

    Ok(FlowDefinition {
        flow_type: flow_type.to_string(),
        name: raw.name.unwrap_or_else(|| flow_type.to_string()),
        description: raw.description,
        steps,
    })
}

fn reject_dependency_cycles(flow_type: &str, steps: &[FlowStep]) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: IndexMap<&str, _> = steps
        .iter()
        .map(|s| (s.name.as_str(), graph.add_node(s.name.as_str())))
        .collect();
    for step in steps {
        for dep in &step.depends_on {
            graph.add_edge(indices[dep.as_str()], indices[step.name.as_str()], ());
        }
    }
    if is_cyclic_directed(&graph) {
        return Err(EngineError::ConfigInvalid(format!(
            "flow '{flow_type}': depends_on forms a cycle"
        )));
    }
    Ok(())
}
