//! Prompt template resolution: lookup, required-param validation, named
//! substitution via handlebars, and a bounded render cache.

use handlebars::Handlebars;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cache::LruCache;
use crate::core::domain::ExpectedOutput;
use crate::core::error::{EngineError, Result};

/// An immutable template as loaded from configuration.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub description: String,
    pub required_params: Vec<String>,
    pub optional_params: Vec<String>,
    pub expected_output: ExpectedOutput,
    pub body: String,
    /// Where the body came from (config path or external file).
    pub source: String,
}

/// Renders templates against a fixed index. The index never changes after
/// construction; reload builds a whole new manager.
pub struct TemplateManager {
    index: IndexMap<String, Template>,
    engine: Handlebars<'static>,
    cache: Mutex<LruCache<String>>,
}

impl std::fmt::Debug for TemplateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateManager")
            .field("index", &self.index)
            .finish()
    }
}

impl TemplateManager {
    pub fn new(index: IndexMap<String, Template>, cache_size: usize) -> Self {
        let mut engine = Handlebars::new();
        engine.set_strict_mode(false);
        // Prompts are plain text; HTML entity escaping would corrupt them.
        engine.register_escape_fn(handlebars::no_escape);
        Self {
            index,
            engine,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.index.get(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    /// Resolve `(name, params)` to a rendered prompt string.
    pub fn get(&self, name: &str, params: &Map<String, Value>) -> Result<String> {
        let template = self
            .index
            .get(name)
            .ok_or_else(|| EngineError::TemplateNotFound(name.to_string()))?;

        let missing: Vec<String> = template
            .required_params
            .iter()
            .filter(|p| !params.contains_key(p.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::TemplateValidation {
                name: name.to_string(),
                missing,
            });
        }

        let key = cache_key(name, params);
        if let Some(rendered) = self.cache.lock().get(&key) {
            return Ok(rendered.clone());
        }

        let data = render_data(params);
        let rendered = self
            .engine
            .render_template(&template.body, &Value::Object(data))
            .map_err(|e| EngineError::Internal(format!("template '{name}' render failed: {e}")))?;

        self.cache.lock().insert(key, rendered.clone());
        Ok(rendered)
    }

    /// Generic stand-in prompt used when a referenced template is missing at
    /// render time, so the caller still gets something actionable.
    pub fn fallback(&self, name: &str, params: &Map<String, Value>) -> String {
        let topic = params
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("the current topic");
        format!(
            "The prompt template '{name}' is not available on this server. \
             Continue reasoning about {topic} using your own judgment for this step, \
             and report the missing template to the operator."
        )
    }
}

/// Substitution sees the string form of every parameter: scalars verbatim,
/// composites as compact JSON, null as the empty string.
fn render_data(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(string_form(v))))
        .collect()
}

fn string_form(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => serde_json::to_string(composite).unwrap_or_default(),
    }
}

/// Stable cache key over the template name and the sorted parameter set.
fn cache_key(name: &str, params: &Map<String, Value>) -> String {
    let mut pairs: Vec<(&String, &Value)> = params.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    for (k, v) in pairs {
        hasher.update(k.as_bytes());
        hasher.update([1u8]);
        hasher.update(serde_json::to_string(v).unwrap_or_default().as_bytes());
        hasher.update([2u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
