//! Text templating with a fixed function catalog.
//!
//! Templates use `{{ ... }}` delimiters (minijinja syntax) and may only call
//! the catalog registered in [`functions`]: security escapes, event-payload
//! access, string utilities, conversions, collections, and logic helpers.
//! Parsed templates are cached in an LRU keyed by template text under a
//! byte budget (the approximate size of an entry is its source length).
//!
//! Undefined references are errors: a template that names a missing input
//! or payload field fails to render rather than silently producing "".

pub mod functions;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use lru::LruCache;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from template parsing or rendering.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(String),

    #[error("template render error: {0}")]
    Render(String),
}

// ---------------------------------------------------------------------------
// TemplateScope
// ---------------------------------------------------------------------------

/// The data surface templates render against:
/// `inputs`, `steps.<id>.<output>`, and optionally `event` / `trigger`.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    pub inputs: Map<String, Value>,
    pub steps: Map<String, Value>,
    pub event: Option<Value>,
    pub trigger: Option<Value>,
}

impl TemplateScope {
    /// Scope seeded with resolved workflow inputs.
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    /// Record a completed step's outputs under `steps.<id>`.
    pub fn add_step_outputs(
        &mut self,
        step_id: &str,
        outputs: &std::collections::BTreeMap<String, String>,
    ) {
        let map: Map<String, Value> = outputs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.steps.insert(step_id.to_string(), Value::Object(map));
    }

    /// Build the JSON context object rendered against.
    pub fn to_value(&self) -> Value {
        let mut ctx = json!({
            "inputs": self.inputs,
            "steps": self.steps,
        });
        if let Some(event) = &self.event {
            ctx["event"] = event.clone();
        }
        if let Some(trigger) = &self.trigger {
            ctx["trigger"] = trigger.clone();
        }
        ctx
    }
}

// ---------------------------------------------------------------------------
// TemplateEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    env: Environment<'static>,
    /// Cache of compiled templates: internal name -> source length.
    cache: LruCache<String, usize>,
    used_bytes: usize,
}

/// Template engine with the fixed catalog and a byte-budget LRU cache.
pub struct TemplateEngine {
    inner: Mutex<EngineInner>,
    budget_bytes: usize,
}

impl TemplateEngine {
    /// Create an engine whose compiled-template cache holds at most
    /// `budget_bytes` of template source.
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        functions::register_catalog(&mut env);
        Self {
            inner: Mutex::new(EngineInner {
                env,
                cache: LruCache::unbounded(),
                used_bytes: 0,
            }),
            budget_bytes,
        }
    }

    /// Expand `text` against `ctx`, compiling and caching on first use.
    pub fn expand(&self, text: &str, ctx: &Value) -> Result<String, TemplateError> {
        let name = template_name(text);
        let mut inner = self.inner.lock().expect("template cache lock poisoned");

        if inner.cache.get(&name).is_none() {
            inner
                .env
                .add_template_owned(name.clone(), text.to_string())
                .map_err(|e| TemplateError::Parse(e.to_string()))?;
            inner.cache.put(name.clone(), text.len());
            inner.used_bytes += text.len();

            // Evict least-recently-used entries past the byte budget. The
            // entry just inserted is most-recently-used and never evicted
            // while anything older remains.
            while inner.used_bytes > self.budget_bytes && inner.cache.len() > 1 {
                if let Some((evicted, size)) = inner.cache.pop_lru() {
                    inner.env.remove_template(&evicted);
                    inner.used_bytes -= size;
                }
            }
        }

        let template = inner
            .env
            .get_template(&name)
            .map_err(|e| TemplateError::Parse(e.to_string()))?;
        template
            .render(ctx)
            .map_err(|e| TemplateError::Render(e.to_string()))
    }

    /// Expand against a [`TemplateScope`].
    pub fn expand_in_scope(
        &self,
        text: &str,
        scope: &TemplateScope,
    ) -> Result<String, TemplateError> {
        self.expand(text, &scope.to_value())
    }

    /// Parse-check a template without executing it.
    pub fn validate_template(&self, text: &str) -> Result<(), TemplateError> {
        let inner = self.inner.lock().expect("template cache lock poisoned");
        inner
            .env
            .template_from_str(text)
            .map(|_| ())
            .map_err(|e| TemplateError::Parse(e.to_string()))
    }

    /// Number of templates currently cached.
    pub fn cached_template_count(&self) -> usize {
        self.inner
            .lock()
            .expect("template cache lock poisoned")
            .cache
            .len()
    }

    /// Bytes of template source currently cached.
    pub fn cached_bytes(&self) -> usize {
        self.inner
            .lock()
            .expect("template cache lock poisoned")
            .used_bytes
    }
}

/// Internal template name derived from the source text.
fn template_name(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("t{:016x}", hasher.finish())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
