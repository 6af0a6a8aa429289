//! Subscription evaluation: event-type match, schema-version range check,
//! filter expressions, and input templating.
//!
//! Filters are JEXL expressions evaluated against
//! `{payload, event_type, event_source}`. Payloads are always passed as
//! context objects, never interpolated into expression text. Compiled
//! filter programs are cached in an LRU keyed by expression text, so
//! repeated evaluation of the same filter builds its program once.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::{json, Value};
use tako_types::error::{FilterError, SchemaError};
use tako_types::event::Event;
use tako_types::subscription::Subscription;
use thiserror::Error;

use crate::template::{TemplateEngine, TemplateError};

use super::semver_range;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from subscription evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("input template error: {0}")]
    Template(#[from] TemplateError),
}

// ---------------------------------------------------------------------------
// Filter programs
// ---------------------------------------------------------------------------

/// A cached filter program. The expression parses at evaluation time (the
/// expression engine has no separate compile step); caching one program
/// handle per expression keeps the cache size constant across repeated
/// evaluations of the same filter.
#[derive(Debug)]
pub struct FilterProgram {
    expression: String,
}

impl FilterProgram {
    fn new(expression: &str) -> Self {
        Self {
            expression: expression.to_string(),
        }
    }

    /// Evaluate against a context object, coercing the result to a boolean.
    pub fn evaluate(&self, context: &Value) -> Result<bool, FilterError> {
        let result = jexl_evaluator()
            .eval_in_context(&self.expression, context)
            .map_err(|e| FilterError::Eval {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })?;
        Ok(value_to_bool(&result))
    }
}

/// Build the expression evaluator with the standard transforms registered.
fn jexl_evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_uppercase()))
        })
        .with_transform("contains", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.contains(search)))
        })
        .with_transform("length", |args: &[Value]| {
            let val = args.first().cloned().unwrap_or(Value::Null);
            let len = match &val {
                Value::String(s) => s.len(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

/// JavaScript-like truthiness for filter results.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// SubscriptionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates subscriptions against events and computes child inputs.
pub struct SubscriptionEvaluator {
    programs: Mutex<LruCache<String, Arc<FilterProgram>>>,
    templates: Arc<TemplateEngine>,
}

impl SubscriptionEvaluator {
    /// `cache_limit` bounds the compiled-filter LRU.
    pub fn new(cache_limit: usize, templates: Arc<TemplateEngine>) -> Self {
        let capacity = NonZeroUsize::new(cache_limit.max(1)).expect("max(1) is non-zero");
        Self {
            programs: Mutex::new(LruCache::new(capacity)),
            templates,
        }
    }

    /// Whether `subscription` matches `event`.
    ///
    /// 1. The event type must appear in `subscription.events`.
    /// 2. A declared schema range must admit the event's version; an event
    ///    without a version is treated as compatible.
    /// 3. Every filter must evaluate to true.
    pub fn evaluate_subscription(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<bool, EvaluationError> {
        if !subscription.events.iter().any(|e| e == &event.event_type) {
            return Ok(false);
        }

        if let Some(range) = &subscription.schema_version {
            match &event.schema_version {
                Some(version) => {
                    if !semver_range::version_matches(range, version)? {
                        return Ok(false);
                    }
                }
                // Backward compatibility: unversioned events pass.
                None => {}
            }
        }

        if !subscription.filters.is_empty() {
            let context = filter_context(event);
            for filter in &subscription.filters {
                if !self.program(filter).evaluate(&context)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Expand the subscription's input templates with `{payload, event}`.
    /// Missing payload fields surface as template errors.
    pub fn compute_inputs(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<BTreeMap<String, Value>, EvaluationError> {
        let context = json!({
            "payload": event.payload,
            "event": {
                "type": event.event_type,
                "schema_version": event.schema_version,
                "source": event.source,
                "timestamp": event.timestamp,
                "payload": event.payload,
            },
        });

        let mut inputs = BTreeMap::new();
        for (name, template) in &subscription.inputs {
            let expanded = self.templates.expand(template, &context)?;
            inputs.insert(name.clone(), Value::String(expanded));
        }
        Ok(inputs)
    }

    /// Programs currently cached.
    pub fn cached_filter_count(&self) -> usize {
        self.programs.lock().expect("filter cache poisoned").len()
    }

    fn program(&self, expression: &str) -> Arc<FilterProgram> {
        let mut cache = self.programs.lock().expect("filter cache poisoned");
        if let Some(program) = cache.get(expression) {
            return Arc::clone(program);
        }
        let program = Arc::new(FilterProgram::new(expression));
        cache.put(expression.to_string(), Arc::clone(&program));
        program
    }
}

/// The data surface filters evaluate against.
fn filter_context(event: &Event) -> Value {
    json!({
        "payload": event.payload,
        "event_type": event.event_type,
        "event_source": event.source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
