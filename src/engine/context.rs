//! Run context and parameter resolution.
//!
//! Action parameters may reference fields of the triggering event or
//! outputs of earlier actions in the same run. References use
//! `{{ path }}` placeholders:
//!
//! - `{{ event.document_id }}`: a field of the triggering event payload
//! - `{{ actions.0.voucher.id }}`: a field of a prior action's output,
//!   addressed by that action's position in the run
//! - `{{ document_id }}`: the merged context: the event payload with
//!   every completed action's object output folded in, so later actions
//!   see earlier results without naming an index
//!
//! A string that consists of exactly one placeholder resolves to the
//! referenced JSON value with its type preserved (numbers stay numbers);
//! placeholders embedded in longer strings interpolate as text.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};
use tracing::debug;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("valid regex"))
}

/// Mutable context threaded through one workflow execution.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The triggering event payload, untouched.
    event: Value,
    /// Event payload merged with every prior action's object output.
    merged: Map<String, Value>,
    /// Ordered outputs of completed actions, keyed by position.
    outputs: Vec<Value>,
}

impl RunContext {
    pub fn new(event_payload: &Value) -> Self {
        let merged = match event_payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self {
            event: event_payload.clone(),
            merged,
            outputs: Vec::new(),
        }
    }

    /// Record a completed action's output. Object outputs additionally
    /// fold into the merged context for unqualified references.
    pub fn push_output(&mut self, output: Value) {
        if let Value::Object(map) = &output {
            for (k, v) in map {
                self.merged.insert(k.clone(), v.clone());
            }
        }
        self.outputs.push(output);
    }

    /// Look up an unqualified key in the merged context.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.merged.get(key)
    }

    /// Outputs of all completed actions so far, in order.
    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    /// Resolve every `{{ path }}` placeholder in a parameter value.
    ///
    /// Unresolvable references become `null` (whole-placeholder strings)
    /// or the empty string (interpolations); parameter handling downstream
    /// treats both as "not provided", the same safe default as absent
    /// condition fields.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(&self, s: &str) -> Value {
        let re = placeholder_regex();

        // Exactly one placeholder spanning the whole string: preserve the
        // referenced value's JSON type.
        if let Some(caps) = re.captures(s) {
            let whole = caps.get(0).expect("capture 0");
            if whole.start() == 0 && whole.end() == s.len() {
                let path = &caps[1];
                return match self.lookup(path) {
                    Some(v) => v.clone(),
                    None => {
                        debug!(path, "unresolved parameter reference");
                        Value::Null
                    }
                };
            }
        }

        // Interpolate into the surrounding text.
        let rendered = re.replace_all(s, |caps: &regex_lite::Captures| {
            match self.lookup(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        });
        Value::String(rendered.into_owned())
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        let root: &Value = match head {
            "event" => &self.event,
            "actions" => {
                let idx: usize = rest.first()?.parse().ok()?;
                let output = self.outputs.get(idx)?;
                return descend(output, &rest[1..]);
            }
            _ => return descend_map(&self.merged, head, &rest),
        };
        descend(root, &rest)
    }
}

fn descend_map<'a>(map: &'a Map<String, Value>, head: &str, rest: &[&str]) -> Option<&'a Value> {
    descend(map.get(head)?, rest)
}

fn descend<'a>(mut current: &'a Value, parts: &[&str]) -> Option<&'a Value> {
    for part in parts {
        match current {
            Value::Object(map) => current = map.get(*part)?,
            Value::Array(items) => current = items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current)
}
