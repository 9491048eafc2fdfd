use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

use crate::state::ExecutionState;
use crate::types::Variables;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.\-]*)\s*\}\}").expect("static token regex")
    })
}

/// Values a template can see: run variables plus system-derived values.
///
/// System values are addressed with dotted names: `contact.id`, `channel.id`,
/// `flow.id`, `flow.version`, `message.body`, `now`. Run variables shadow them.
#[derive(Debug, Clone)]
pub struct RenderScope<'a> {
    variables: &'a Variables,
    system: HashMap<&'static str, String>,
}

impl<'a> RenderScope<'a> {
    pub fn new(variables: &'a Variables) -> Self {
        Self {
            variables,
            system: HashMap::new(),
        }
    }

    /// Scope for a run, with `message.body` set to the latest inbound text.
    pub fn for_state(state: &'a ExecutionState, message_body: Option<&str>, now: DateTime<Utc>) -> Self {
        let mut scope = Self::new(&state.variables);
        scope.system.insert("contact.id", state.contact_id.0.clone());
        scope.system.insert("channel.id", state.channel_id.clone());
        scope.system.insert("flow.id", state.flow_id.0.clone());
        scope.system.insert("flow.version", state.flow_version.to_string());
        scope.system.insert("now", now.to_rfc3339());
        if let Some(body) = message_body {
            scope.system.insert("message.body", body.to_string());
        }
        scope
    }

    /// Resolve a name to its text form.
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(v) = self.variables.get(name) {
            return Some(v.to_text());
        }
        self.system.get(name).cloned()
    }
}

/// Result of rendering a template. Rendering never fails; unresolved tokens are reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    pub unresolved: Vec<String>,
}

/// Substitute `{{name}}` tokens. Unknown names render as an empty string.
pub fn render(template: &str, scope: &RenderScope<'_>) -> Rendered {
    let mut unresolved = Vec::new();
    let text = token_regex()
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match scope.lookup(key) {
                Some(v) => v,
                None => {
                    if !unresolved.iter().any(|u| u == key) {
                        unresolved.push(key.to_string());
                    }
                    String::new()
                }
            }
        })
        .into_owned();
    Rendered { text, unresolved }
}
