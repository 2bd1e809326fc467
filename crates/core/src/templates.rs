//! Template renderer using `{{variable}}` syntax.

use crate::error::{MailflowError, MailflowResult};
use crate::types::{TemplateVariable, Variables};

/// Variable-substitution engine.
pub trait Renderer: Send + Sync {
    /// Render `source` against `variables`. Declared variables marked required
    /// with no value and no default fail with `MissingVariable`.
    fn render(
        &self,
        source: &str,
        variables: &Variables,
        declared: &[TemplateVariable],
    ) -> MailflowResult<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Render subject and body with the same context.
pub fn render_message(
    renderer: &dyn Renderer,
    subject: &str,
    body: &str,
    variables: &Variables,
    declared: &[TemplateVariable],
) -> MailflowResult<RenderedMessage> {
    Ok(RenderedMessage {
        subject: renderer.render(subject, variables, declared)?,
        body: renderer.render(body, variables, declared)?,
    })
}

/// Simple renderer. Placeholders are `{{ name }}`; unknown placeholders
/// render empty, unterminated `{{` is copied verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    fn resolve(name: &str, variables: &Variables, declared: &[TemplateVariable]) -> String {
        match variables.get(name) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => declared
                .iter()
                .find(|v| v.name == name)
                .and_then(|v| v.default.clone())
                .unwrap_or_default(),
            Some(other) => other.to_string(),
        }
    }
}

impl Renderer for TemplateRenderer {
    fn render(
        &self,
        source: &str,
        variables: &Variables,
        declared: &[TemplateVariable],
    ) -> MailflowResult<String> {
        for var in declared.iter().filter(|v| v.required) {
            let supplied = variables.get(&var.name).is_some_and(|v| !v.is_null());
            if !supplied && var.default.is_none() {
                return Err(MailflowError::MissingVariable(var.name.clone()));
            }
        }

        let mut out = String::with_capacity(source.len());
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let name = after[..close].trim();
                    out.push_str(&Self::resolve(name, variables, declared));
                    rest = &after[close + 2..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}
