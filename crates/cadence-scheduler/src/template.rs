//! Placeholder substitution for commands, URLs and request bodies.
//!
//! A job with `template_delimiters = "{{ }}"` may write `{{ .Owner }}` in its
//! command; the placeholder is replaced with the job's owner before every run.

use crate::error::{Result, SchedulerError};

/// Job fields available to templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub command: String,
    pub schedule: String,
    pub epsilon: String,
}

impl TemplateContext {
    fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "Id" => &self.id,
            "Name" => &self.name,
            "Owner" => &self.owner,
            "Command" => &self.command,
            "Schedule" => &self.schedule,
            "Epsilon" => &self.epsilon,
            _ => return None,
        };
        Some(value)
    }
}

/// Render `input`, or return it untouched when `delimiters` is empty.
pub fn render(input: &str, delimiters: &str, ctx: &TemplateContext) -> Result<String> {
    if delimiters.trim().is_empty() {
        return Ok(input.to_string());
    }
    let parts: Vec<&str> = delimiters.split_whitespace().collect();
    let [left, right] = parts.as_slice() else {
        return Err(SchedulerError::InvalidTemplate(format!(
            "delimiters {delimiters:?} must be two space-separated tokens"
        )));
    };

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find(left) {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + left.len()..];
        let close = after_open.find(right).ok_or_else(|| {
            SchedulerError::InvalidTemplate(format!("unclosed placeholder in {input:?}"))
        })?;

        let expr = after_open[..close].trim();
        let field = expr.strip_prefix('.').ok_or_else(|| {
            SchedulerError::InvalidTemplate(format!("placeholder {expr:?} must start with '.'"))
        })?;
        let value = ctx.field(field).ok_or_else(|| {
            SchedulerError::InvalidTemplate(format!("unknown field {field:?}"))
        })?;
        out.push_str(value);

        rest = &after_open[close + right.len()..];
    }
    out.push_str(rest);
    Ok(out)
}
