//! Minimal `{{ ... }}` interpolation for configuration strings.
//!
//! An expression is a head optionally piped through functions:
//!
//! - `timestamp`: seconds since the Unix epoch at context creation
//! - `isotime`: the same instant as `YYYY-MM-DDTHH:MM:SSZ`
//! - `.Name`: a context variable (`--var Name=value`, `.Device`, `.Command`)
//! - `"text"`: a string literal
//!
//! Functions: `clean_image_name`, `lower`, `upper`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unclosed '{{{{' at offset {0}")]
    Unclosed(usize),
    #[error("empty expression at offset {0}")]
    EmptyExpression(usize),
    #[error("unknown variable '.{0}'")]
    UnknownVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unterminated string literal in '{0}'")]
    UnterminatedLiteral(String),
}

/// Variables and the fixed clock used while rendering.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
    now: DateTime<Utc>,
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with a pinned clock, so every field of one build shares the
    /// same `timestamp`.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            vars: BTreeMap::new(),
            now,
        }
    }

    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_var(name, value);
        self
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(TemplateError::Unclosed(offset + start));
            };
            let expr = after[..end].trim();
            if expr.is_empty() {
                return Err(TemplateError::EmptyExpression(offset + start));
            }
            out.push_str(&self.eval(expr)?);

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn eval(&self, expr: &str) -> Result<String, TemplateError> {
        let parts = split_pipeline(expr);
        let mut value = self.eval_head(parts[0].trim())?;
        for func in &parts[1..] {
            value = apply(func.trim(), &value)?;
        }
        Ok(value)
    }

    fn eval_head(&self, head: &str) -> Result<String, TemplateError> {
        if let Some(literal) = head.strip_prefix('"') {
            return literal
                .strip_suffix('"')
                .map(str::to_owned)
                .ok_or_else(|| TemplateError::UnterminatedLiteral(head.to_owned()));
        }
        if let Some(name) = head.strip_prefix('.') {
            return self
                .var(name)
                .map(str::to_owned)
                .ok_or_else(|| TemplateError::UnknownVariable(name.to_owned()));
        }
        match head {
            "timestamp" => Ok(self.now.timestamp().to_string()),
            "isotime" => Ok(self.now.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            other => Err(TemplateError::UnknownFunction(other.to_owned())),
        }
    }
}

fn split_pipeline(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_literal = false;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '"' => in_literal = !in_literal,
            '|' if !in_literal => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    parts
}

fn apply(func: &str, value: &str) -> Result<String, TemplateError> {
    match func {
        "clean_image_name" => Ok(clean_image_name(value)),
        "lower" => Ok(value.to_lowercase()),
        "upper" => Ok(value.to_uppercase()),
        other => Err(TemplateError::UnknownFunction(other.to_owned())),
    }
}

pub(crate) fn is_image_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "()[] ./-'@_".contains(c)
}

/// Replace characters that image names may not contain with `-`.
pub fn clean_image_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_image_name_char(c) { c } else { '-' })
        .collect()
}
