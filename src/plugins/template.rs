use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::Plugin;
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::message::Email;

/// Renders a named template against a context.
pub trait TemplateEngine: Send + Sync {
    /// Renders template `name`.
    fn render(&self, name: &str, context: &Map<String, Value>) -> MailerResult<String>;
}

/// In-memory templates with `{{ key }}` substitution.
///
/// Strings are inserted as-is, other JSON values in their JSON form, and
/// unknown keys render empty.
#[derive(Debug, Clone, Default)]
pub struct SimpleTemplateEngine {
    templates: HashMap<String, String>,
}

impl SimpleTemplateEngine {
    /// Creates an engine without templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template source under `name`.
    pub fn with_template(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.templates.insert(name.into(), source.into());
        self
    }
}

impl TemplateEngine for SimpleTemplateEngine {
    fn render(&self, name: &str, context: &Map<String, Value>) -> MailerResult<String> {
        let source = self.templates.get(name).ok_or_else(|| {
            MailerError::new(
                MailerErrorKind::Template,
                format!("Template \"{}\" not found.", name),
            )
        })?;

        let mut out = String::with_capacity(source.len());
        let mut rest = source.as_str();
        while let Some(start) = rest.find("{{") {
            let Some(end) = rest[start..].find("}}") else {
                return Err(MailerError::new(
                    MailerErrorKind::Template,
                    format!("Unclosed placeholder in template \"{}\".", name),
                ));
            };
            out.push_str(&rest[..start]);
            let key = rest[start + 2..start + end].trim();
            match context.get(key) {
                Some(Value::String(s)) => out.push_str(s),
                Some(Value::Null) | None => {}
                Some(other) => out.push_str(&other.to_string()),
            }
            rest = &rest[start + end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Fills a draft's empty bodies from its [`EmailTemplate`](crate::message::EmailTemplate).
#[derive(Clone)]
pub struct TemplateRenderer {
    engine: Arc<dyn TemplateEngine>,
}

impl TemplateRenderer {
    /// Creates a renderer over `engine`.
    pub fn new(engine: impl TemplateEngine + 'static) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

impl fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

#[async_trait]
impl Plugin for TemplateRenderer {
    async fn process_email(&self, mut email: Email) -> MailerResult<Email> {
        let Some(template) = email.template.as_ref() else {
            return Ok(email);
        };

        let html = match (&email.html, &template.html_template) {
            (None, Some(name)) => Some(self.engine.render(name, &template.context)?),
            _ => None,
        };
        let text = match (&email.text, &template.text_template) {
            (None, Some(name)) => Some(self.engine.render(name, &template.context)?),
            _ => None,
        };

        if html.is_some() {
            email.html = html;
        }
        if text.is_some() {
            email.text = text;
        }
        Ok(email)
    }
}
