use serde_json::{Map, Value};

/// Template names and context rendered into a draft's bodies by a template plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailTemplate {
    /// Name of the template producing the HTML body.
    pub html_template: Option<String>,
    /// Name of the template producing the text body.
    pub text_template: Option<String>,
    /// Values available to both templates.
    pub context: Map<String, Value>,
}

impl EmailTemplate {
    /// Creates an empty template set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTML template name.
    pub fn html(mut self, name: impl Into<String>) -> Self {
        self.html_template = Some(name.into());
        self
    }

    /// Sets the text template name.
    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.text_template = Some(name.into());
        self
    }

    /// Adds a context value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
