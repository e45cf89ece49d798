//! Placeholder rendering shared by workspace files, mounted files,
//! environment values and readiness parameters.
//!
//! Placeholders use Tera syntax: `{{ external_address }}`,
//! `{{ self_port(port=8080) }}`. Text without placeholders passes through
//! unchanged.

use std::collections::HashMap;
use std::error::Error as _;

use ephemera_common::error::{EphemeraError, Result};
use tera::{Context, Tera, Value};

/// Maximum length of the input echoed back in interpolation errors.
const FRAGMENT_LIMIT: usize = 80;

/// A Tera instance with registered lookup functions.
pub struct Renderer {
    tera: Tera,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").finish_non_exhaustive()
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    /// Creates a renderer without custom functions.
    #[must_use]
    pub fn new() -> Self {
        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        Self { tera }
    }

    /// Registers a function callable from placeholders.
    pub fn register_function<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&HashMap<String, Value>) -> tera::Result<Value> + Sync + Send + 'static,
    {
        self.tera.register_function(name, function);
    }

    /// Renders `text` against `context`.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Interpolation` carrying the offending input and
    /// the full error chain.
    pub fn render(&mut self, text: &str, context: &Context) -> Result<String> {
        if !has_placeholders(text) {
            return Ok(text.to_owned());
        }
        self.tera
            .render_str(text, context)
            .map_err(|e| interpolation_error(text, &e))
    }
}

/// Renders `text` once against a serializable data value.
///
/// # Errors
///
/// Returns `EphemeraError::Interpolation` if the data is not an object or
/// rendering fails.
pub fn render_with_data(text: &str, data: &serde_json::Value) -> Result<String> {
    let context = Context::from_value(data.clone()).map_err(|e| interpolation_error(text, &e))?;
    Renderer::new().render(text, &context)
}

/// Returns `true` if `text` contains Tera expression or statement markers.
#[must_use]
pub fn has_placeholders(text: &str) -> bool {
    text.contains("{{") || text.contains("{%") || text.contains("{#")
}

/// Builds an interpolation error flattening the Tera error chain.
pub fn interpolation_error(text: &str, error: &tera::Error) -> EphemeraError {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    EphemeraError::Interpolation {
        fragment: fragment(text),
        message,
    }
}

/// Reads a required argument of a lookup function.
///
/// # Errors
///
/// Returns a Tera error naming the missing or mistyped argument.
pub fn required_arg<T: serde::de::DeserializeOwned>(
    function: &str,
    args: &HashMap<String, Value>,
    name: &str,
) -> tera::Result<T> {
    let value = args
        .get(name)
        .ok_or_else(|| tera::Error::msg(format!("{function}: missing argument `{name}`")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| tera::Error::msg(format!("{function}: argument `{name}`: {e}")))
}

fn fragment(text: &str) -> String {
    if text.chars().count() <= FRAGMENT_LIMIT {
        text.to_owned()
    } else {
        let mut cut: String = text.chars().take(FRAGMENT_LIMIT).collect();
        cut.push_str("...");
        cut
    }
}
