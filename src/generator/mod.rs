//! The external text-generation capability.
//!
//! Work item processors only see the [`Generator`] trait. [`AnthropicClient`]
//! talks to the Messages API; [`EchoGenerator`] answers offline for dry runs.

pub mod client;
pub mod error;
pub mod types;

use std::future::Future;

pub use client::{AnthropicClient, ClientSettings};
pub use error::GenerateError;

use crate::job::Payload;

/// Produces text for one row using the given model. `instruction` is the
/// prompt of the step being run and goes ahead of the row's fields.
pub trait Generator: Send + Sync + 'static {
    fn generate(
        &self,
        payload: &Payload,
        instruction: &str,
        model: &str,
    ) -> impl Future<Output = Result<String, GenerateError>> + Send;
}

/// Deterministic offline generator: echoes the row's values back.
#[derive(Debug, Default, Clone)]
pub struct EchoGenerator;

impl Generator for EchoGenerator {
    async fn generate(&self, payload: &Payload, _instruction: &str, model: &str) -> Result<String, GenerateError> {
        let values: Vec<String> = payload.values().map(cell_text).collect();
        Ok(format!("[{model}] {}", values.join(" | ")))
    }
}

/// Instruction followed by one `field: value` line per payload entry.
pub fn render_prompt(instruction: &str, payload: &Payload) -> String {
    let fields: Vec<String> = payload
        .iter()
        .map(|(field, value)| format!("{field}: {}", cell_text(value)))
        .collect();
    if instruction.is_empty() {
        fields.join("\n")
    } else {
        format!("{instruction}\n---\n{}\n---", fields.join("\n"))
    }
}

/// Text form of a payload value: strings unquoted, null empty, the rest as JSON.
pub fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
