use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    composer::Completer,
    error::{Error, Result},
};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3:latest";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Completion through a local Ollama server (`POST /api/generate`).
///
/// Blocking. Callers on an async runtime run it on a blocking thread.
#[derive(Debug, Clone)]
pub struct OllamaCompleter {
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaCompleter {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

impl Completer for OllamaCompleter {
    fn complete(&self, prompt: &str) -> Result<String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::CompletionService(e.to_string()))?;

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };

        let response = client
            .post(self.endpoint())
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                Error::CompletionService(format!(
                    "{} ({}): {e}",
                    self.endpoint(),
                    self.model
                ))
            })?;

        let body: GenerateResponse = response.json().map_err(|e| {
            Error::CompletionService(format!("unexpected response body: {e}"))
        })?;
        Ok(body.response)
    }
}
