use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

// ============================================================================
// FRAGMENT ENVELOPE
// ============================================================================

/// One NDJSON record of an Ollama `/api/generate` stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Tolerant parse: anything that is not a JSON envelope yields `None`.
pub fn parse_fragment(line: &str) -> Option<Fragment> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Fragment>(line) {
        Ok(fragment) => Some(fragment),
        Err(e) => {
            log::debug!("Skipping malformed fragment ({}): {:.80}", e, line);
            None
        }
    }
}

// ============================================================================
// LINE BUFFER
// ============================================================================

/// Reassembles newline-delimited records from arbitrarily chunked bytes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn has_remaining(&self) -> bool {
        self.pending.iter().any(|b| !b.is_ascii_whitespace())
    }

    pub fn take_remaining(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

pub type LineStream = BoxStream<'static, Result<String>>;

/// Streaming text generation.
///
/// `generate` resolves once the upstream accepted the request, so a non-success
/// status surfaces as an error before any line is read.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<LineStream>;
}

// ============================================================================
// OLLAMA
// ============================================================================

/// Sampling parameters. Fixed server-side, never taken from the caller.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub num_predict: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.9,
            repeat_penalty: 1.1,
            num_predict: 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerationOptions,
}

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    options: GenerationOptions,
}

impl OllamaBackend {
    /// `timeout` bounds how long the backend may stay silent: connecting,
    /// waiting for headers, or between body reads. A generation that keeps
    /// producing output is never cut off.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            options: GenerationOptions::default(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    async fn generate(&self, prompt: &str) -> Result<LineStream> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateBody {
                model: &self.model,
                prompt,
                stream: true,
                options: self.options,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read upstream error body: {}", e));
            return Err(AppError::backend_status(status.as_u16(), body));
        }

        let mut upstream = response.bytes_stream();
        let lines = async_stream::stream! {
            let mut buffer = LineBuffer::new();
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_chunk(&bytes);
                        while let Some(line) = buffer.next_line() {
                            yield Ok(line);
                        }
                    }
                    Err(e) => {
                        yield Err(AppError::from(e));
                        return;
                    }
                }
            }
            if buffer.has_remaining() {
                yield Ok(buffer.take_remaining());
            }
        };

        Ok(lines.boxed())
    }
}
