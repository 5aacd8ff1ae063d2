use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::models::ContextSource;

pub const REFUSAL_MESSAGE: &str =
    "Sorry, I cannot answer that based on the available documents.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Thinking,
    Response,
}

/// One line of the outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub phase: Phase,
    pub think: String,
    pub response: String,
    pub context_sources: Vec<ContextSource>,
}

impl StreamEvent {
    pub fn thinking(think: impl Into<String>, sources: &[ContextSource]) -> Self {
        Self {
            phase: Phase::Thinking,
            think: think.into(),
            response: String::new(),
            context_sources: sources.to_vec(),
        }
    }

    pub fn response(
        think: impl Into<String>,
        response: impl Into<String>,
        sources: &[ContextSource],
    ) -> Self {
        Self {
            phase: Phase::Response,
            think: think.into(),
            response: response.into(),
            context_sources: sources.to_vec(),
        }
    }

    /// Single-shot answer used when retrieval found nothing.
    pub fn refusal() -> Self {
        Self::response("", REFUSAL_MESSAGE, &[])
    }

    /// Serialize as one NDJSON record, newline included.
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndjson_shape() {
        let sources = vec![ContextSource {
            source: "data/ipc.pdf".to_string(),
            text: "Whoever commits murder...".to_string(),
            score: 0.5,
        }];
        let line = StreamEvent::thinking("analyzing", &sources).to_ndjson().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["phase"], "thinking");
        assert_eq!(value["think"], "analyzing");
        assert_eq!(value["response"], "");
        assert_eq!(value["context_sources"][0]["source"], "data/ipc.pdf");
        assert_eq!(value["context_sources"][0]["score"], 0.5);
    }

    #[test]
    fn test_refusal() {
        let event = StreamEvent::refusal();
        assert_eq!(event.phase, Phase::Response);
        assert_eq!(event.think, "");
        assert_eq!(event.response, REFUSAL_MESSAGE);
        assert!(event.context_sources.is_empty());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Thinking.to_string(), "thinking");
        assert_eq!(Phase::Response.as_ref(), "response");
    }
}
