use serde::{Deserialize, Serialize};

// ============================================================================
// Retrieval
// ============================================================================

/// A chunk returned by the retriever, owned by the request that asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedPassage {
    pub text: String,
    pub source_id: String,
    pub score: f32,
}

impl RetrievedPassage {
    pub fn new(text: impl Into<String>, source_id: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            source_id: source_id.into(),
            score,
        }
    }
}

/// Wire form of a passage inside `context_sources`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSource {
    pub source: String,
    pub text: String,
    pub score: f32,
}

impl From<&RetrievedPassage> for ContextSource {
    fn from(passage: &RetrievedPassage) -> Self {
        Self {
            source: passage.source_id.clone(),
            text: passage.text.clone(),
            score: passage.score,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub index_ready: bool,
    pub version: String,
}

impl HealthStatus {
    pub fn from_readiness(index_ready: bool) -> Self {
        Self {
            status: if index_ready { "healthy" } else { "unhealthy" }.to_string(),
            index_ready,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.index_ready
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_source_from_passage() {
        let passage = RetrievedPassage::new("Section 302 ...", "ipc.pdf", 0.42);
        let source = ContextSource::from(&passage);
        assert_eq!(source.source, "ipc.pdf");
        assert_eq!(source.text, "Section 302 ...");
        assert_eq!(source.score, 0.42);
    }

    #[test]
    fn test_health_status() {
        let health = HealthStatus::from_readiness(false);
        assert_eq!(health.status, "unhealthy");
        assert!(!health.is_healthy());
        assert_eq!(HealthStatus::from_readiness(true).status, "healthy");
    }
}
