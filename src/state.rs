use std::sync::Arc;

use crate::agents::RagAgent;
use crate::index::RetrieverHandle;

// ============================================================================
// AppState
// ============================================================================

/// Shared by every request. Nothing in here is mutated by a request.
#[derive(Clone)]
pub struct AppState {
    pub retriever: RetrieverHandle,
    pub agent: Arc<RagAgent>,
}
