// Public module exports
pub mod backend;
pub mod events;
pub mod phase_splitter;
pub mod prompt;
pub mod rag_agent;

// Re-export main types for convenience
pub use backend::{parse_fragment, Fragment, GenerationBackend, GenerationOptions, LineBuffer, OllamaBackend};
pub use events::{Phase, StreamEvent, REFUSAL_MESSAGE};
pub use phase_splitter::{locate_markers, MarkerPositions, PhaseSplitter, SplitterState};
pub use prompt::PromptBuilder;
pub use rag_agent::{AgentSettings, CancellationToken, RagAgent, RequestManager, RequestStream, StreamOutcome};
