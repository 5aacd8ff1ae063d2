pub mod agents;
pub mod error;
pub mod handlers;
pub mod index;
pub mod init;
pub mod models;
pub mod state;

pub use crate::state::AppState;
pub use crate::agents::{RagAgent, StreamEvent, CancellationToken, RequestManager};
pub use crate::index::{Retriever, RetrieverHandle};
