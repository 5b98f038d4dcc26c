pub mod state;
pub mod transcript;

pub use state::{SessionRecord, StateStore};
pub use transcript::TranscriptStore;
