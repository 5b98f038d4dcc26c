pub mod controller;
pub mod runner;
pub mod session;

pub use controller::{CleanupMutex, SessionController, SessionOutcome, SessionRequest};
pub use runner::{AgentLoop, LoopEnd};
pub use session::{Session, StopFlag};
