//! Call-level control: the session, the turn loop and the background work
//! around it.
pub mod audit;
pub mod event;
pub mod orchestrator;
pub mod session;
pub mod tasks;
pub mod time;
pub mod watchdog;

pub use event::{FailureKind, RetryClass, TurnOutcome, TurnReport};
pub use orchestrator::{Collaborators, TurnOrchestrator};
pub use session::{CallDirection, CallSession, SessionFlags};
