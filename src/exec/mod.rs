pub mod events;
pub mod orchestrator;
pub mod session;
pub mod worker;

pub use events::{EventBus, SessionEvent, SessionEventEnvelope};
pub use orchestrator::{Orchestrator, SessionReport, SessionStatusView};
pub use session::{Session, SessionStatus};
pub use worker::{SequentialContext, TaskExecutor, WorkerContext};
