pub mod control;
pub mod curriculum;
pub mod interruption;
pub mod llm_client;
pub mod objective;
pub mod orchestrator;
pub mod personalization;
pub mod persistence;
pub mod progression;
pub mod prompts;
pub mod quiz;
pub mod session;

pub use orchestrator::{Orchestrator, OrchestratorSettings, TurnError, TurnOutcome};
pub use session::{Phase, SessionState};
