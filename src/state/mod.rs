/// Status transitions and per-tick lifecycle phase.
pub mod state_machine;

pub use self::state_machine::{InvalidTransition, LifecyclePhase, StatusEvent, TransitionError};
