mod job;
mod state;

pub use job::{JobDescription, JobId, JobPatch, JobView, Params, Platform, TrainingJob};
pub use state::{JobStatus, StateMachine, Transition};
