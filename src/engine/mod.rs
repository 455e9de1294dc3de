pub mod activity;
pub mod params;
pub mod update;

pub use activity::AuthorActivity;
pub use params::EngineParams;
pub use update::{Diagnostics, ProbabilityEngine, UpdateOutcome, UpdateRequest};
