pub mod checker;
pub mod compare;
pub mod config;
pub mod engine;
pub mod equivalence;
pub mod errors;
pub mod extract;
pub mod fingerprint;
pub mod history;
pub mod model;
pub mod prompts;
pub mod providers;
pub mod report;

pub use engine::{Engine, EngineParts, RunOutcome, RunRequest};
