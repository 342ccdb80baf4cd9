pub mod cli;
pub mod context;
pub mod discover;
pub mod fixers;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod tools;
pub mod validators;

pub use context::{ProviderHandle, RunContext};
pub use fixers::{Fixer, FixerKind, FixerStage};
pub use orchestrator::FixOrchestrator;
pub use pipeline::{PipelineOutcome, PipelineState, run_pipeline};
pub use process::{ProcessRunner, SystemProcessRunner, ToolCommand, ToolOutcome, ToolOutput};
pub use validators::{Validator, ValidatorKind, ValidatorStage};
