//! Workflow language: parsing, definitions and serialization
//!
//! Workflow files are line-oriented `DIRECTIVE value` text. Loading runs in
//! two stages: [`directive::parse`] produces typed directives, then the
//! [`apply::Applicator`] folds them into a [`WorkflowDefinition`], expanding
//! INCLUDE and ON-FAILURE/ON-SUCCESS blocks along the way.

pub mod apply;
pub mod definition;
pub mod directive;
pub mod error;
pub mod loader;
pub mod serialize;
pub mod step;
pub mod template;

pub use apply::{Action, action_for, parse_duration, parse_percentage};
pub use definition::{
    CheckpointPolicy, CheckpointSettings, CompactionSettings, ContextLimitAction, ContextPatterns,
    DEFAULT_CONTEXT_LIMIT, DEFAULT_RUN_TIMEOUT_SECS, FileRules, OutputPolicy, PromptInjection, Provenance,
    RunOnError, RunSettings, VerifyOnError, VerifySettings, WorkflowDefinition, WorkflowOverrides,
};
pub use directive::{Directive, DirectiveKind, parse};
pub use error::ParseError;
pub use loader::{load_or_inline, load_workflow, parse_workflow, parse_workflow_in};
pub use step::{RunStep, Step, StepKind};
pub use template::{PromptVars, TemplateRenderer};
