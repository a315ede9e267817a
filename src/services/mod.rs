//! 业务能力层模块

pub mod artifact_service;
pub mod llm_service;
pub mod progress_listener;
pub mod token_resolver;
pub mod variable_store;
pub mod workflow_mutator;

pub use artifact_service::ArtifactService;
pub use llm_service::{LlmService, PromptEnhancer};
pub use progress_listener::{ListenOutcome, ProgressEvent, ProgressListener, WsTransport};
pub use token_resolver::{ResolvedPrompt, TokenResolver};
pub use variable_store::{classify_variable, GenerationKind, ValueGenerator, VariableStore};
pub use workflow_mutator::WorkflowMutator;
