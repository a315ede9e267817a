//! 数据模型模块

pub mod prompt_vars;
pub mod workflow;

pub use prompt_vars::{load_prompt_vars, save_prompt_var, PromptVar};
pub use workflow::{Workflow, WorkflowNode, WorkflowOverride};
