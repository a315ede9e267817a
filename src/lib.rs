//! # Comfy Prompt CLI
//!
//! 一个把自然语言提示词变成 ComfyUI 批量生成任务的客户端
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 数据模型层（Models）
//! - `models/prompt_vars` - 提示词变量文件的加载与持久化
//! - `models/workflow` - 工作流模板（API 导出格式）
//!
//! ### ② 业务能力层（Services）
//! - `services/variable_store` - 变量仓库与缺失变量的生成分类
//! - `services/token_resolver` - `__变量__` 占位符解析引擎
//! - `services/workflow_mutator` - 工作流参数写入
//! - `services/progress_listener` - WebSocket 进度监听与重连
//! - `services/artifact_service` - 产物下载与落盘
//! - `services/llm_service` - 提示词增强与变量值生成
//!
//! ### ③ 外部接口层（Clients）
//! - `clients/comfy_client` - ComfyUI HTTP 接口
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 两阶段批量任务处理器
//!
//! ## 使用示例
//!
//! ```bash
//! comfy_prompt_cli "a __art_style__ painting of a __animal__ : x4"
//! ```

pub mod app;
pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;

// 重新导出常用类型
pub use app::App;
pub use clients::{ComfyApi, ComfyClient, QueuedJob};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{PromptVar, Workflow, WorkflowNode, WorkflowOverride};
pub use orchestrator::{BatchProcessor, BatchStats};
pub use services::{
    LlmService, ProgressEvent, ProgressListener, ResolvedPrompt, TokenResolver, VariableStore,
};
