//! 外部接口客户端模块

pub mod comfy_client;

pub use comfy_client::{ComfyApi, ComfyClient, QueuedJob};
