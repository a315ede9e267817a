//! ComfyUI API 客户端
//!
//! 封装所有与 ComfyUI HTTP 接口相关的调用逻辑：
//! 任务提交、历史查询、产物下载和连通性检查。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, AppError, AppResult};
use crate::models::workflow::Workflow;

/// 任务提交超时
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);
/// 历史查询超时
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);
/// 产物下载超时
const VIEW_TIMEOUT: Duration = Duration::from_secs(30);
/// 连通性检查超时
const CONNECT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// 已入队任务的标识
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// 后端分配的任务 ID
    pub prompt_id: String,
    /// 本次提交使用的客户端 ID（流式通道订阅用）
    pub client_id: String,
}

/// ComfyUI HTTP 接口能力
///
/// 把任务提交/历史查询/产物下载抽象出来，
/// 编排层的测试可以用脚本化实现替换真实后端。
#[async_trait]
pub trait ComfyApi: Send + Sync {
    /// 提交工作流任务，返回 (任务 ID, 客户端 ID)
    async fn submit(&self, workflow: &Workflow) -> AppResult<QueuedJob>;
    /// 查询任务执行历史
    async fn fetch_history(&self, prompt_id: &str) -> AppResult<Value>;
    /// 下载单个产物文件
    async fn fetch_view(
        &self,
        filename: &str,
        subfolder: &str,
        file_type: &str,
    ) -> AppResult<Vec<u8>>;
}

/// ComfyUI API 客户端
pub struct ComfyClient {
    http_url: String,
    client: reqwest::Client,
}

impl ComfyClient {
    /// 创建新的 ComfyUI 客户端
    pub fn new(config: &Config) -> Self {
        Self {
            http_url: config.http_url(),
            client: reqwest::Client::new(),
        }
    }

    /// 检查与 ComfyUI 的连通性
    ///
    /// 请求服务根路径，5 秒超时。只区分"可达"与"不可达"，
    /// 不解析响应内容。
    pub async fn check_connection(&self) -> bool {
        debug!("检查 ComfyUI 连通性: {}", self.http_url);

        let result = self
            .client
            .get(&self.http_url)
            .timeout(CONNECT_CHECK_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                warn!("ComfyUI 响应异常状态码: {}", response.status());
                false
            }
            Err(e) => {
                warn!("无法连接 ComfyUI: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl ComfyApi for ComfyClient {
    /// 提交工作流任务
    ///
    /// 每次提交生成一个新的客户端 ID，与返回的任务 ID
    /// 一起用于后续的流式进度订阅。
    async fn submit(&self, workflow: &Workflow) -> AppResult<QueuedJob> {
        let client_id = Uuid::new_v4().to_string();
        let payload = json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        let url = format!("{}/prompt", self.http_url);

        info!("📤 提交任务到 {} (客户端 ID: {})", url, client_id);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::api_request_failed("/prompt", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Api(ApiError::BadResponse {
                endpoint: "/prompt".to_string(),
                status: status.as_u16(),
                message: (!body.is_empty()).then_some(body),
            }));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AppError::api_request_failed("/prompt", e))?;

        let prompt_id = data
            .get("prompt_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::Api(ApiError::MissingField {
                    endpoint: "/prompt".to_string(),
                    field: "prompt_id".to_string(),
                })
            })?
            .to_string();

        info!("✓ 任务已入队，任务 ID: {}", prompt_id);

        Ok(QueuedJob {
            prompt_id,
            client_id,
        })
    }

    /// 查询任务执行历史，返回的 JSON 外层以任务 ID 为键
    async fn fetch_history(&self, prompt_id: &str) -> AppResult<Value> {
        let url = format!("{}/history/{}", self.http_url, prompt_id);
        debug!("查询任务历史: {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::api_request_failed("/history", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Api(ApiError::BadResponse {
                endpoint: "/history".to_string(),
                status: status.as_u16(),
                message: None,
            }));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::api_request_failed("/history", e))
    }

    /// 下载单个产物文件
    ///
    /// # 参数
    /// - `filename`: 产物文件名
    /// - `subfolder`: 产物所在子目录（可为空）
    /// - `file_type`: 产物类型（通常为 `output` 或 `temp`）
    async fn fetch_view(
        &self,
        filename: &str,
        subfolder: &str,
        file_type: &str,
    ) -> AppResult<Vec<u8>> {
        let url = format!("{}/view", self.http_url);
        debug!("下载产物: {} (子目录: {:?})", filename, subfolder);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", file_type),
            ])
            .timeout(VIEW_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::api_request_failed("/view", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Api(ApiError::BadResponse {
                endpoint: "/view".to_string(),
                status: status.as_u16(),
                message: None,
            }));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::api_request_failed("/view", e))?;

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_is_unique_per_submission() {
        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    /// 测试 ComfyUI 连通性检查
    ///
    /// 需要本地运行 ComfyUI，运行方式：
    /// ```bash
    /// cargo test test_check_connection_live -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_check_connection_live() {
        let config = Config::from_env();
        let client = ComfyClient::new(&config);

        let reachable = client.check_connection().await;
        println!("ComfyUI 可达: {}", reachable);
        assert!(reachable);
    }
}
