use thiserror::Error;

/// 应用程序错误类型
///
/// 编排路径统一走 `anyhow`，这里只保留边界上需要类型区分的错误：
/// HTTP 接口错误（是否重试由调用方决定）和流式通道错误
/// （重连循环依赖其变体区分）。
#[derive(Debug, Error)]
pub enum AppError {
    /// API 调用错误
    #[error("API错误: {0}")]
    Api(#[from] ApiError),
    /// 流式通道错误
    #[error("流式通道错误: {0}")]
    Stream(#[from] StreamError),
}

/// API 调用错误
#[derive(Debug, Error)]
pub enum ApiError {
    /// 网络请求失败
    #[error("API请求失败 ({endpoint}): {source}")]
    RequestFailed {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// API 返回错误响应
    #[error("API返回错误响应 ({endpoint}): status={status}, message={message:?}")]
    BadResponse {
        endpoint: String,
        status: u16,
        message: Option<String>,
    },
    /// 响应缺少必需字段
    #[error("API响应缺少字段 ({endpoint}): {field}")]
    MissingField { endpoint: String, field: String },
}

/// 流式通道错误
#[derive(Debug, Error)]
pub enum StreamError {
    /// 建立连接失败
    #[error("无法连接流式通道 ({url}): {source}")]
    ConnectFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 通道异常关闭
    #[error("流式通道异常关闭: {reason}")]
    ClosedAbnormally { reason: String },
    /// 重连次数耗尽
    #[error("重连 {attempts} 次后仍然失败: {last}")]
    RetryBudgetExhausted { attempts: u32, last: String },
    /// 后端报告任务执行失败
    #[error("任务执行失败 (节点 {node_id}): {reason}")]
    ExecutionFailed { node_id: String, reason: String },
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建API请求失败错误
    pub fn api_request_failed(
        endpoint: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Api(ApiError::RequestFailed {
            endpoint: endpoint.into(),
            source: Box::new(source),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
