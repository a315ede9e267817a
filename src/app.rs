//! 应用外壳
//!
//! 负责启动检查和资源装配：连通性检查、加载工作流模板、
//! 构建各业务服务，然后把输入交给批量处理器。

use anyhow::{Context, Result};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clients::comfy_client::ComfyClient;
use crate::config::Config;
use crate::models::workflow::{Workflow, WorkflowOverride};
use crate::orchestrator::{BatchProcessor, BatchStats};
use crate::services::llm_service::{LlmService, PromptEnhancer};
use crate::services::progress_listener::WsTransport;
use crate::services::variable_store::ValueGenerator;
use crate::utils::logging::log_startup;

/// 应用主结构
pub struct App {
    config: Config,
    template: Workflow,
    client: ComfyClient,
    transport: WsTransport,
    llm: Option<LlmService>,
}

impl App {
    /// 初始化应用
    ///
    /// 检查后端连通性、加载工作流模板、按配置装配 LLM 服务。
    pub async fn initialize(config: Config) -> Result<Self> {
        log_startup(&config);

        let client = ComfyClient::new(&config);
        if !client.check_connection().await {
            anyhow::bail!("无法连接 ComfyUI ({})，请检查服务是否启动", config.http_url());
        }
        info!("✓ ComfyUI 连接正常");

        let template = Workflow::load(Path::new(&config.workflow_file))
            .context("无法加载工作流模板")?;

        let llm = if config.llm_api_key.is_empty() {
            warn!("⚠️ 未配置 LLM API Key，增强与变量生成功能不可用");
            None
        } else {
            Some(LlmService::new(&config))
        };

        Ok(Self {
            config,
            template,
            client,
            transport: WsTransport,
            llm,
        })
    }

    /// 运行一批任务
    ///
    /// Ctrl+C 触发取消：关闭在途监听、放弃排队任务。
    /// 信号监听任务只活到本批结束，批次返回时随守卫一起中止。
    pub async fn run_batch(
        &self,
        user_input: &str,
        overrides: &[WorkflowOverride],
    ) -> Result<BatchStats> {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let _signal_guard = AbortOnDrop(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("\n⚠️ 收到 Ctrl+C，正在取消当前批次...");
                let _ = cancel_tx.send(true);
            }
        }));

        let enhancer = self.llm.as_ref().map(|s| s as &dyn PromptEnhancer);
        let generator = self.llm.as_ref().map(|s| s as &dyn ValueGenerator);

        let processor = BatchProcessor::new(
            &self.config,
            &self.template,
            &self.client,
            &self.transport,
            enhancer,
            generator,
        );

        let mut rng = StdRng::from_entropy();
        processor
            .run_batch(user_input, overrides, &mut rng, &mut cancel_rx)
            .await
    }
}

/// 后台任务守卫：离开作用域时中止所持任务
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_abort_guard_stops_task_on_drop() {
        let (tx, rx) = oneshot::channel::<()>();

        // 任务永不自行结束，发送端只会因任务被中止而掉落
        let guard = AbortOnDrop(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        drop(guard);

        assert!(rx.await.is_err());
    }
}
