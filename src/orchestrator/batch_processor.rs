//! 批量任务处理器 - 编排层
//!
//! ## 职责
//!
//! 把一条用户输入变成一批渲染任务并驱动其完整生命周期。
//!
//! ## 核心流程
//!
//! 1. **参数解析**：`提示词 : x10,h832,w1216` 语法 + `>` 增强指令分隔
//! 2. **第一阶段**：逐槽位解析占位符（每个槽位独立随机取值），
//!    可选地调用增强协作方；失败槽位记失败标记，批次继续
//! 3. **第二阶段**：严格顺序地对每个就绪槽位执行
//!    变异 → 提交 → 监听 → 回收产物
//! 4. **全局统计**：汇总整批的成功与失败
//!
//! ## 设计特点
//!
//! - **两阶段分离**：先把整批提示词确定下来，再逐个渲染，
//!   渲染排队期间不会改变任何提示词
//! - **失败隔离**：单任务失败不影响后续任务，单产物失败不影响任务
//! - **可取消**：取消信号在任务间和流式监听内都会被响应

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::clients::comfy_client::ComfyApi;
use crate::config::Config;
use crate::models::workflow::{Workflow, WorkflowOverride};
use crate::services::artifact_service::ArtifactService;
use crate::services::llm_service::PromptEnhancer;
use crate::services::progress_listener::{
    ListenOutcome, ProgressEvent, ProgressListener, StreamTransport,
};
use crate::services::token_resolver::TokenResolver;
use crate::services::variable_store::{ValueGenerator, VariableStore};
use crate::services::workflow_mutator::WorkflowMutator;
use crate::utils::truncate_text;

/// 批量参数
///
/// 语法：`提示词 : x<N>,h<H>,w<W>`，全部可选。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchParams {
    /// 生成张数
    pub count: usize,
    /// 图像高度（像素）
    pub height: u32,
    /// 图像宽度（像素）
    pub width: u32,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            count: 1,
            height: 1024,
            width: 1024,
        }
    }
}

/// 从用户输入中解析批量参数
///
/// 参数段必须在最后一个 `:` 之后，且至少有一项形如
/// `x10` / `h832` / `w1216`，否则整条输入原样作为提示词。
pub fn parse_batch_params(user_input: &str) -> (String, BatchParams) {
    let mut params = BatchParams::default();

    let Some((prompt_part, param_part)) = user_input.rsplit_once(':') else {
        return (user_input.to_string(), params);
    };

    // 参数段必须至少有一项像参数，避免把普通冒号文本误判
    let looks_like_params = param_part.split(',').any(|p| {
        let p = p.trim();
        p.starts_with(['x', 'h', 'w']) && p.chars().any(|c| c.is_ascii_digit())
    });
    if !looks_like_params {
        return (user_input.to_string(), params);
    }

    for param in param_part.split(',') {
        let param = param.trim().to_lowercase();
        // 按字符取前缀，参数段可能以多字节字符开头
        let mut chars = param.chars();
        let Some(prefix) = chars.next() else {
            continue;
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        match (prefix, digits.parse()) {
            ('x', Ok(n)) => params.count = n as usize,
            ('h', Ok(n)) => params.height = n,
            ('w', Ok(n)) => params.width = n,
            _ => {}
        }
    }

    (prompt_part.trim().to_string(), params)
}

/// 从提示词中分离增强指令
///
/// `基础提示词 > 增强指令`；没有 `>` 时不做增强。
pub fn split_enhancement(prompt: &str) -> (String, Option<String>) {
    match prompt.split_once('>') {
        Some((base, instruction)) => (
            base.trim().to_string(),
            Some(instruction.trim().to_string()),
        ),
        None => (prompt.trim().to_string(), None),
    }
}

/// 第一阶段产出的单个槽位
#[derive(Debug, Clone)]
pub enum Slot {
    /// 提示词已确定，等待渲染
    Ready { final_prompt: String },
    /// 解析或增强失败，记录原因
    Failed { reason: String },
}

/// 批次统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// 批量任务处理器
pub struct BatchProcessor<'a> {
    config: &'a Config,
    template: &'a Workflow,
    client: &'a dyn ComfyApi,
    transport: &'a dyn StreamTransport,
    enhancer: Option<&'a dyn PromptEnhancer>,
    generator: Option<&'a dyn ValueGenerator>,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(
        config: &'a Config,
        template: &'a Workflow,
        client: &'a dyn ComfyApi,
        transport: &'a dyn StreamTransport,
        enhancer: Option<&'a dyn PromptEnhancer>,
        generator: Option<&'a dyn ValueGenerator>,
    ) -> Self {
        Self {
            config,
            template,
            client,
            transport,
            enhancer,
            generator,
        }
    }

    /// 运行一整批任务
    ///
    /// # 参数
    /// - `user_input`: 原始输入（含批量参数和增强指令）
    /// - `overrides`: 命令级工作流覆盖项
    /// - `rng`: 本批使用的随机数发生器
    /// - `cancel`: 取消信号
    pub async fn run_batch(
        &self,
        user_input: &str,
        overrides: &[WorkflowOverride],
        rng: &mut StdRng,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<BatchStats> {
        let (prompt_with_enhancement, params) = parse_batch_params(user_input);
        let (base_prompt, enhancement) = split_enhancement(&prompt_with_enhancement);

        if base_prompt.is_empty() {
            warn!("⚠️ 提示词为空，本批跳过");
            return Ok(BatchStats::default());
        }

        log_batch_start(&base_prompt, &params, enhancement.as_deref());

        // ========== 第一阶段：确定整批提示词 ==========
        let slots = self
            .resolve_all_slots(&base_prompt, enhancement.as_deref(), params.count, rng)
            .await;
        debug_assert_eq!(slots.len(), params.count);

        let ready = slots.iter().filter(|s| matches!(s, Slot::Ready { .. })).count();
        info!("✓ 第一阶段完成: {}/{} 个槽位就绪\n", ready, params.count);

        // ========== 第二阶段：顺序渲染 ==========
        let mut stats = BatchStats {
            total: params.count,
            ..Default::default()
        };

        for (index, slot) in slots.iter().enumerate() {
            let job_index = index + 1;

            if *cancel.borrow() {
                warn!("⚠️ 收到取消信号，放弃剩余 {} 个任务", params.count - index);
                stats.cancelled = true;
                break;
            }

            let final_prompt = match slot {
                Slot::Ready { final_prompt } => final_prompt,
                Slot::Failed { reason } => {
                    error!("[任务 {}] ❌ 槽位解析失败，跳过: {}", job_index, reason);
                    stats.failed += 1;
                    continue;
                }
            };

            let seed = self.config.fixed_seed.unwrap_or_else(|| rng.gen::<u32>());

            info!("[任务 {}] 🎨 开始渲染 (种子: {})", job_index, seed);
            match self
                .render_one(final_prompt, seed, &params, overrides, cancel)
                .await
            {
                Ok(RenderOutcome::Done(saved)) => {
                    info!("[任务 {}] ✅ 完成，保存 {} 个产物", job_index, saved);
                    stats.success += 1;
                }
                Ok(RenderOutcome::Cancelled) => {
                    warn!("[任务 {}] ⚠️ 任务被取消", job_index);
                    stats.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("[任务 {}] ❌ 渲染失败: {:#}", job_index, e);
                    stats.failed += 1;
                }
            }
        }

        log_batch_complete(&stats);
        Ok(stats)
    }

    /// 第一阶段：为每个槽位解析出最终提示词
    ///
    /// 每个槽位使用全新的变量仓库，保证随机取值彼此独立；
    /// 失败的槽位留下失败标记，永远恰好产出 `count` 个槽位。
    async fn resolve_all_slots(
        &self,
        base_prompt: &str,
        enhancement: Option<&str>,
        count: usize,
        rng: &mut StdRng,
    ) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(count);

        for index in 1..=count {
            let slot = match self
                .resolve_one_slot(base_prompt, enhancement, rng)
                .await
            {
                Ok(final_prompt) => {
                    info!("[槽位 {}/{}] ✓ {}", index, count, truncate_text(&final_prompt, 120));
                    Slot::Ready { final_prompt }
                }
                Err(e) => {
                    warn!("[槽位 {}/{}] ⚠️ 解析失败: {:#}", index, count, e);
                    Slot::Failed {
                        reason: format!("{:#}", e),
                    }
                }
            };
            slots.push(slot);
        }

        slots
    }

    async fn resolve_one_slot(
        &self,
        base_prompt: &str,
        enhancement: Option<&str>,
        rng: &mut StdRng,
    ) -> Result<String> {
        let mut store =
            VariableStore::open(&self.config.vars_dir).context("无法加载提示词变量目录")?;
        let mut resolver = TokenResolver::new(&mut store, self.generator);
        let resolved = resolver.resolve(base_prompt, rng).await?;

        match (enhancement, self.enhancer) {
            (Some(instruction), Some(enhancer)) => enhancer
                .enhance(&resolved.text, instruction)
                .await
                .context("提示词增强失败"),
            (Some(_), None) => {
                warn!("⚠️ 未配置增强协作方，增强指令被忽略");
                Ok(resolved.text)
            }
            (None, _) => Ok(resolved.text),
        }
    }

    /// 第二阶段：渲染单个任务
    async fn render_one(
        &self,
        final_prompt: &str,
        seed: u32,
        params: &BatchParams,
        overrides: &[WorkflowOverride],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RenderOutcome> {
        // 尺寸参数写入配置的尺寸节点（未配置则跳过）
        let mut all_overrides = Vec::new();
        if !self.config.size_node_id.is_empty() {
            all_overrides.push(WorkflowOverride {
                node_id: self.config.size_node_id.clone(),
                node_property: "width".to_string(),
                value: json!(params.width),
            });
            all_overrides.push(WorkflowOverride {
                node_id: self.config.size_node_id.clone(),
                node_property: "height".to_string(),
                value: json!(params.height),
            });
        }
        all_overrides.extend_from_slice(overrides);

        let mutator = WorkflowMutator::new(self.config);
        let workflow = mutator.prepare(self.template, final_prompt, seed, None, &all_overrides);

        let job = self.client.submit(&workflow).await?;

        let listener = ProgressListener::new(self.config, self.transport);
        let outcome = listener
            .listen(&job.prompt_id, &job.client_id, cancel, log_progress_event)
            .await?;

        if outcome == ListenOutcome::Cancelled {
            // 取消时放弃在途任务的部分产物
            return Ok(RenderOutcome::Cancelled);
        }

        let artifacts = ArtifactService::new(self.config, self.client);
        let saved = artifacts
            .collect(&job.prompt_id, final_prompt, seed)
            .await?;

        Ok(RenderOutcome::Done(saved.len()))
    }
}

enum RenderOutcome {
    Done(usize),
    Cancelled,
}

// ========== 日志辅助函数 ==========

fn log_batch_start(base_prompt: &str, params: &BatchParams, enhancement: Option<&str>) {
    info!("\n{}", "=".repeat(60));
    info!("📦 新批次: {} 张, {}x{}", params.count, params.width, params.height);
    info!("📝 提示词: {}", truncate_text(base_prompt, 120));
    if let Some(instruction) = enhancement {
        info!("✨ 增强指令: {}", instruction);
    }
    info!("{}", "=".repeat(60));
}

fn log_progress_event(event: ProgressEvent) {
    match event {
        ProgressEvent::Queued { remaining } => {
            info!("⏳ 队列中，前方还有 {} 个任务", remaining);
        }
        ProgressEvent::NodeStarted { node_id } => {
            info!("▶️ 节点 {} 开始执行", node_id);
        }
        ProgressEvent::NodeFinished { node_id } => {
            info!("✓ 节点 {} 执行完毕", node_id);
        }
        ProgressEvent::Progress { value, max } => {
            info!("📊 进度: {}/{}", value, max);
        }
        ProgressEvent::Preview(data) => {
            info!("🖼️ 收到预览帧 ({} 字节)", data.len());
        }
        ProgressEvent::Completed => {
            info!("✅ 任务执行完成");
        }
    }
}

fn log_batch_complete(stats: &BatchStats) {
    info!("\n{}", "─".repeat(60));
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!(
        "✓ 批次完成: 成功 {}/{}, 失败 {}{}",
        stats.success,
        stats.total,
        stats.failed,
        if stats.cancelled { " (被取消)" } else { "" }
    );
    info!("{}", "─".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_params_full() {
        let (prompt, params) = parse_batch_params("a cat in a hat : x10,h832,w1216");
        assert_eq!(prompt, "a cat in a hat");
        assert_eq!(
            params,
            BatchParams {
                count: 10,
                height: 832,
                width: 1216
            }
        );
    }

    #[test]
    fn test_parse_batch_params_partial() {
        let (prompt, params) = parse_batch_params("a cat : x3");
        assert_eq!(prompt, "a cat");
        assert_eq!(params.count, 3);
        // 未指定的参数保持默认
        assert_eq!(params.height, 1024);
        assert_eq!(params.width, 1024);
    }

    #[test]
    fn test_parse_batch_params_non_ascii_segment_is_skipped() {
        // 参数段以多字节字符开头时不能崩溃，只忽略该段
        let (prompt, params) = parse_batch_params("a cat : x2,高832");
        assert_eq!(prompt, "a cat");
        assert_eq!(params.count, 2);
        assert_eq!(params.height, 1024);

        // 整段都是非 ASCII 也一样
        let (_, params) = parse_batch_params("一只猫 : x3,宽1216");
        assert_eq!(params.count, 3);
        assert_eq!(params.width, 1024);
    }

    #[test]
    fn test_parse_batch_params_plain_colon_is_not_params() {
        let input = "portrait of a hero: dramatic lighting";
        let (prompt, params) = parse_batch_params(input);
        assert_eq!(prompt, input);
        assert_eq!(params, BatchParams::default());
    }

    #[test]
    fn test_parse_batch_params_absent() {
        let (prompt, params) = parse_batch_params("just a prompt");
        assert_eq!(prompt, "just a prompt");
        assert_eq!(params, BatchParams::default());
    }

    #[test]
    fn test_split_enhancement() {
        let (base, instruction) = split_enhancement("a cat > make it epic");
        assert_eq!(base, "a cat");
        assert_eq!(instruction.as_deref(), Some("make it epic"));

        let (base, instruction) = split_enhancement("a plain cat");
        assert_eq!(base, "a plain cat");
        assert_eq!(instruction, None);
    }

    #[tokio::test]
    async fn test_phase_one_always_produces_count_slots() {
        use crate::clients::comfy_client::ComfyClient;
        use crate::services::progress_listener::StreamConnection;
        use async_trait::async_trait;
        use rand::SeedableRng;
        use std::sync::atomic::{AtomicUsize, Ordering};

        // 第二次增强调用失败，对应槽位应当留下失败标记
        struct FlakyEnhancer {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl PromptEnhancer for FlakyEnhancer {
            async fn enhance(&self, prompt: &str, _instruction: &str) -> Result<String> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 1 {
                    anyhow::bail!("增强服务暂时不可用");
                }
                Ok(format!("{} (enhanced)", prompt))
            }
        }

        struct UnreachableTransport;

        #[async_trait]
        impl StreamTransport for UnreachableTransport {
            async fn connect(
                &self,
                url: &str,
            ) -> std::result::Result<Box<dyn StreamConnection>, crate::error::StreamError>
            {
                Err(crate::error::StreamError::ClosedAbnormally {
                    reason: format!("测试中不应连接 {}", url),
                })
            }
        }

        let vars_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(vars_dir.path().join("animal.txt"), "cat\ndog\n").unwrap();

        let config = Config {
            vars_dir: vars_dir.path().to_string_lossy().into_owned(),
            ..Config::default()
        };
        let template = Workflow(Default::default());
        let client = ComfyClient::new(&config);
        let transport = UnreachableTransport;
        let enhancer = FlakyEnhancer {
            calls: AtomicUsize::new(0),
        };

        let processor = BatchProcessor::new(
            &config, &template, &client, &transport, Some(&enhancer), None,
        );

        let mut rng = StdRng::seed_from_u64(7);
        let slots = processor
            .resolve_all_slots("a __animal__", Some("make it epic"), 3, &mut rng)
            .await;

        // 永远恰好 N 个槽位，失败槽位留标记
        assert_eq!(slots.len(), 3);
        assert!(matches!(&slots[0], Slot::Ready { final_prompt } if final_prompt.ends_with("(enhanced)")));
        assert!(matches!(&slots[1], Slot::Failed { .. }));
        assert!(matches!(&slots[2], Slot::Ready { .. }));
    }

    #[tokio::test]
    async fn test_phase_two_renders_strictly_in_order() {
        use crate::clients::comfy_client::QueuedJob;
        use crate::error::{ApiError, AppError, AppResult, StreamError};
        use crate::services::progress_listener::{StreamConnection, StreamMessage};
        use async_trait::async_trait;
        use rand::SeedableRng;
        use serde_json::Value;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Mutex;

        // 记录每次后端调用的顺序；第 fail_submit_at 次提交失败
        struct RecordingBackend {
            calls: Mutex<Vec<String>>,
            fail_submit_at: usize,
            submits: AtomicUsize,
        }

        #[async_trait]
        impl ComfyApi for RecordingBackend {
            async fn submit(&self, _workflow: &Workflow) -> AppResult<QueuedJob> {
                let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
                self.calls.lock().unwrap().push(format!("submit {}", n));
                if n == self.fail_submit_at {
                    return Err(AppError::Api(ApiError::BadResponse {
                        endpoint: "/prompt".to_string(),
                        status: 500,
                        message: None,
                    }));
                }
                Ok(QueuedJob {
                    prompt_id: format!("p{}", n),
                    client_id: format!("c{}", n),
                })
            }

            async fn fetch_history(&self, prompt_id: &str) -> AppResult<Value> {
                self.calls
                    .lock()
                    .unwrap()
                    .push(format!("history {}", prompt_id));
                Ok(json!({ prompt_id: { "outputs": {} } }))
            }

            async fn fetch_view(
                &self,
                _filename: &str,
                _subfolder: &str,
                _file_type: &str,
            ) -> AppResult<Vec<u8>> {
                Ok(vec![])
            }
        }

        // 每次连接都立刻宣告任务完成
        struct CompletingTransport;

        struct OneShotConnection {
            sent: bool,
        }

        #[async_trait]
        impl StreamConnection for OneShotConnection {
            async fn next_message(
                &mut self,
            ) -> std::result::Result<Option<StreamMessage>, StreamError> {
                if self.sent {
                    return Ok(None);
                }
                self.sent = true;
                Ok(Some(StreamMessage::Text(
                    r#"{"type":"executing","data":{"node":null}}"#.to_string(),
                )))
            }
        }

        #[async_trait]
        impl StreamTransport for CompletingTransport {
            async fn connect(
                &self,
                _url: &str,
            ) -> std::result::Result<Box<dyn StreamConnection>, StreamError> {
                Ok(Box::new(OneShotConnection { sent: false }))
            }
        }

        let vars_dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            vars_dir: vars_dir.path().to_string_lossy().into_owned(),
            size_node_id: String::new(),
            ..Config::default()
        };
        let template = Workflow(Default::default());
        let backend = RecordingBackend {
            calls: Mutex::new(Vec::new()),
            fail_submit_at: 2,
            submits: AtomicUsize::new(0),
        };
        let transport = CompletingTransport;

        let processor =
            BatchProcessor::new(&config, &template, &backend, &transport, None, None);

        let mut rng = StdRng::seed_from_u64(11);
        let (_tx, mut cancel) = watch::channel(false);
        let stats = processor
            .run_batch("a cat : x3", &[], &mut rng, &mut cancel)
            .await
            .unwrap();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 1);
        assert!(!stats.cancelled);

        // 任务 N 走完提交→监听→历史之后，任务 N+1 才会被提交；
        // 中途失败的任务不拖垮批次，也不打乱后续顺序
        let calls = backend.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec!["submit 1", "history p1", "submit 2", "submit 3", "history p3"]
        );
    }

    #[test]
    fn test_params_after_enhancement() {
        // 参数段在增强指令之后：先剥参数，再分离增强指令
        let (prompt, params) = parse_batch_params("a cat > epic style : x5");
        assert_eq!(params.count, 5);
        let (base, instruction) = split_enhancement(&prompt);
        assert_eq!(base, "a cat");
        assert_eq!(instruction.as_deref(), Some("epic style"));
    }
}
