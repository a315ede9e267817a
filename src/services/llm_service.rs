//! LLM 服务 - 业务能力层
//!
//! 只负责"发指令、收文本"的生成能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use anyhow::Result;
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::services::variable_store::{
    GeneratedVariable, GenerationKind, ValueGenerator, MIN_GENERATED_VALUES,
};

/// 提示词增强协作方
///
/// 输入自由文本指令，输出增强后的提示词。
#[async_trait]
pub trait PromptEnhancer: Send + Sync {
    async fn enhance(&self, prompt: &str, instruction: &str) -> Result<String>;
}

/// LLM 服务
///
/// 职责：
/// - 提供通用的 LLM 调用接口
/// - 提示词增强
/// - 为缺失变量生成候选值列表
/// - 不出现批次/任务概念，不关心流程顺序
pub struct LlmService {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        let client = Client::with_config(openai_config);

        Self {
            client,
            model_name: config.llm_model_name.clone(),
        }
    }

    /// 通用的 LLM 调用函数
    ///
    /// 这是最基础的 LLM 调用接口，其他所有 LLM 相关功能都基于此函数。
    ///
    /// # 参数
    /// - `user_message`: 用户消息内容
    /// - `system_message`: 系统消息（可选）
    ///
    /// # 返回
    /// 返回 LLM 的响应内容（字符串）
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: Option<&str>,
    ) -> Result<String> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let mut messages = Vec::new();

        if let Some(sys_msg) = system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.8)
            .max_tokens(4096u32)
            .build()?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            anyhow::anyhow!("LLM API 调用失败: {}", e)
        })?;

        debug!("LLM API 调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("LLM 返回内容为空"))?;

        Ok(content.trim().to_string())
    }

    /// 构建变量值生成指令
    ///
    /// 根据分类选择指令模板：完整场景描述或可代入的短值。
    fn build_generation_prompt(
        kind: GenerationKind,
        variable_name: &str,
        context_prompt: &str,
    ) -> String {
        match kind {
            GenerationKind::FullScene => format!(
                r#"Generate {count} diverse, creative COMPLETE SCENE DESCRIPTIONS for use in image generation.

The variable name "{name}" suggests you should create full, detailed scene descriptions.
Context prompt: "{context}"

Requirements:
- Each value should be a COMPLETE, standalone image generation prompt
- Include rich visual details: lighting, atmosphere, composition, style
- Make each variation distinctly different from the others
- Values should be 1-3 sentences each, painting a vivid picture
- Return ONLY a valid JSON array of strings

JSON array:"#,
                count = MIN_GENERATED_VALUES,
                name = variable_name,
                context = context_prompt
            ),
            GenerationKind::ShortValue => format!(
                r#"Generate a list of {count} diverse values for the variable "{name}".

This variable will be substituted into this image generation prompt: "{context}"
The variable __{name}__ should be REPLACED by each value you generate.

Requirements:
- Values should be specific nouns, adjectives, or short phrases
- Include both common and unique/interesting options
- Each value should grammatically fit when substituted into the prompt
- Return ONLY a valid JSON array of strings

Examples:
- For "cat_breed": ["Persian", "Siamese", "Maine Coon", "Bengal"]
- For "art_style": ["impressionist", "cyberpunk", "watercolor", "art nouveau"]
- For "emotion": ["joyful", "melancholic", "serene", "fierce"]

JSON array:"#,
                count = MIN_GENERATED_VALUES,
                name = variable_name,
                context = context_prompt
            ),
        }
    }

    /// 解析候选值响应
    ///
    /// 优先按 JSON 字符串数组解析，失败时逐行兜底解析。
    fn parse_values_response(&self, response: &str) -> Result<Vec<String>> {
        // 尝试提取 JSON 数组
        if let (Some(start), Some(end)) = (response.find('['), response.rfind(']')) {
            if end > start {
                let json_str = &response[start..=end];
                if let Ok(values) = serde_json::from_str::<Vec<String>>(json_str) {
                    if !values.is_empty() {
                        return Ok(values);
                    }
                }
            }
        }

        // 兜底：逐行解析
        warn!("无法按 JSON 解析候选值，尝试逐行解析");
        let lines: Vec<String> = response
            .lines()
            .map(|line| {
                line.trim()
                    .trim_start_matches('-')
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'' || c == ',')
                    .to_string()
            })
            .filter(|line| {
                !line.is_empty() && !line.starts_with('[') && !line.starts_with(']')
            })
            .collect();

        if lines.len() >= MIN_GENERATED_VALUES / 2 {
            return Ok(lines);
        }

        let preview: String = response.chars().take(80).collect();
        anyhow::bail!("无法从 LLM 响应中解析候选值列表 (响应: {})", preview)
    }
}

#[async_trait]
impl ValueGenerator for LlmService {
    async fn generate_values(
        &self,
        kind: GenerationKind,
        variable_name: &str,
        context_prompt: &str,
    ) -> Result<GeneratedVariable> {
        debug!("为变量 {} 生成候选值，分类: {:?}", variable_name, kind);

        let prompt = Self::build_generation_prompt(kind, variable_name, context_prompt);
        let response = self.send_to_llm(&prompt, None).await?;
        let mut values = self.parse_values_response(&response)?;

        // 多余的候选值保留少量备用，避免响应过长
        values.truncate(MIN_GENERATED_VALUES + 10);

        Ok(GeneratedVariable {
            description: format!("Auto-generated values for {}", variable_name),
            values,
        })
    }
}

#[async_trait]
impl PromptEnhancer for LlmService {
    async fn enhance(&self, prompt: &str, instruction: &str) -> Result<String> {
        let system_message = "You are an expert prompt engineer for image generation models. \
Your task is to enhance the user's prompt to create more detailed, vivid, and visually \
compelling descriptions that will produce stunning images.\n\nRules:\n\
- Add specific details about lighting, atmosphere, style, and composition\n\
- Maintain the core intent of the original prompt\n\
- Keep the enhanced prompt concise but descriptive\n\
- Output ONLY the enhanced prompt, nothing else";

        let user_message = if instruction.is_empty() {
            format!("Original prompt: {}\n\nEnhanced prompt:", prompt)
        } else {
            format!(
                "Original prompt: {}\nAdditional instructions: {}\n\nEnhanced prompt:",
                prompt, instruction
            )
        };

        self.send_to_llm(&user_message, Some(system_message)).await
    }
}
