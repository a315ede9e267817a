/// 程序配置文件
#[derive(Clone, Debug)]
pub struct Config {
    /// ComfyUI 服务地址
    pub comfy_host: String,
    /// ComfyUI 服务端口
    pub comfy_port: u16,
    /// 工作流 API 导出文件路径
    pub workflow_file: String,
    /// 提示词节点 ID
    pub prompt_node_id: String,
    /// 提示词节点属性名
    pub prompt_node_property: String,
    /// 步数节点 ID
    pub steps_node_id: String,
    /// 步数节点属性名
    pub steps_node_property: String,
    /// 种子节点 ID
    pub seed_node_id: String,
    /// 种子节点属性名
    pub seed_node_property: String,
    /// 尺寸节点 ID（latent 节点，宽高参数写入处；为空则跳过）
    pub size_node_id: String,
    /// 固定种子（设置后整批任务使用同一种子）
    pub fixed_seed: Option<u32>,
    /// 提示词变量文件存放目录
    pub vars_dir: String,
    /// 生成结果输出目录
    pub output_dir: String,
    /// 流式通道断线重连次数上限
    pub stream_retry_budget: u32,
    /// 重连退避基础秒数（每次翻倍）
    pub stream_backoff_base_secs: u64,
    /// 流式通道空闲超时秒数
    pub stream_idle_timeout_secs: u64,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            comfy_host: "127.0.0.1".to_string(),
            comfy_port: 8188,
            workflow_file: "workflow_api.json".to_string(),
            prompt_node_id: String::new(),
            prompt_node_property: "text".to_string(),
            steps_node_id: String::new(),
            steps_node_property: "steps".to_string(),
            seed_node_id: String::new(),
            seed_node_property: "seed".to_string(),
            size_node_id: String::new(),
            fixed_seed: None,
            vars_dir: "prompt_vars".to_string(),
            output_dir: "images".to_string(),
            stream_retry_budget: 3,
            stream_backoff_base_secs: 1,
            stream_idle_timeout_secs: 60,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            comfy_host: std::env::var("COMFYUI_HOST").unwrap_or(default.comfy_host),
            comfy_port: std::env::var("COMFYUI_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.comfy_port),
            workflow_file: std::env::var("COMFYUI_FILE_PATH").unwrap_or(default.workflow_file),
            prompt_node_id: std::env::var("COMFYUI_PROMPT_NODE_ID").unwrap_or(default.prompt_node_id),
            prompt_node_property: std::env::var("COMFYUI_PROMPT_NODE_PROPERTY").unwrap_or(default.prompt_node_property),
            steps_node_id: std::env::var("COMFYUI_STEPS_NODE_ID").unwrap_or(default.steps_node_id),
            steps_node_property: std::env::var("COMFYUI_STEPS_NODE_PROPERTY").unwrap_or(default.steps_node_property),
            seed_node_id: std::env::var("COMFYUI_SEED_NODE_ID").unwrap_or(default.seed_node_id),
            seed_node_property: std::env::var("COMFYUI_SEED_NODE_PROPERTY").unwrap_or(default.seed_node_property),
            size_node_id: std::env::var("COMFYUI_SIZE_NODE_ID").unwrap_or(default.size_node_id),
            fixed_seed: std::env::var("COMFYUI_FIXED_SEED").ok().and_then(|v| v.parse().ok()),
            vars_dir: std::env::var("PROMPT_VARS_DIR").unwrap_or(default.vars_dir),
            output_dir: std::env::var("OUTPUT_DIR").unwrap_or(default.output_dir),
            stream_retry_budget: std::env::var("STREAM_RETRY_BUDGET").ok().and_then(|v| v.parse().ok()).unwrap_or(default.stream_retry_budget),
            stream_backoff_base_secs: std::env::var("STREAM_BACKOFF_BASE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.stream_backoff_base_secs),
            stream_idle_timeout_secs: std::env::var("STREAM_IDLE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.stream_idle_timeout_secs),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
        }
    }

    /// HTTP 接口基础地址
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.comfy_host, self.comfy_port)
    }

    /// WebSocket 接口基础地址
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.comfy_host, self.comfy_port)
    }
}
