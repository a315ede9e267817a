//! 变量仓库 - 业务能力层
//!
//! ## 职责
//!
//! - 持有一次解析过程内的变量缓存（生命周期 = 一次顶层解析）
//! - 提供两步式契约：`load` 只查找，缺失变量由调用方决定是否触发 `ensure_generated`
//! - 变量名的生成分类是纯字符串匹配，不访问网络

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::prompt_vars::{load_prompt_vars, save_prompt_var, PromptVar};

/// 生成指令的目标数量下限
pub const MIN_GENERATED_VALUES: usize = 20;

/// 缺失变量的生成分类
///
/// 决定交给生成协作方的指令模板：
/// 完整场景描述，还是可直接代入的短值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    /// 完整场景描述（如 `variations_of_a_cat`）
    FullScene,
    /// 单词或短语（如 `cat_breed`、`art_style`）
    ShortValue,
}

/// 表示"想要完整场景"的名称前缀族
const FULL_SCENE_PREFIXES: [&str; 5] = ["variation", "scene", "description", "prompt", "version"];

/// 表示"想要短值"的名称后缀族（优先级高于前缀族）
const SHORT_VALUE_SUFFIXES: [&str; 7] = [
    "_style", "_color", "_type", "_mood", "_artist", "_genre", "_setting",
];

/// 对变量名进行生成分类
///
/// 纯函数：确定、全映射，任何名字恰好落在一个分类里。
/// 未匹配任何模式的通用名字默认为短值。
pub fn classify_variable(name: &str) -> GenerationKind {
    let lower = name.to_lowercase();

    if SHORT_VALUE_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
        return GenerationKind::ShortValue;
    }

    let wants_full_scene = FULL_SCENE_PREFIXES.iter().any(|p| {
        lower.starts_with(p)
            || lower.contains(&format!("_{}", p))
            || lower.contains(&format!("{}_of", p))
    });

    if wants_full_scene {
        GenerationKind::FullScene
    } else {
        GenerationKind::ShortValue
    }
}

/// 生成协作方返回的新变量内容
#[derive(Debug, Clone)]
pub struct GeneratedVariable {
    pub description: String,
    pub values: Vec<String>,
}

/// 变量值生成协作方
///
/// 对本模块而言只是"发指令、收文本"的不透明能力，
/// 便于在测试中用脚本实现替换。
#[async_trait]
pub trait ValueGenerator: Send + Sync {
    /// 为缺失变量生成至少 [`MIN_GENERATED_VALUES`] 个候选值
    async fn generate_values(
        &self,
        kind: GenerationKind,
        variable_name: &str,
        context_prompt: &str,
    ) -> Result<GeneratedVariable>;
}

/// 变量仓库
///
/// 每次顶层解析创建一个新实例：同一轮内重复出现的占位符
/// 不会反复读盘，不同轮之间互不共享缓存。
pub struct VariableStore {
    vars_dir: PathBuf,
    cache: BTreeMap<String, PromptVar>,
}

impl VariableStore {
    /// 打开变量目录并加载全部条目
    pub fn open(vars_dir: impl Into<PathBuf>) -> Result<Self> {
        let vars_dir = vars_dir.into();
        let cache = load_prompt_vars(&vars_dir)?;
        Ok(Self { vars_dir, cache })
    }

    /// 查找变量，缺失时返回 None（不会触发生成）
    pub fn load(&self, name: &str) -> Option<&PromptVar> {
        self.cache.get(name)
    }

    /// 列出全部变量（用于自检/展示，不在编排热路径上）
    pub fn list_all(&self) -> Vec<&PromptVar> {
        self.cache.values().collect()
    }

    /// 重新扫描变量目录
    pub fn reload(&mut self) -> Result<()> {
        self.cache = load_prompt_vars(&self.vars_dir)?;
        Ok(())
    }

    /// 为缺失变量触发一次外部生成
    ///
    /// 生成成功后原子持久化为新的后备文件并放入缓存；
    /// 变量已存在时直接返回现有条目。
    pub async fn ensure_generated(
        &mut self,
        name: &str,
        context_prompt: &str,
        generator: &dyn ValueGenerator,
    ) -> Result<&PromptVar> {
        if self.cache.contains_key(name) {
            return Ok(&self.cache[name]);
        }

        let kind = classify_variable(name);
        info!("🤖 正在为缺失变量 __{}__ 生成候选值 (分类: {:?})...", name, kind);

        let generated = generator
            .generate_values(kind, name, context_prompt)
            .await?;

        if generated.values.is_empty() {
            anyhow::bail!("变量 {} 的生成结果为空", name);
        }
        if generated.values.len() < MIN_GENERATED_VALUES {
            warn!(
                "变量 {} 只生成了 {} 个候选值（期望至少 {} 个）",
                name,
                generated.values.len(),
                MIN_GENERATED_VALUES
            );
        }

        let file_path = save_prompt_var(
            &self.vars_dir,
            name,
            &generated.description,
            &generated.values,
        )?;
        info!(
            "✓ 变量 __{}__ 生成完成: {} 个候选值，已保存至 {}",
            name,
            generated.values.len(),
            file_path.display()
        );

        let var = PromptVar {
            name: name.to_string(),
            file_path,
            description: Some(generated.description),
            values: generated.values,
        };
        Ok(self.cache.entry(name.to_string()).or_insert(var))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_full_scene_prefixes() {
        assert_eq!(classify_variable("variations_of_a_cat"), GenerationKind::FullScene);
        assert_eq!(classify_variable("scene_of_battle"), GenerationKind::FullScene);
        assert_eq!(classify_variable("epic_scene"), GenerationKind::FullScene);
        assert_eq!(classify_variable("prompt_ideas"), GenerationKind::FullScene);
        assert_eq!(classify_variable("description_of_forest"), GenerationKind::FullScene);
    }

    #[test]
    fn test_classify_short_value_names() {
        assert_eq!(classify_variable("cat_breed"), GenerationKind::ShortValue);
        assert_eq!(classify_variable("emotion"), GenerationKind::ShortValue);
        assert_eq!(classify_variable("animals/dog_breed"), GenerationKind::ShortValue);
    }

    #[test]
    fn test_classify_suffix_overrides_prefix() {
        // 前缀匹配 full scene，但后缀族优先，判定为短值
        assert_eq!(classify_variable("prompt_style"), GenerationKind::ShortValue);
        assert_eq!(classify_variable("scene_color"), GenerationKind::ShortValue);
        assert_eq!(classify_variable("art_style"), GenerationKind::ShortValue);
    }

    struct FixedGenerator {
        values: Vec<String>,
    }

    #[async_trait]
    impl ValueGenerator for FixedGenerator {
        async fn generate_values(
            &self,
            _kind: GenerationKind,
            variable_name: &str,
            _context_prompt: &str,
        ) -> Result<GeneratedVariable> {
            Ok(GeneratedVariable {
                description: format!("Auto-generated values for {}", variable_name),
                values: self.values.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_ensure_generated_persists_and_caches() {
        let dir = TempDir::new().unwrap();
        let mut store = VariableStore::open(dir.path()).unwrap();
        assert!(store.load("fur_color").is_none());

        let generator = FixedGenerator {
            values: (0..20).map(|i| format!("color{}", i)).collect(),
        };
        let var = store
            .ensure_generated("fur_color", "a __fur_color__ cat", &generator)
            .await
            .unwrap();
        assert_eq!(var.values.len(), 20);

        // 缓存命中
        assert!(store.load("fur_color").is_some());
        // 后备文件落盘，新仓库也能读到
        let fresh = VariableStore::open(dir.path()).unwrap();
        assert_eq!(fresh.load("fur_color").unwrap().values.len(), 20);
    }

    #[test]
    fn test_reload_picks_up_new_files() {
        let dir = TempDir::new().unwrap();
        let mut store = VariableStore::open(dir.path()).unwrap();
        assert!(store.load("emotion").is_none());

        std::fs::write(dir.path().join("emotion.txt"), "joyful\nserene\n").unwrap();
        store.reload().unwrap();
        assert_eq!(store.load("emotion").unwrap().values.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_generated_rejects_empty_result() {
        let dir = TempDir::new().unwrap();
        let mut store = VariableStore::open(dir.path()).unwrap();
        let generator = FixedGenerator { values: vec![] };

        let result = store.ensure_generated("nothing", "", &generator).await;
        assert!(result.is_err());
        assert!(store.load("nothing").is_none());
    }
}
