//! 占位符解析器 - 业务能力层
//!
//! ## 职责
//!
//! 把自由文本中的 `__变量名__` / `__变量名:索引__` 占位符替换为具体值：
//!
//! 1. 扫描文本中的全部占位符
//! 2. 逐个独立解析（同名占位符多次出现会得到各自独立的随机值）
//! 3. 替换后重新扫描结果（值本身可能引入新的占位符），迭代有上限
//! 4. 缺失变量先尝试一次外部生成，失败则原样保留
//!
//! 随机状态由调用方显式传入，便于确定性回放与统计性测试。

use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::services::variable_store::{ValueGenerator, VariableStore};

/// 迭代上限，保证嵌套（甚至成环）引用也能终止
pub const MAX_ITERATIONS: usize = 5;

/// 占位符文法：`__name__` 或 `__name:INDEX__`，name 可含 `/` 命名空间
const TOKEN_PATTERN: &str = r"__([A-Za-z0-9_\-/]+?)(?::(\d+))?__";

/// 一次占位符替换的记录（用于可复现日志）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    /// 变量名
    pub name: String,
    /// 选中的值
    pub value: String,
    /// 选中值在序列中的索引
    pub index: usize,
}

/// 解析结果：最终文本加替换记录
#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub text: String,
    pub substitutions: Vec<Substitution>,
}

impl ResolvedPrompt {
    /// 是否仍残留未解析的占位符
    pub fn has_unresolved_tokens(&self) -> bool {
        Regex::new(TOKEN_PATTERN).map(|re| re.is_match(&self.text)).unwrap_or(false)
    }
}

/// 占位符解析器
///
/// 每次顶层解析创建一个实例，持有本轮的变量仓库缓存。
/// 无共享可变状态，不同任务的解析互不干扰。
pub struct TokenResolver<'a> {
    store: &'a mut VariableStore,
    generator: Option<&'a dyn ValueGenerator>,
    pattern: Regex,
}

/// 单个占位符出现
struct TokenOccurrence {
    /// 原文中的完整占位符（如 `__art_style:2__`）
    literal: String,
    name: String,
    index: Option<usize>,
}

impl<'a> TokenResolver<'a> {
    pub fn new(store: &'a mut VariableStore, generator: Option<&'a dyn ValueGenerator>) -> Self {
        Self {
            store,
            generator,
            // 文法是常量，编译失败属于程序缺陷
            pattern: Regex::new(TOKEN_PATTERN).expect("占位符正则无效"),
        }
    }

    /// 解析文本中的全部占位符
    ///
    /// 不含占位符的文本原样返回；无法解析的占位符保留字面量，
    /// 永远不会因缺失变量而报错。
    pub async fn resolve(&mut self, text: &str, rng: &mut StdRng) -> Result<ResolvedPrompt> {
        let mut current = text.to_string();
        let mut substitutions = Vec::new();
        // 每个缺失变量在一次顶层解析中只尝试生成一次
        let mut generation_attempted: Vec<String> = Vec::new();

        for iteration in 0..MAX_ITERATIONS {
            let occurrences = self.scan(&current);
            if occurrences.is_empty() {
                return Ok(ResolvedPrompt { text: current, substitutions });
            }

            let mut made_substitution = false;

            for occurrence in occurrences {
                if self.store.load(&occurrence.name).is_none() {
                    self.try_generate(&occurrence.name, &current, &mut generation_attempted)
                        .await;
                }

                let Some(var) = self.store.load(&occurrence.name) else {
                    warn!("未知变量 __{}__，保留原文", occurrence.name);
                    continue;
                };
                if var.values.is_empty() {
                    warn!("变量 __{}__ 没有候选值，保留原文", occurrence.name);
                    continue;
                }

                // 索引在解析时校验，序列可能在两次调用之间因重新生成而变化
                let chosen_index = match occurrence.index {
                    Some(index) if index < var.values.len() => index,
                    Some(index) => {
                        warn!(
                            "变量 __{}__ 的索引 {} 超出范围 (共 {} 个值)，保留原文",
                            occurrence.name,
                            index,
                            var.values.len()
                        );
                        continue;
                    }
                    None => rng.gen_range(0..var.values.len()),
                };

                let value = var.values[chosen_index].clone();
                debug!(
                    "替换 {} → {} (索引 {})",
                    occurrence.literal, value, chosen_index
                );
                current = current.replacen(&occurrence.literal, &value, 1);
                substitutions.push(Substitution {
                    name: occurrence.name,
                    value,
                    index: chosen_index,
                });
                made_substitution = true;
            }

            // 本轮没有任何替换（全部无法解析），继续迭代不会有进展
            if !made_substitution {
                debug!("第 {} 轮无替换，提前结束", iteration + 1);
                break;
            }
        }

        if self.pattern.is_match(&current) {
            warn!("达到迭代上限 {}，剩余占位符保留原文", MAX_ITERATIONS);
        }

        Ok(ResolvedPrompt { text: current, substitutions })
    }

    /// 扫描一轮文本中的全部占位符出现
    fn scan(&self, text: &str) -> Vec<TokenOccurrence> {
        self.pattern
            .captures_iter(text)
            .map(|caps| TokenOccurrence {
                literal: caps[0].to_string(),
                name: caps[1].to_string(),
                index: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            })
            .collect()
    }

    /// 对缺失变量尝试一次外部生成
    ///
    /// 生成失败只记录警告：调用方随后会把占位符保留为字面量。
    async fn try_generate(&mut self, name: &str, context: &str, attempted: &mut Vec<String>) {
        let Some(generator) = self.generator else {
            return;
        };
        if attempted.iter().any(|n| n == name) {
            return;
        }
        attempted.push(name.to_string());

        if let Err(e) = self.store.ensure_generated(name, context, generator).await {
            warn!("变量 __{}__ 生成失败: {}", name, e);
        }
    }
}
