//! ComfyUI 工作流模型
//!
//! 工作流是节点 ID 到节点定义的映射（API 导出格式）。
//! 节点类型是开放的字符串标签，参数按名称存放，
//! 变异只做路径读写，不关心具体节点语义。

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// 工作流节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowNode {
    /// 节点输入参数（参数名 → 值）
    pub inputs: BTreeMap<String, Value>,
    /// 节点类型标签
    pub class_type: String,
    /// 节点元信息（标题等），原样保留
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// ComfyUI 工作流（节点 ID → 节点定义）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Workflow(pub BTreeMap<String, WorkflowNode>);

impl Workflow {
    /// 从 API 导出的 JSON 文件加载工作流
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取工作流文件: {}", path.display()))?;

        let workflow: Workflow = serde_json::from_str(&content)
            .with_context(|| format!("无法解析工作流文件: {}", path.display()))?;

        info!("成功加载工作流: {} ({} 个节点)", path.display(), workflow.0.len());
        Ok(workflow)
    }

    /// 按节点 ID 查找节点
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.0.get(node_id)
    }

    /// 节点数量
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否为空工作流
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 工作流参数覆盖项
///
/// 由命令处理收集的 (节点, 属性, 值) 三元组，
/// 按顺序应用，同一 (节点, 属性) 后者覆盖前者。
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOverride {
    pub node_id: String,
    pub node_property: String,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_api_export_shape() {
        let raw = json!({
            "10": {
                "inputs": { "text": "a dog", "clip": ["4", 1] },
                "class_type": "CLIPTextEncode",
                "_meta": { "title": "Positive Prompt" }
            },
            "12": {
                "inputs": { "seed": 7, "steps": 20 },
                "class_type": "KSampler"
            }
        });

        let workflow: Workflow = serde_json::from_value(raw).unwrap();
        assert_eq!(workflow.len(), 2);
        assert_eq!(workflow.node("10").unwrap().class_type, "CLIPTextEncode");
        assert_eq!(workflow.node("12").unwrap().inputs["steps"], json!(20));
        assert!(workflow.node("99").is_none());
    }

    #[test]
    fn test_roundtrip_preserves_meta() {
        let raw = json!({
            "3": {
                "inputs": {},
                "class_type": "EmptyLatentImage",
                "_meta": { "title": "Latent" }
            }
        });

        let workflow: Workflow = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&workflow).unwrap();
        assert_eq!(back, raw);
    }
}
