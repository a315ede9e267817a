//! 产物回收 - 业务能力层
//!
//! 任务完成后从执行历史中找出最终图像，逐个下载落盘，
//! 并为每张图写一个同名 `.txt` 记录最终提示词和种子。
//! 单个产物下载失败只告警跳过，不影响其余产物。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clients::comfy_client::ComfyApi;
use crate::config::Config;

/// 历史记录中的单个产物条目
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRef {
    pub filename: String,
    pub subfolder: String,
    pub file_type: String,
}

/// 产物回收服务
pub struct ArtifactService<'a> {
    client: &'a dyn ComfyApi,
    output_dir: PathBuf,
}

impl<'a> ArtifactService<'a> {
    pub fn new(config: &Config, client: &'a dyn ComfyApi) -> Self {
        Self {
            client,
            output_dir: PathBuf::from(&config.output_dir),
        }
    }

    /// 回收单个任务的全部产物
    ///
    /// # 参数
    /// - `prompt_id`: 任务 ID
    /// - `final_prompt`: 任务使用的最终提示词（写入同名 .txt）
    /// - `seed`: 任务使用的种子
    ///
    /// # 返回
    /// 返回成功保存的图像路径列表
    pub async fn collect(
        &self,
        prompt_id: &str,
        final_prompt: &str,
        seed: u32,
    ) -> Result<Vec<PathBuf>> {
        info!("🔍 查询任务 {} 的执行历史...", prompt_id);
        let history = self.client.fetch_history(prompt_id).await?;

        let artifacts = extract_artifacts(&history, prompt_id);
        if artifacts.is_empty() {
            warn!("任务 {} 的历史中没有找到任何产物", prompt_id);
            return Ok(vec![]);
        }
        debug!("历史中共找到 {} 个产物条目", artifacts.len());

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("无法创建输出目录: {}", self.output_dir.display()))?;

        let mut saved = Vec::new();
        for artifact in &artifacts {
            match self.download_one(artifact).await {
                Ok(path) => {
                    info!("✓ 产物已保存: {}", path.display());
                    if let Err(e) = self.write_companion(&path, final_prompt, seed) {
                        warn!("⚠️ 无法写入提示词记录 ({}): {}", path.display(), e);
                    }
                    saved.push(path);
                }
                Err(e) => {
                    warn!("⚠️ 产物 {} 下载失败，跳过: {}", artifact.filename, e);
                }
            }
        }

        if saved.is_empty() {
            warn!("任务 {} 的产物全部下载失败", prompt_id);
        }
        Ok(saved)
    }

    /// 下载并原子落盘单个产物
    async fn download_one(&self, artifact: &ArtifactRef) -> Result<PathBuf> {
        debug!("下载产物: {}", artifact.filename);
        let bytes = self
            .client
            .fetch_view(&artifact.filename, &artifact.subfolder, &artifact.file_type)
            .await?;

        let final_path = self.output_dir.join(&artifact.filename);
        let tmp_path = self.output_dir.join(format!("{}.tmp", artifact.filename));

        std::fs::write(&tmp_path, &bytes)
            .with_context(|| format!("无法写入临时文件: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("无法落盘产物: {}", final_path.display()))?;

        debug!("产物落盘完成: {} ({} 字节)", final_path.display(), bytes.len());
        Ok(final_path)
    }

    /// 为图像写同名 .txt，记录最终提示词和种子
    fn write_companion(&self, image_path: &Path, final_prompt: &str, seed: u32) -> Result<()> {
        let txt_path = image_path.with_extension("txt");
        let content = format!("{}\nSeed: {}\n", final_prompt, seed);
        std::fs::write(&txt_path, content)
            .with_context(|| format!("无法写入提示词记录: {}", txt_path.display()))?;
        debug!("提示词记录已保存: {}", txt_path.display());
        Ok(())
    }
}

/// 从历史记录中提取产物条目
///
/// 历史外层以任务 ID 为键；每个输出节点的 `images` 数组
/// 都参与提取，缺文件名的条目跳过。
pub fn extract_artifacts(history: &Value, prompt_id: &str) -> Vec<ArtifactRef> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|h| h.get("outputs"))
        .and_then(|o| o.as_object())
    else {
        return vec![];
    };

    let mut artifacts = Vec::new();
    for (node_id, node_output) in outputs {
        let Some(images) = node_output.get("images").and_then(|i| i.as_array()) else {
            continue;
        };
        for image in images {
            let Some(filename) = image.get("filename").and_then(|v| v.as_str()) else {
                warn!("节点 {} 的产物缺少文件名，跳过", node_id);
                continue;
            };
            artifacts.push(ArtifactRef {
                filename: filename.to_string(),
                subfolder: image
                    .get("subfolder")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                file_type: image
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("output")
                    .to_string(),
            });
        }
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_artifacts_from_history() {
        let history = json!({
            "p1": {
                "outputs": {
                    "9": {
                        "images": [
                            { "filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output" },
                            { "filename": "ComfyUI_00002_.png", "subfolder": "batch", "type": "output" }
                        ]
                    },
                    "14": {
                        "text": ["not an image output"]
                    }
                }
            }
        });

        let artifacts = extract_artifacts(&history, "p1");
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].filename, "ComfyUI_00001_.png");
        assert_eq!(artifacts[1].subfolder, "batch");
        assert_eq!(artifacts[1].file_type, "output");
    }

    #[test]
    fn test_extract_artifacts_skips_missing_filename() {
        let history = json!({
            "p1": {
                "outputs": {
                    "9": {
                        "images": [
                            { "subfolder": "", "type": "output" },
                            { "filename": "good.png" }
                        ]
                    }
                }
            }
        });

        let artifacts = extract_artifacts(&history, "p1");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "good.png");
        // 缺省字段有默认值
        assert_eq!(artifacts[0].subfolder, "");
        assert_eq!(artifacts[0].file_type, "output");
    }

    #[test]
    fn test_extract_artifacts_unknown_prompt_id() {
        let history = json!({ "other": { "outputs": {} } });
        assert!(extract_artifacts(&history, "p1").is_empty());
    }
}
