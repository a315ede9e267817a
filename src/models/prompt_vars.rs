//! 提示词变量模型
//!
//! 变量库是一个目录树：每个 `.txt` 文件对应一个变量，
//! 子目录成为变量名的命名空间段（用 `/` 连接）。
//! 文件开头以 `#` 标记的行是变量描述，其余非空行按顺序作为候选值。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// 注释标记，行首出现即视为描述行
const COMMENT_MARKER: char = '#';

/// 变量文件扩展名
const VAR_FILE_EXT: &str = "txt";

/// 单个提示词变量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptVar {
    /// 变量名（含命名空间，如 `styles/art_style`）
    pub name: String,
    /// 来源文件路径
    pub file_path: PathBuf,
    /// 变量描述（来自文件开头的注释行）
    pub description: Option<String>,
    /// 候选值（顺序即文件行顺序，索引引用依赖此顺序）
    pub values: Vec<String>,
}

/// 从变量目录递归加载所有提示词变量
///
/// 无法解码的文件只记录警告并跳过，不会中断加载。
/// 目录不存在时返回空集合（变量库是可选的）。
pub fn load_prompt_vars(vars_dir: &Path) -> Result<BTreeMap<String, PromptVar>> {
    let mut vars = BTreeMap::new();

    if !vars_dir.exists() {
        debug!("变量目录不存在: {}", vars_dir.display());
        return Ok(vars);
    }

    collect_vars(vars_dir, vars_dir, &mut vars)?;
    debug!("共加载 {} 个提示词变量", vars.len());
    Ok(vars)
}

fn collect_vars(
    root: &Path,
    dir: &Path,
    vars: &mut BTreeMap<String, PromptVar>,
) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("无法读取变量目录: {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_vars(root, &path, vars)?;
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some(VAR_FILE_EXT) {
            continue;
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("读取变量文件失败 {}: {}", path.display(), e);
                continue;
            }
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!("变量文件不是有效的 UTF-8，跳过: {}", path.display());
                continue;
            }
        };

        let name = var_name_from_path(root, &path);
        let (description, values) = parse_var_file(&text);
        vars.insert(
            name.clone(),
            PromptVar {
                name,
                file_path: path,
                description,
                values,
            },
        );
    }

    Ok(())
}

/// 由文件相对路径推导变量名
///
/// 子目录作为命名空间段，统一用 `/` 连接（与操作系统路径分隔符无关）。
fn var_name_from_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if let Some(last) = segments.last_mut() {
        if let Some(stem) = Path::new(last).file_stem() {
            *last = stem.to_string_lossy().into_owned();
        }
    }
    segments.join("/")
}

/// 解析变量文件内容
///
/// 返回 (描述, 候选值列表)。空行跳过，行首注释只在文件开头计入描述。
fn parse_var_file(text: &str) -> (Option<String>, Vec<String>) {
    let mut description_lines = Vec::new();
    let mut values = Vec::new();
    let mut in_header = true;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if in_header && trimmed.starts_with(COMMENT_MARKER) {
            description_lines.push(trimmed.trim_start_matches(COMMENT_MARKER).trim().to_string());
            continue;
        }
        in_header = false;
        if trimmed.starts_with(COMMENT_MARKER) {
            // 正文中的注释行不作为候选值
            continue;
        }
        values.push(trimmed.to_string());
    }

    let description = if description_lines.is_empty() {
        None
    } else {
        Some(description_lines.join(" "))
    };
    (description, values)
}

/// 将变量持久化为新的后备文件
///
/// 先写同目录下的临时文件再原子重命名，保证并发读取方
/// 永远不会看到半写入的内容。返回最终文件路径。
pub fn save_prompt_var(
    vars_dir: &Path,
    name: &str,
    description: &str,
    values: &[String],
) -> Result<PathBuf> {
    let mut final_path = vars_dir.to_path_buf();
    for segment in name.split('/') {
        final_path.push(segment);
    }
    final_path.set_extension(VAR_FILE_EXT);

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("无法创建变量目录: {}", parent.display()))?;
    }

    let mut content = String::new();
    if !description.is_empty() {
        content.push_str(&format!("{} {}\n", COMMENT_MARKER, description));
    }
    for value in values {
        content.push_str(value);
        content.push('\n');
    }

    let tmp_path = final_path.with_extension("txt.tmp");
    fs::write(&tmp_path, &content)
        .with_context(|| format!("写入临时变量文件失败: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("重命名变量文件失败: {}", final_path.display()))?;

    debug!("变量 {} 已保存至 {}", name, final_path.display());
    Ok(final_path)
}
