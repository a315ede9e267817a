//! 工作流变异 - 业务能力层
//!
//! 把提示词/种子/步数等角色参数和命令级覆盖项写入工作流副本。
//! 模板本身永远不被修改：每个任务拿到一份深拷贝，
//! 写入失败（节点或属性不存在）只告警跳过，不中断任务。

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::workflow::{Workflow, WorkflowOverride};

/// 工作流变异器
///
/// 角色参数的目标位置由配置给出，变异器只做路径读写。
pub struct WorkflowMutator<'a> {
    config: &'a Config,
}

impl<'a> WorkflowMutator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// 以模板为底，生成一份写好参数的任务专用工作流
    ///
    /// 写入顺序：提示词 → 种子 → 步数 → 命令级覆盖项（按顺序，后者覆盖前者）。
    pub fn prepare(
        &self,
        template: &Workflow,
        prompt_text: &str,
        seed: u32,
        steps: Option<u32>,
        overrides: &[WorkflowOverride],
    ) -> Workflow {
        let mut workflow = template.clone();

        self.write_role(
            &mut workflow,
            "提示词",
            &self.config.prompt_node_id,
            &self.config.prompt_node_property,
            Value::String(prompt_text.to_string()),
        );
        self.write_role(
            &mut workflow,
            "种子",
            &self.config.seed_node_id,
            &self.config.seed_node_property,
            Value::from(seed),
        );
        if let Some(steps) = steps {
            self.write_role(
                &mut workflow,
                "步数",
                &self.config.steps_node_id,
                &self.config.steps_node_property,
                Value::from(steps),
            );
        }

        for item in overrides {
            self.write_override(&mut workflow, item);
        }

        workflow
    }

    /// 写入单个角色参数
    ///
    /// 节点或属性缺失时告警跳过；属性必须已存在于节点 inputs 中，
    /// 避免把值写到工作流不认识的参数名下。
    fn write_role(
        &self,
        workflow: &mut Workflow,
        role: &str,
        node_id: &str,
        node_property: &str,
        value: Value,
    ) {
        if node_id.is_empty() {
            return;
        }

        let Some(node) = workflow.0.get_mut(node_id) else {
            warn!("⚠️ 工作流中找不到{}节点 '{}'，跳过写入", role, node_id);
            return;
        };

        if !node.inputs.contains_key(node_property) {
            warn!(
                "⚠️ {}节点 '{}' 没有属性 '{}'，跳过写入",
                role, node_id, node_property
            );
            return;
        }

        node.inputs.insert(node_property.to_string(), value);
        debug!("已写入{}: 节点 '{}' 属性 '{}'", role, node_id, node_property);
    }

    /// 应用一条命令级覆盖项
    ///
    /// 与角色参数不同，覆盖项允许写入节点尚不存在的属性名。
    fn write_override(&self, workflow: &mut Workflow, item: &WorkflowOverride) {
        let Some(node) = workflow.0.get_mut(&item.node_id) else {
            warn!("⚠️ 工作流中找不到节点 '{}'，覆盖项跳过", item.node_id);
            return;
        };

        node.inputs
            .insert(item.node_property.clone(), item.value.clone());
        debug!(
            "已应用覆盖项: 节点 '{}' 属性 '{}'",
            item.node_id, item.node_property
        );
    }
}
