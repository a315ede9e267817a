use std::path::Path;

use comfy_prompt_cli::clients::ComfyClient;
use comfy_prompt_cli::config::Config;
use comfy_prompt_cli::models::Workflow;
use comfy_prompt_cli::services::VariableStore;
use comfy_prompt_cli::utils::logging;
use comfy_prompt_cli::App;

#[tokio::test]
#[ignore] // 默认忽略，需要手动运行：cargo test -- --ignored
async fn test_run_single_batch() {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();

    // 初始化应用（连通性检查 + 加载工作流模板）
    let app = App::initialize(config)
        .await
        .expect("初始化应用失败，请确认 ComfyUI 已启动且工作流文件存在");

    // 运行一个小批次
    let stats = app
        .run_batch("a __art_style__ painting of a cat : x2", &[])
        .await
        .expect("批次运行失败");

    println!("批次统计: {:?}", stats);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.failed, 0, "批次中不应有失败任务");
}

#[tokio::test]
#[ignore]
async fn test_comfyui_connection() {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();

    // 测试 ComfyUI 连通性
    let client = ComfyClient::new(&config);
    let reachable = client.check_connection().await;

    assert!(reachable, "应该能够连接 ComfyUI");
}

#[tokio::test]
#[ignore]
async fn test_load_workflow_template() {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();

    // 测试加载工作流模板
    let workflow = Workflow::load(Path::new(&config.workflow_file))
        .expect("应该能够加载工作流模板");

    println!("工作流包含 {} 个节点", workflow.len());
    assert!(!workflow.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_load_prompt_vars() {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();

    // 测试加载提示词变量目录
    let store = VariableStore::open(&config.vars_dir).expect("应该能够打开变量目录");

    let vars = store.list_all();
    println!("找到 {} 个提示词变量", vars.len());
    for var in vars {
        println!("  __{}__: {} 个候选值", var.name, var.values.len());
    }
}
