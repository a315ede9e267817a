use anyhow::Result;
use comfy_prompt_cli::app::App;
use comfy_prompt_cli::config::Config;
use comfy_prompt_cli::utils::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();

    // 提示词来自命令行参数
    let user_input = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if user_input.trim().is_empty() {
        anyhow::bail!("用法: comfy_prompt_cli \"<提示词> [> 增强指令] [: x<N>,h<H>,w<W>]\"");
    }

    // 初始化并运行应用
    let app = App::initialize(config).await?;
    let stats = app.run_batch(&user_input, &[]).await?;

    if stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
