use anyhow::{Context, Result};
use auto_answer::models::RunTermination;
use auto_answer::utils::logging;
use auto_answer::{App, Config, Credentials};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load("automator.toml")?;

    // 初始化日志
    logging::init(config.verbose_logging);

    let credentials = Credentials::from_env().context("请设置 U_USERNAME 和 U_PASSWORD")?;

    // Ctrl-C 只在两题之间生效
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 收到 Ctrl-C，当前题目处理完后停止");
            signal.cancel();
        }
    });

    // 初始化并运行应用
    let report = App::initialize(config, credentials).await?.run(&cancel).await?;

    match report.termination() {
        RunTermination::AuthExhausted(reason) => {
            error!("❌ 登录失效: {}", reason);
            std::process::exit(2);
        }
        RunTermination::NavigationLost(reason) => {
            error!("❌ 导航失败: {}", reason);
            std::process::exit(3);
        }
        RunTermination::Completed | RunTermination::Cancelled => Ok(()),
    }
}
