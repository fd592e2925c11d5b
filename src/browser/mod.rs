//! 浏览器接入：连接已打开的浏览器，或自行启动无头浏览器

mod connection;
mod headless;

use anyhow::Result;
use chromiumoxide::{Browser, Page};

use crate::config::Config;

pub use connection::connect_to_browser_and_page;
pub use headless::launch_headless_browser;

/// 按配置获取浏览器：调试端口为 0 时启动无头浏览器
pub async fn open_browser(config: &Config) -> Result<(Browser, Page)> {
    if config.browser_debug_port == 0 {
        launch_headless_browser(&config.login_url, config.chrome_executable.as_deref()).await
    } else {
        connect_to_browser_and_page(config.browser_debug_port, &config.login_url).await
    }
}
