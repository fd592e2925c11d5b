use anyhow::{Context, Result};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// 连接到已打开调试端口的浏览器并获取平台页面
///
/// # 参数
/// - `port`: 浏览器调试端口
/// - `login_url`: 平台入口；已有页面的地址与它同域时直接复用该页面
///
/// # 返回
/// 返回浏览器和要操作的页面
pub async fn connect_to_browser_and_page(port: u16, login_url: &str) -> Result<(Browser, Page)> {
    let browser_url = format!("http://localhost:{}", port);
    info!("🔗 正在连接到浏览器: {}", browser_url);

    let (browser, mut handler) = Browser::connect(&browser_url).await.map_err(|e| {
        error!("连接浏览器失败: {}", e);
        e
    })?;
    debug!("浏览器连接成功");

    // 在后台处理浏览器事件
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 等待浏览器状态同步
    sleep(tokio::time::Duration::from_millis(300)).await;

    let host = platform_host(login_url);
    let pages = browser.pages().await?;
    debug!("获取到 {} 个页面，查找 {} 的页面", pages.len(), host);
    for p in pages.iter() {
        if let Ok(Some(url)) = p.url().await {
            if !host.is_empty() && url.contains(host) {
                info!("✓ 复用已打开的平台页面: {}", url);
                return Ok((browser, p.clone()));
            }
        }
    }

    let page = browser
        .new_page(login_url)
        .await
        .with_context(|| format!("打开平台页面失败: {}", login_url))?;
    info!("已打开: {}", login_url);
    Ok((browser, page))
}

/// URL 中的主机部分
fn platform_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or_default()
}
