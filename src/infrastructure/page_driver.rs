//! 页面驱动抽象 - 基础设施层
//!
//! 上层只通过 `PageDriver` 操作页面：
//! - 元素以 `ElementRef`（选择器 + 序号 + 父元素）定位，每次操作时重新解析
//! - 等待条件统一由 [`wait_for`] 轮询实现，超时返回 `DriverError::Timeout`

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, Instant};

use crate::error::DriverError;

/// 元素定位
///
/// 不持有 DOM 句柄，页面重绘后依然可以重新解析。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef {
    pub selector: String,
    pub index: usize,
    pub parent: Option<Box<ElementRef>>,
}

impl ElementRef {
    pub fn new(selector: impl Into<String>, index: usize) -> Self {
        Self {
            selector: selector.into(),
            index,
            parent: None,
        }
    }

    pub fn within(parent: &ElementRef, selector: impl Into<String>, index: usize) -> Self {
        Self {
            selector: selector.into(),
            index,
            parent: Some(Box::new(parent.clone())),
        }
    }

    /// 从根到自身的定位链
    pub fn chain(&self) -> Vec<&ElementRef> {
        let mut chain = vec![self];
        let mut cur = self;
        while let Some(parent) = cur.parent.as_deref() {
            chain.push(parent);
            cur = parent;
        }
        chain.reverse();
        chain
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{} >> ", parent)?;
        }
        write!(f, "{}[{}]", self.selector, self.index)
    }
}

/// 等待条件
#[derive(Debug, Clone)]
pub enum WaitCondition {
    /// 选择器至少匹配一个元素
    Present(String),
    /// 选择器不再匹配任何元素
    Absent(String),
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Present(s) => write!(f, "出现 {}", s),
            WaitCondition::Absent(s) => write!(f, "消失 {}", s),
        }
    }
}

/// 浏览器页面能力
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// 统计父元素（None 表示整个文档）下匹配选择器的元素个数
    async fn count_within(
        &self,
        parent: Option<&ElementRef>,
        selector: &str,
    ) -> Result<usize, DriverError>;

    async fn read_text(&self, element: &ElementRef) -> Result<String, DriverError>;

    async fn read_attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, DriverError>;

    async fn inner_html(&self, element: &ElementRef) -> Result<String, DriverError>;

    /// 写入输入框并触发 input / change 事件
    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<(), DriverError>;

    async fn click(&self, element: &ElementRef) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// 执行任意脚本（可返回 Promise）
    async fn eval(&self, script: &str) -> Result<JsonValue, DriverError>;

    async fn locate_all(
        &self,
        parent: Option<&ElementRef>,
        selector: &str,
    ) -> Result<Vec<ElementRef>, DriverError> {
        let count = self.count_within(parent, selector).await?;
        Ok((0..count)
            .map(|i| match parent {
                Some(p) => ElementRef::within(p, selector, i),
                None => ElementRef::new(selector, i),
            })
            .collect())
    }

    /// 第一个匹配的元素
    async fn locate(&self, selector: &str) -> Result<Option<ElementRef>, DriverError> {
        let count = self.count_within(None, selector).await?;
        Ok((count > 0).then(|| ElementRef::new(selector, 0)))
    }
}

/// 选择器是否存在
pub async fn exists(driver: &dyn PageDriver, selector: &str) -> Result<bool, DriverError> {
    Ok(driver.count_within(None, selector).await? > 0)
}

async fn condition_met(driver: &dyn PageDriver, cond: &WaitCondition) -> Result<bool, DriverError> {
    match cond {
        WaitCondition::Present(sel) => exists(driver, sel).await,
        WaitCondition::Absent(sel) => Ok(!exists(driver, sel).await?),
    }
}

/// 轮询等待条件成立
///
/// # 参数
/// - `timeout`: 等待预算
/// - `poll`: 轮询间隔
///
/// # 返回
/// 超时返回 `DriverError::Timeout`；单次检查时的脚本错误视为"尚未满足"
pub async fn wait_for(
    driver: &dyn PageDriver,
    cond: &WaitCondition,
    timeout: Duration,
    poll: Duration,
) -> Result<(), DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(true) = condition_met(driver, cond).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Timeout {
                condition: cond.to_string(),
                timeout,
            });
        }
        sleep(poll).await;
    }
}

/// 元素存在时点击，返回是否点击了
pub async fn click_if_present(driver: &dyn PageDriver, selector: &str) -> Result<bool, DriverError> {
    match driver.locate(selector).await? {
        Some(el) => {
            driver.click(&el).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// 查找文本包含 `text` 的第一个元素
pub async fn locate_by_text(
    driver: &dyn PageDriver,
    selector: &str,
    text: &str,
) -> Result<Option<ElementRef>, DriverError> {
    for el in driver.locate_all(None, selector).await? {
        if driver.read_text(&el).await?.contains(text) {
            return Ok(Some(el));
        }
    }
    Ok(None)
}
