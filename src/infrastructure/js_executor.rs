//! JS 执行器 - 基础设施层
//!
//! 持有唯一的 page 资源，通过注入脚本实现 `PageDriver`

use async_trait::async_trait;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::page_driver::{ElementRef, PageDriver};
use crate::error::DriverError;

/// JS 执行器
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 把元素定位翻译成 querySelectorAll 链
/// - 不认识 Question / Session
pub struct JsExecutor {
    page: Page,
}

/// 页面脚本统一返回 `{ ok, value }`，`ok = false` 表示元素不存在
#[derive(Debug, Deserialize)]
struct ScriptResult<T> {
    ok: bool,
    value: Option<T>,
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// 生成解析元素的 JS 表达式（找不到时为 null）
fn element_expr(element: &ElementRef) -> String {
    let mut body = String::from("let n = document;");
    for link in element.chain() {
        body.push_str(&format!(
            " n = n ? (n.querySelectorAll({})[{}] || null) : null;",
            js_str(&link.selector),
            link.index
        ));
    }
    format!("(() => {{ {} return n; }})()", body)
}

/// 在元素上执行一段脚本，`el` 为元素变量
fn with_element(element: &ElementRef, action: &str) -> String {
    format!(
        "(() => {{ const el = {}; if (!el) return {{ ok: false, value: null }}; {} }})()",
        element_expr(element),
        action
    )
}

impl JsExecutor {
    /// 创建新的 JS 执行器
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 执行 JS 代码并反序列化为指定类型
    ///
    /// # 参数
    /// - `js_code`: 要执行的 JavaScript 代码
    ///
    /// # 返回
    /// 返回反序列化后的类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: &str) -> Result<T, DriverError> {
        let json_value = self.eval(js_code).await?;
        let typed_value = serde_json::from_value(json_value)?;
        Ok(typed_value)
    }

    async fn on_element<T: DeserializeOwned>(
        &self,
        element: &ElementRef,
        action: &str,
    ) -> Result<Option<T>, DriverError> {
        let result: ScriptResult<T> = self.eval_as(&with_element(element, action)).await?;
        if !result.ok {
            return Err(DriverError::ElementNotFound(element.to_string()));
        }
        Ok(result.value)
    }
}

#[async_trait]
impl PageDriver for JsExecutor {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        debug!("导航到: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn count_within(
        &self,
        parent: Option<&ElementRef>,
        selector: &str,
    ) -> Result<usize, DriverError> {
        let scope = parent
            .map(element_expr)
            .unwrap_or_else(|| "document".to_string());
        let js = format!(
            "(() => {{ const p = {}; return p ? p.querySelectorAll({}).length : 0; }})()",
            scope,
            js_str(selector)
        );
        self.eval_as(&js).await
    }

    async fn read_text(&self, element: &ElementRef) -> Result<String, DriverError> {
        let text: Option<String> = self
            .on_element(
                element,
                "return { ok: true, value: (el.innerText || el.textContent || '').trim() };",
            )
            .await?;
        Ok(text.unwrap_or_default())
    }

    async fn read_attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let action = format!(
            "return {{ ok: true, value: el.getAttribute({}) }};",
            js_str(name)
        );
        self.on_element(element, &action).await
    }

    async fn inner_html(&self, element: &ElementRef) -> Result<String, DriverError> {
        let html: Option<String> = self
            .on_element(element, "return { ok: true, value: el.innerHTML };")
            .await?;
        Ok(html.unwrap_or_default())
    }

    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<(), DriverError> {
        // 直接赋值不会通知前端框架，需要走原生 setter 再派发事件
        let action = format!(
            r#"
            const proto = el instanceof HTMLTextAreaElement
                ? HTMLTextAreaElement.prototype
                : HTMLInputElement.prototype;
            const setter = Object.getOwnPropertyDescriptor(proto, 'value').set;
            el.focus();
            setter.call(el, {});
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            el.blur();
            return {{ ok: true, value: null }};
            "#,
            js_str(value)
        );
        self.on_element::<JsonValue>(element, &action).await?;
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<(), DriverError> {
        self.on_element::<JsonValue>(
            element,
            "el.scrollIntoView({ block: 'center' }); el.click(); return { ok: true, value: null };",
        )
        .await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn eval(&self, script: &str) -> Result<JsonValue, DriverError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(DriverError::Script)?;
        let result = self.page.evaluate_expression(params).await?;
        Ok(result.value().cloned().unwrap_or(JsonValue::Null))
    }
}
