pub mod js_executor;
pub mod page_driver;

pub use js_executor::JsExecutor;
pub use page_driver::{
    click_if_present, exists, locate_by_text, wait_for, ElementRef, PageDriver, WaitCondition,
};
