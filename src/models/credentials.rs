use std::fmt;

use crate::error::AuthError;

/// 登录凭据
///
/// 两个字段对外不可见，`Debug` 输出会被遮蔽，不会出现在日志里。
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    account: String,
    secret: String,
}

impl Credentials {
    /// 校验后创建凭据
    ///
    /// 空值和 `.env` 模板里的占位值会被拒绝。
    pub fn new(account: impl Into<String>, secret: impl Into<String>) -> Result<Self, AuthError> {
        let account = account.into().trim().to_string();
        let secret = secret.into();
        if account.is_empty() || secret.is_empty() {
            return Err(AuthError::Rejected("用户名或密码为空".to_string()));
        }
        if is_placeholder(&account) || is_placeholder(&secret) {
            return Err(AuthError::Rejected("用户名或密码仍是模板占位值".to_string()));
        }
        Ok(Self { account, secret })
    }

    /// 从环境变量 `U_USERNAME` / `U_PASSWORD` 读取
    pub fn from_env() -> Result<Self, AuthError> {
        let account = std::env::var("U_USERNAME").unwrap_or_default();
        let secret = std::env::var("U_PASSWORD").unwrap_or_default();
        Self::new(account, secret)
    }

    pub(crate) fn account(&self) -> &str {
        &self.account
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

fn is_placeholder(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower.starts_with("your_") || lower.starts_with("<") || lower == "changeme"
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &"***")
            .field("secret", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let creds = Credentials::new("student01", "hunter2").unwrap();
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("student01"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_rejects_empty_and_placeholder() {
        assert!(Credentials::new("", "x").is_err());
        assert!(Credentials::new("a", "").is_err());
        assert!(Credentials::new("your_username", "pw").is_err());
        assert!(Credentials::new("  alice  ", "pw").is_ok());
    }
}
