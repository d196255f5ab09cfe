//! Cache key layout and TTLs.
//!
//! Every write of the underlying object must delete its key.

use std::time::Duration;

/// Account snapshot TTL.
pub const USER_TTL: Duration = Duration::from_secs(60 * 60);
/// Model parameter TTL.
pub const MODEL_PARAMS_TTL: Duration = Duration::from_secs(60 * 60);
/// Prompt template TTL.
pub const PROMPT_CODE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Public template list TTL.
pub const TEMPLATES_PUBLIC_TTL: Duration = Duration::from_secs(60 * 60);

/// Public template list key.
pub const TEMPLATES_PUBLIC: &str = "templates:public";

/// `user:<id>`
pub fn user(id: i64) -> String {
    format!("user:{}", id)
}

/// `model_params:<id>`
pub fn model_params(id: i64) -> String {
    format!("model_params:{}", id)
}

/// `prompt:code:<code>`
pub fn prompt_code(code: &str) -> String {
    format!("prompt:code:{}", code)
}

/// `denylist:<token>`
pub fn denylist(token: &str) -> String {
    format!("denylist:{}", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(user(42), "user:42");
        assert_eq!(model_params(7), "model_params:7");
        assert_eq!(prompt_code("sunset"), "prompt:code:sunset");
        assert_eq!(denylist("abc.def"), "denylist:abc.def");
    }
}
