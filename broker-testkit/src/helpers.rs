//! Seeding and waiting helpers.

use std::future::Future;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::json;

use broker_domain::{Account, AiModel, ModelId, NewAccount, NewModel, TaskInput};
use broker_store::Store;

use crate::Result;

/// Create an active user account with the given balance and credit line.
pub async fn seed_account(
    store: &dyn Store,
    username: &str,
    balance: Decimal,
    credit_limit: Decimal,
) -> Result<Account> {
    let account = NewAccount::user(username, balance, credit_limit).with_password("password");
    Ok(store.accounts().create(&account).await?)
}

/// Register an open model.
pub async fn seed_model(store: &dyn Store, name: &str, url: &str, price: Decimal) -> Result<AiModel> {
    Ok(store.models().create(&NewModel::open(name, url, price)).await?)
}

/// Input routed to the vendor executor.
pub fn vendor_input(model_id: ModelId, model_url: &str, query_url_template: &str) -> TaskInput {
    let mut model = json!({ "model_url": model_url });
    if !query_url_template.is_empty() {
        model["query_url_template"] = json!(query_url_template);
    }
    let value = json!({
        "model_id": model_id,
        "model": model,
        "data": { "prompt": "a cat surfing a wave", "duration": 5 }
    });
    TaskInput::from_value(&value).unwrap_or_else(|e| panic!("invalid vendor input: {e}"))
}

/// Input routed to the simulated executor.
pub fn simulated_input(model_id: ModelId, prompt: &str) -> TaskInput {
    TaskInput::from_value(&json!({ "model_id": model_id, "prompt": prompt }))
        .unwrap_or_else(|e| panic!("invalid simulated input: {e}"))
}

/// Poll `check` every 10ms until it yields `Some`, failing after `within`.
pub async fn eventually<T, F, Fut>(within: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", within);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
