//! HTTP plumbing shared by the polling executors.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ExecError, ExecResult};

/// Send a request and decode its JSON body.
///
/// Statuses >= 400 become [`ExecError::Api`] carrying the body.
pub async fn send_json(request: RequestBuilder, budget: Duration) -> ExecResult<Value> {
    let response = timeout(budget, request.send())
        .await
        .map_err(|_| ExecError::Request("request timed out".to_string()))?
        .map_err(|e| ExecError::Request(e.to_string()))?;

    let status = response.status();
    let body = response.text().await.map_err(|e| ExecError::Request(e.to_string()))?;
    if status.as_u16() >= 400 {
        return Err(ExecError::Api { status: status.as_u16(), body });
    }
    serde_json::from_str(&body).map_err(|e| ExecError::Decode(e.to_string()))
}

/// Download `url` into a fresh temporary file.
///
/// The file is removed when the returned handle is dropped.
pub async fn download(
    client: &Client,
    url: &str,
    prefix: &str,
    suffix: &str,
    budget: Duration,
) -> ExecResult<NamedTempFile> {
    debug!(url, "Downloading artifact");
    let tmp = tempfile::Builder::new().prefix(prefix).suffix(suffix).tempfile()?;
    let mut out = tokio::fs::File::from_std(tmp.reopen()?);

    let fetch = async {
        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ExecError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExecError::Download(format!("HTTP {}", response.status())));
        }
        while let Some(chunk) =
            response.chunk().await.map_err(|e| ExecError::Download(e.to_string()))?
        {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok::<(), ExecError>(())
    };
    timeout(budget, fetch)
        .await
        .map_err(|_| ExecError::Download("download timed out".to_string()))??;
    Ok(tmp)
}

/// File extension of a URL path (with its dot), if short enough to be one.
///
/// Query and fragment are ignored; `max_len` counts the dot.
pub fn url_extension(url: &str, max_len: usize) -> Option<&str> {
    let path = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
    let idx = path.rfind('.')?;
    let ext = &path[idx..];
    (ext.len() > 1 && ext.len() <= max_len && !ext.contains('/')).then_some(ext)
}

/// Fill a query URL template: `%s` is replaced by the remote id, otherwise
/// the template is used verbatim.
pub fn fill_template(template: &str, remote_id: &str) -> String {
    if template.contains("%s") {
        template.replacen("%s", remote_id, 1)
    } else {
        template.to_string()
    }
}

/// Identifier rendered from a JSON string or number.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().map(|f| format!("{:.0}", f)),
        },
        _ => None,
    }
}

/// Non-empty string at `key`.
pub fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://cdn.x/v/abc.mp4", 5), Some(".mp4"));
        assert_eq!(url_extension("https://cdn.x/v/abc.png?sig=1.2", 5), Some(".png"));
        assert_eq!(url_extension("https://cdn.x/v/abc", 5), None);
        assert_eq!(url_extension("https://cdn.x/v/abc.longext", 5), None);
        assert_eq!(url_extension("https://cdn.example/file", 10), None);
    }

    #[test]
    fn test_fill_template() {
        assert_eq!(fill_template("https://api/q?id=%s", "X"), "https://api/q?id=X");
        assert_eq!(fill_template("https://api/status", "X"), "https://api/status");
    }

    #[test]
    fn test_id_string_accepts_numbers() {
        assert_eq!(id_string(&json!("abc")), Some("abc".to_string()));
        assert_eq!(id_string(&json!(12345)), Some("12345".to_string()));
        assert_eq!(id_string(&json!(1.0e3)), Some("1000".to_string()));
        assert_eq!(id_string(&json!("")), None);
        assert_eq!(id_string(&json!({"id": 1})), None);
    }
}
