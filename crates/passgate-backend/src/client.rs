//! The backend HTTP client.

use crate::dialect;
use passgate_core::{Config, Error, KpoResult, LockerInfo, Result, TagType};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1) AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/39.0.2171.99 Safari/537.36";

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub result: KpoResult,
    pub message: String,
}

/// One client per backend base URL; every call retries per configuration
/// and carries an explicit deadline.
pub struct BackendClient {
    cfg: Arc<Config>,
    http: reqwest::Client,
}

impl BackendClient {
    /// Build the client.
    ///
    /// # Errors
    /// Returns `Error::Config` when an extra header is malformed or the
    /// HTTP client cannot be constructed.
    pub fn new(cfg: Arc<Config>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::HOST,
            HeaderValue::from_str(&cfg.service_name)
                .map_err(|e| Error::Config(format!("service_name: {e}")))?,
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("close"),
        );
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=0"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("ru-RU,ru;q=0.8,en-US;q=0.6,en;q=0.4"),
        );
        for header in &cfg.service_request_extra_headers {
            let (name, value) = parse_header(header)?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs_f64(cfg.service_request_expire_time))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        Ok(BackendClient { cfg, http })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.cfg.service_name, path)
    }

    /// GET with the configured retry policy. Transport failures after the
    /// last attempt surface as `Error::Backend`.
    async fn get(&self, path: &str) -> Result<(StatusCode, Option<Value>)> {
        let url = self.url(path);
        let attempts = self.cfg.http_request_retry_count + 1;
        let mut last_err = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs_f64(self.cfg.http_request_retry_delay))
                    .await;
                debug!(url = %url, attempt, "backend retry");
            }
            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.bytes().await.unwrap_or_default();
                    let json = serde_json::from_slice::<Value>(&body).ok();
                    return Ok((status, json));
                }
                Err(e) => {
                    last_err = e.to_string();
                }
            }
        }
        Err(Error::Backend(format!(
            "{url} failed after {attempts} attempts: {last_err}"
        )))
    }

    /// Ask the backend whether `uid` may pass at `terminal_id`.
    ///
    /// A 500 is a hard deny with the configured denied message; a 2xx
    /// whose body cannot be interpreted counts as granted with the fixed
    /// message. Transport failures propagate for the session machinery
    /// to degrade on.
    ///
    /// # Errors
    /// `Error::Backend` on network failure after retries.
    pub async fn check_access(
        &self,
        uid: &str,
        terminal_id: &str,
        tag_type: TagType,
        lockers: &[LockerInfo],
        role: Option<&str>,
    ) -> Result<AccessDecision> {
        let path = dialect::check_path(&self.cfg, terminal_id, uid, tag_type, lockers, role);
        let (status, body) = self.get(&path).await?;

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return Ok(AccessDecision {
                result: KpoResult::No,
                message: self.cfg.service_denied_msg.clone(),
            });
        }

        let mut decision = interpret_grant(body.as_ref()).unwrap_or(AccessDecision {
            result: KpoResult::Yes,
            message: String::new(),
        });
        if decision.message.is_empty() {
            decision.message = if decision.result == KpoResult::Yes {
                self.cfg.service_fixed_msg.clone()
            } else {
                self.cfg.service_denied_msg.clone()
            };
        }
        Ok(decision)
    }

    /// Report a completed pass.
    ///
    /// # Errors
    /// `Error::Backend` on network failure or a non-2xx status.
    pub async fn report_event(
        &self,
        uid: &str,
        terminal_id: &str,
        granted: bool,
        tag_type: TagType,
        role: Option<&str>,
    ) -> Result<()> {
        let path = dialect::event_path(&self.cfg, terminal_id, uid, granted, tag_type, role);
        let (status, _) = self.get(&path).await?;
        if !status.is_success() {
            return Err(Error::BackendStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Resolve the client id (the face server's person id) for a UID.
    /// Returns `None` when the backend knows no CID.
    ///
    /// # Errors
    /// `Error::Backend` on network failure after retries.
    pub async fn client_id(&self, uid: &str) -> Result<Option<String>> {
        let path = dialect::uid_path(&self.cfg, uid);
        let (status, body) = self.get(&path).await?;
        if !status.is_success() {
            return Ok(None);
        }
        Ok(body.as_ref().and_then(extract_cid))
    }

    /// Fetch the terminal list. The three observed response shapes are
    /// accepted: `{"terminals": [...]}`, `{"DEVICES": [...]}`, and a bare
    /// array. Keys are upper-cased.
    ///
    /// # Errors
    /// `Error::Backend` on network failure or an unrecognised body.
    pub async fn terminal_list(&self) -> Result<Vec<serde_json::Map<String, Value>>> {
        let path = self.cfg.termlist_path.clone();
        let (status, body) = self.get(&path).await?;
        if !status.is_success() {
            return Err(Error::BackendStatus {
                status: status.as_u16(),
            });
        }

        let Some(body) = body else {
            return Err(Error::Backend("terminal list: empty body".to_string()));
        };
        let items = body
            .get("terminals")
            .or_else(|| body.get("DEVICES"))
            .and_then(Value::as_array)
            .cloned()
            .or_else(|| body.as_array().cloned())
            .ok_or_else(|| Error::Backend("terminal list: no terminals array".to_string()))?;

        let mut result = Vec::with_capacity(items.len());
        for item in items {
            let Value::Object(obj) = item else {
                warn!("terminal list entry is not an object");
                continue;
            };
            let mut normalized = serde_json::Map::new();
            for (k, v) in obj {
                normalized.insert(k.to_uppercase(), v);
            }
            result.push(normalized);
        }
        Ok(result)
    }
}

/// Granted whenever any of `RESULTVAL`, `RESULT` or `GRANT_ACCESS` is
/// positive; the message comes from the matching text field.
fn interpret_grant(body: Option<&Value>) -> Option<AccessDecision> {
    let body = body?;

    let result_of = |v: f64| {
        if v > 0.0 { KpoResult::Yes } else { KpoResult::No }
    };
    let text = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    if let Some(v) = body.get("RESULTVAL").and_then(Value::as_f64) {
        return Some(AccessDecision {
            result: result_of(v),
            message: text("MSGSTR"),
        });
    }
    if let Some(v) = body.get("RESULT").and_then(Value::as_f64) {
        let message = body
            .get("MESSAGE")
            .or_else(|| body.get("DENYREASON"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Some(AccessDecision {
            result: result_of(v),
            message,
        });
    }
    if let Some(v) = body.get("GRANT_ACCESS").and_then(Value::as_f64) {
        return Some(AccessDecision {
            result: result_of(v),
            message: text("TEXT"),
        });
    }
    None
}

/// The CID is the first of `CID`, `CLIENT_ID`, `BIOID`.
fn extract_cid(body: &Value) -> Option<String> {
    for key in ["CID", "CLIENT_ID", "BIOID"] {
        if let Some(cid) = body.get(key).and_then(Value::as_str) {
            if !cid.is_empty() {
                return Some(cid.to_string());
            }
        }
    }
    None
}

fn parse_header(header: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("malformed header {header:?}")))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| Error::Config(format!("header name {name:?}: {e}")))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|e| Error::Config(format!("header value for {name}: {e}")))?;
    Ok((name, value))
}
