//! Bitcoin Core JSON-RPC client backed by `reqwest`.
//!
//! Bitcoin Core answers RPC failures with an HTTP error status *and* a JSON
//! body carrying the RPC error, so the body is decoded before the status is
//! judged.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chainarchive_core::error::ProducerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::parse::{HeaderInfo, TxidBlock, VerboseBlock};

/// Connection settings for one Bitcoin Core node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinRpcConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// `.cookie` file written by bitcoind; read on every call since the
    /// node rotates it on restart.
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_url() -> String {
    "http://127.0.0.1:8332".into()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for BitcoinRpcConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: None,
            password: None,
            cookie_file: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// RPC codes that mean "not yet": warming up, height out of range, block
/// not found.
const RETRYABLE_RPC_CODES: [i64; 3] = [-28, -8, -5];

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("authentication rejected (HTTP {0})")]
    Auth(u16),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("client configuration: {0}")]
    Config(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Rpc { code, .. } => RETRYABLE_RPC_CODES.contains(code),
            Self::Auth(_) | Self::Malformed(_) | Self::Config(_) => false,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<RpcError> for ProducerError {
    fn from(e: RpcError) -> Self {
        if e.is_transient() {
            ProducerError::Transient(e.to_string())
        } else {
            ProducerError::Fatal(e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Turns an HTTP status and body into the call's result.
fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, RpcError> {
    if status == 401 || status == 403 {
        return Err(RpcError::Auth(status));
    }

    let envelope: RpcEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if (200..300).contains(&status) => return Err(RpcError::Malformed(e.to_string())),
        Err(_) => {
            return Err(RpcError::Http {
                status,
                body: body.chars().take(200).collect(),
            })
        }
    };

    if let Some(err) = envelope.error {
        return Err(RpcError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    if !(200..300).contains(&status) {
        return Err(RpcError::Http {
            status,
            body: body.chars().take(200).collect(),
        });
    }

    let result = envelope
        .result
        .ok_or_else(|| RpcError::Malformed("response has neither result nor error".into()))?;
    serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))
}

/// `user:password` from a bitcoind cookie file.
fn parse_cookie(contents: &str) -> Option<(String, String)> {
    let (user, password) = contents.trim().split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// JSON-RPC 1.0 client for Bitcoin Core.
pub struct BitcoinRpcClient {
    url: String,
    http: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
    cookie_file: Option<PathBuf>,
    next_id: AtomicU64,
}

impl BitcoinRpcClient {
    pub fn new(config: &BitcoinRpcConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RpcError::Config(e.to_string()))?;

        Ok(Self {
            url: config.url.clone(),
            http,
            user: config.user.clone(),
            password: config.password.clone(),
            cookie_file: config.cookie_file.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn credentials(&self) -> Result<Option<(String, String)>, RpcError> {
        if let Some(user) = &self.user {
            return Ok(Some((user.clone(), self.password.clone().unwrap_or_default())));
        }
        let Some(path) = &self.cookie_file else {
            return Ok(None);
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("cookie file {}: {e}", path.display())))?;
        parse_cookie(&contents)
            .map(Some)
            .ok_or_else(|| RpcError::Config(format!("cookie file {} is malformed", path.display())))
    }

    /// Calls `method` and decodes its `result`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some((user, password)) = self.credentials()? {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await.map_err(RpcError::from_reqwest)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(RpcError::from_reqwest)?;

        let result = decode_response(status, &text);
        if let Err(e) = &result {
            tracing::debug!(method, id, status, error = %e, "bitcoin rpc call failed");
        }
        result
    }

    pub async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    pub async fn get_block_header(&self, hash: &str) -> Result<HeaderInfo, RpcError> {
        self.call("getblockheader", json!([hash, true])).await
    }

    /// `getblock` at verbosity 1: transaction ids only.
    pub async fn get_block_txids(&self, hash: &str) -> Result<TxidBlock, RpcError> {
        self.call("getblock", json!([hash, 1])).await
    }

    /// `getblock` at verbosity 3: full transactions with prevouts.
    pub async fn get_block_with_prevouts(&self, hash: &str) -> Result<VerboseBlock, RpcError> {
        self.call("getblock", json!([hash, 3])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_decoded() {
        let count: u64 = decode_response(200, r#"{"result":840000,"error":null,"id":1}"#).unwrap();
        assert_eq!(count, 840_000);
    }

    #[test]
    fn rpc_error_inside_http_500_is_classified_by_code() {
        let warming = decode_response::<u64>(
            500,
            r#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":1}"#,
        )
        .unwrap_err();
        assert!(matches!(warming, RpcError::Rpc { code: -28, .. }));
        assert!(warming.is_transient());

        let out_of_range = decode_response::<String>(
            500,
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":2}"#,
        )
        .unwrap_err();
        assert!(out_of_range.is_transient());

        let unknown = decode_response::<u64>(
            404,
            r#"{"result":null,"error":{"code":-32601,"message":"Method not found"},"id":3}"#,
        )
        .unwrap_err();
        assert!(!unknown.is_transient());
    }

    #[test]
    fn status_without_rpc_body() {
        let gateway = decode_response::<u64>(502, "<html>Bad Gateway</html>").unwrap_err();
        assert!(matches!(gateway, RpcError::Http { status: 502, .. }));
        assert!(gateway.is_transient());

        let auth = decode_response::<u64>(401, "").unwrap_err();
        assert!(matches!(auth, RpcError::Auth(401)));
        assert!(!auth.is_transient());

        let garbage = decode_response::<u64>(200, "not json").unwrap_err();
        assert!(matches!(garbage, RpcError::Malformed(_)));
        assert!(!garbage.is_transient());
    }

    #[test]
    fn maps_into_producer_error() {
        assert!(ProducerError::from(RpcError::Timeout).is_retryable());
        assert!(!ProducerError::from(RpcError::Auth(403)).is_retryable());
    }

    #[test]
    fn cookie_file_format() {
        assert_eq!(
            parse_cookie("__cookie__:abc123\n"),
            Some(("__cookie__".into(), "abc123".into()))
        );
        assert_eq!(parse_cookie("no-separator"), None);
    }

    #[test]
    fn config_defaults() {
        let cfg: BitcoinRpcConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.url, "http://127.0.0.1:8332");
        assert_eq!(cfg.timeout_ms, 30_000);
        assert!(BitcoinRpcClient::new(&cfg).is_ok());
    }
}
