// File: chainrunner/src/rpc.rs
//
// Minimal JSON-RPC client for node status queries
//
// Only the two calls needed to read the finalized height are implemented:
// `chain_getFinalizedHead` returns the hash of the last finalized block and
// `chain_getHeader` returns its header, whose `number` is a hex string.

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Header {
    number: String,
}

/// Parse a block number as returned in headers (`0x`-prefixed hex)
pub fn parse_block_number(number: &str) -> Result<u64> {
    let digits = number
        .strip_prefix("0x")
        .or_else(|| number.strip_prefix("0X"))
        .with_context(|| format!("Block number {:?} is not hex-prefixed", number))?;
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid block number {:?}", number))
}

/// HTTP JSON-RPC client bound to one node
#[derive(Debug)]
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl RpcClient {
    /// Client whose every request is bounded by `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("RPC Request to {}: {method} with params: {params}", self.url);
        }

        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id(),
            method,
            params,
        };

        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to send RPC request")?
            .json()
            .await
            .context("Failed to parse RPC response")?;

        if let Some(error) = response.error {
            anyhow::bail!("RPC error {}: {}", error.code, error.message);
        }

        response
            .result
            .ok_or_else(|| anyhow::anyhow!("RPC response missing result"))
    }

    /// Hash of the last finalized block
    pub async fn finalized_head(&self) -> Result<String> {
        self.call("chain_getFinalizedHead", json!([])).await
    }

    /// Number of the block with the given hash
    pub async fn header_number(&self, hash: &str) -> Result<u64> {
        let header: Header = self.call("chain_getHeader", json!([hash])).await?;
        parse_block_number(&header.number)
    }

    pub async fn finalized_height(&self) -> Result<u64> {
        let head = self.finalized_head().await?;
        self.header_number(&head).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_number() {
        assert_eq!(parse_block_number("0x0").unwrap(), 0);
        assert_eq!(parse_block_number("0x5a").unwrap(), 90);
        assert_eq!(parse_block_number("0XFF").unwrap(), 255);
    }

    #[test]
    fn test_parse_block_number_rejects_garbage() {
        assert!(parse_block_number("90").is_err());
        assert!(parse_block_number("0x").is_err());
        assert!(parse_block_number("0xzz").is_err());
    }

    #[test]
    fn test_response_fields_are_optional() {
        let response: RpcResponse<Header> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x2a"}}"#).unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap().number, "0x2a");

        let response: RpcResponse<Header> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32000,"message":"Unknown block"}}"#,
        )
        .unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32000);
    }

    #[tokio::test]
    async fn test_finalized_height_over_http() {
        let node = fake::spawn(165).await;
        let client = RpcClient::new(
            format!("http://127.0.0.1:{}", node.port),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(client.finalized_head().await.unwrap(), "0xabcdef");
        assert_eq!(client.finalized_height().await.unwrap(), 165);

        node.height.store(200, Ordering::SeqCst);
        assert_eq!(client.finalized_height().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_rpc_error_is_reported() {
        let node = fake::spawn(1).await;
        let client = RpcClient::new(
            format!("http://127.0.0.1:{}", node.port),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = client
            .call::<serde_json::Value>("system_health", json!([]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Method not found"));
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = RpcClient::new(format!("http://127.0.0.1:{}", port), Duration::from_secs(1)).unwrap();
        assert!(client.finalized_height().await.is_err());
    }
}
