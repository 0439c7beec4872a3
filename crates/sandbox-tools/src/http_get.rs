//! `http.get` — the Policy Engine has already checked the hostname
//! against `allow_domains` and rejected obvious localhost/IP-literal
//! denials. This tool closes the gap the policy layer cannot: the
//! hostname itself may be public while DNS resolves it to a private
//! address (DNS rebinding). We resolve first and refuse before
//! connecting.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::contract::{Tool, ToolContext, ToolOutput, ToolSchema};

pub struct HttpGetTool {
    client: reqwest::Client,
}

impl Default for HttpGetTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "http.get"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "http.get".to_string(),
            description: "Fetch a URL over HTTP(S) GET".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "headers": {"type": "object"}
                },
                "required": ["url"]
            }),
        }
    }

    fn validate_args(&self, args: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if args.get("url").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
            errors.push("url is required".to_string());
        }
        errors
    }

    async fn execute(&self, args: Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let Some(url_str) = args.get("url").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::failure("missing url"));
        };
        let Ok(url) = reqwest::Url::parse(url_str) else {
            return Ok(ToolOutput::failure(format!("invalid url: {url_str}")));
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(ToolOutput::failure(format!("unsupported scheme: {}", url.scheme())));
        }
        let Some(host) = url.host_str() else {
            return Ok(ToolOutput::failure("url has no host"));
        };

        if let Some(reason) = rebinding_reason(host, url.port_or_known_default().unwrap_or(443)).await {
            return Ok(ToolOutput::failure(format!("refused: {reason}")));
        }

        let policy = &context.policy.http_get;
        let mut request = self.client.get(url.clone()).timeout(Duration::from_secs(policy.timeout_seconds));
        if let Some(headers) = args.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(value) = v.as_str() {
                    request = request.header(k.as_str(), value);
                }
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(err) => return Ok(ToolOutput::failure(format!("request failed: {err}"))),
        };
        let status = response.status();
        let max_bytes = policy.max_response_bytes as usize;

        let mut body = Vec::new();
        let mut truncated = false;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(err) => return Ok(ToolOutput::failure(format!("stream read failed: {err}"))),
            };
            if body.len() + chunk.len() > max_bytes {
                let remaining = max_bytes.saturating_sub(body.len());
                body.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        let data = json!({
            "status": status.as_u16(),
            "body": String::from_utf8_lossy(&body),
        });
        let metadata = json!({"truncated": truncated, "bytes": body.len()});

        if status.is_success() {
            Ok(ToolOutput::success_with(data, metadata))
        } else {
            Ok(ToolOutput::failure_with(format!("http status {}", status.as_u16()), metadata))
        }
    }
}

/// Resolves `host` and returns `Some(reason)` if any resolved address
/// is private, loopback, link-local, or otherwise reserved.
async fn rebinding_reason(host: &str, port: u16) -> Option<String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_disallowed_ip(&ip).then(|| format!("{host} is a private/reserved IP literal"));
    }
    let lookup: Vec<IpAddr> = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(err) => return Some(format!("dns resolution failed: {err}")),
    };
    rebinding_reason_for_addrs(host, &lookup)
}

/// The pure decision at the heart of `rebinding_reason`, split out so
/// it can be exercised with addresses a resolver *would* return
/// without actually touching DNS — a host can legitimately pass
/// domain policy while still resolving to an address we must refuse.
fn rebinding_reason_for_addrs(host: &str, addrs: &[IpAddr]) -> Option<String> {
    addrs
        .iter()
        .find(|addr| is_disallowed_ip(addr))
        .map(|addr| format!("{host} resolved to private IP {addr}"))
}

fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literal_loopback_is_disallowed_without_dns() {
        assert!(rebinding_reason("127.0.0.1", 80).await.is_some());
    }

    #[tokio::test]
    async fn ip_literal_public_is_allowed() {
        assert!(rebinding_reason("93.184.216.34", 80).await.is_none());
    }

    #[test]
    fn private_v4_ranges_are_disallowed() {
        assert!(is_disallowed_ip(&"10.0.0.5".parse().unwrap()));
        assert!(is_disallowed_ip(&"192.168.1.1".parse().unwrap()));
        assert!(is_disallowed_ip(&"169.254.1.1".parse().unwrap()));
        assert!(!is_disallowed_ip(&"8.8.8.8".parse().unwrap()));
    }

    // S9 — DNS rebinding: a hostname that would pass domain policy
    // resolves (via an injected address list standing in for a
    // resolver) to a private IP, and is refused anyway.
    #[test]
    fn s9_dns_rebinding_is_refused_even_for_a_policy_clean_hostname() {
        let addrs = vec!["10.0.0.5".parse().unwrap()];
        let reason = rebinding_reason_for_addrs("rebind.example", &addrs);
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("private IP"));
    }

    #[test]
    fn rebinding_reason_for_addrs_allows_public_results() {
        let addrs = vec!["93.184.216.34".parse().unwrap()];
        assert!(rebinding_reason_for_addrs("example.com", &addrs).is_none());
    }
}
