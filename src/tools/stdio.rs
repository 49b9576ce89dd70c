use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::SearchProviderConfig;

use super::ToolProvider;

/// Web-search provider spoken to over a subprocess: one line-delimited
/// JSON-RPC request on stdin, responses on stdout. The server expects the
/// query wrapped in a `messages` array.
pub struct StdioProvider {
    cfg: SearchProviderConfig,
}

impl StdioProvider {
    pub fn new(cfg: SearchProviderConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ToolProvider for StdioProvider {
    fn name(&self) -> &str {
        "perplexity-ask"
    }

    fn timeout_secs(&self) -> u64 {
        self.cfg.timeout_secs
    }

    async fn call(&self, tool: &str, args: Value) -> anyhow::Result<Value> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": tool,
                "arguments": { "messages": [{ "role": "user", "content": query }] },
            },
        });

        debug!(command = %self.cfg.command, tool, "spawning search tool server");
        let mut child = tokio::process::Command::new(&self.cfg.command)
            .args(&self.cfg.args)
            .envs(self.cfg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.cfg.command))?;

        let mut stdin = child.stdin.take().context("tool server stdin unavailable")?;
        stdin.write_all(format!("{request}\n").as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "tool server exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_last_result(&String::from_utf8_lossy(&output.stdout))
    }
}

/// The server may emit several JSON objects (notifications, then the
/// response); the answer is the last line carrying a `result`.
fn parse_last_result(stdout: &str) -> anyhow::Result<Value> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else { continue };
        if let Some(result) = value.get("result") {
            return Ok(result.clone());
        }
        if let Some(error) = value.get("error") {
            anyhow::bail!("tool server error: {error}");
        }
    }
    anyhow::bail!("no JSON-RPC result in tool server output")
}
