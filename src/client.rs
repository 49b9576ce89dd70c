use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ANTHROPIC_VERSION, ChatConfig, SYSTEM_PROMPT};
use crate::session::HistoryEntry;
use crate::sse::{SseEvent, SseParser};
use crate::tools::{ToolDispatcher, ToolError};

const MAX_TOOL_ROUNDS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
}

/// One incremental unit of model output. Consumers drain the sequence once,
/// in order; vendor event names do not leak past this boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    ToolNotice(String),
    ToolResult(String),
    Error(String),
    /// Terminal completion signal carrying the full assembled text.
    Done(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

enum TurnEnd {
    Complete { text: String, tool_use: Option<ToolUse> },
    Cancelled,
}

/// Assembles one streamed response turn from vendor SSE events: text deltas
/// pass straight through, tool blocks are buffered between block start and
/// block stop before their argument JSON is parsed.
#[derive(Default)]
struct TurnAssembler {
    in_tool_block: bool,
    tool_id: String,
    tool_name: String,
    tool_json: String,
    tool_use: Option<ToolUse>,
}

impl TurnAssembler {
    /// Returns the text delta carried by the event, if any.
    fn handle(&mut self, event: &SseEvent) -> Option<String> {
        let data: Value = serde_json::from_str(&event.data).ok()?;
        let kind = event
            .event
            .clone()
            .unwrap_or_else(|| data["type"].as_str().unwrap_or_default().to_string());
        match kind.as_str() {
            "content_block_start" => {
                if data["content_block"]["type"] == "tool_use" {
                    self.in_tool_block = true;
                    self.tool_id = data["content_block"]["id"].as_str().unwrap_or_default().to_string();
                    self.tool_name = data["content_block"]["name"].as_str().unwrap_or_default().to_string();
                    self.tool_json.clear();
                }
                None
            }
            "content_block_delta" => match data["delta"]["type"].as_str() {
                Some("text_delta") => data["delta"]["text"].as_str().map(ToString::to_string),
                Some("input_json_delta") => {
                    if let Some(part) = data["delta"]["partial_json"].as_str() {
                        self.tool_json.push_str(part);
                    }
                    None
                }
                _ => None,
            },
            "content_block_stop" => {
                if self.in_tool_block && !self.tool_name.is_empty() {
                    // Unparseable argument text degrades to an empty object
                    // rather than failing the stream.
                    let input = serde_json::from_str::<Value>(&self.tool_json)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({}));
                    self.tool_use = Some(ToolUse {
                        id: std::mem::take(&mut self.tool_id),
                        name: std::mem::take(&mut self.tool_name),
                        input,
                    });
                    self.in_tool_block = false;
                    self.tool_json.clear();
                }
                None
            }
            _ => None,
        }
    }

    fn take_tool_use(&mut self) -> Option<ToolUse> {
        self.tool_use.take()
    }
}

/// Streaming client for the completion API.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatClient {
    /// `None` when no API key is configured; the server then reports the
    /// backend as unavailable instead of failing requests.
    pub fn from_config(cfg: &ChatConfig, http: reqwest::Client) -> Option<Self> {
        let api_key = cfg.api_key.clone()?;
        Some(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        })
    }

    /// Renders the page-state snapshot the browser sends along with a
    /// message into a prompt suffix; absent fields are omitted.
    pub fn format_context(context: &Value) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(node) = context.get("current_node").and_then(Value::as_str) {
            parts.push(format!("Current node: {node}"));
        }
        if let Some(program) = context.get("current_program").and_then(Value::as_str) {
            parts.push(format!("Current program: {program}"));
        }
        if let Some(page) = context.get("page_type").and_then(Value::as_str) {
            parts.push(format!("Page type: {page}"));
        }
        if let Some(info) = context.get("node_info") {
            let mut info_parts: Vec<String> = Vec::new();
            if let Some(n) = info.get("cell_count").and_then(Value::as_u64) {
                info_parts.push(format!("{} cells", group_thousands(n)));
            }
            if let Some(n) = info.get("gene_count").and_then(Value::as_u64) {
                info_parts.push(format!("{} genes", group_thousands(n)));
            }
            if let Some(n) = info.get("program_count").and_then(Value::as_u64) {
                info_parts.push(format!("{n} programs"));
            }
            if !info_parts.is_empty() {
                parts.push(format!("Node contains: {}", info_parts.join(", ")));
            }
        }
        if let Some(visible) = context.get("visible_data").and_then(Value::as_array) {
            let items: Vec<&str> = visible.iter().filter_map(Value::as_str).collect();
            if !items.is_empty() {
                parts.push(format!("Currently visible: {}", items.join(", ")));
            }
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("\n\nCurrent context: {}", parts.join(" | "))
        }
    }

    /// Starts an exchange and returns its fragment sequence. Lazy and
    /// single-pass; the task stops as soon as the receiver is dropped or the
    /// token is cancelled.
    pub fn respond(
        self: &Arc<Self>,
        user_text: String,
        history: Vec<HistoryEntry>,
        context: Option<Value>,
        dispatcher: Arc<ToolDispatcher>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Fragment> {
        let (tx, rx) = mpsc::channel(32);
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.run_exchange(user_text, history, context, dispatcher, cancel, tx).await;
        });
        rx
    }

    async fn run_exchange(
        &self,
        user_text: String,
        history: Vec<HistoryEntry>,
        context: Option<Value>,
        dispatcher: Arc<ToolDispatcher>,
        cancel: CancellationToken,
        tx: mpsc::Sender<Fragment>,
    ) {
        let mut user_text = user_text;
        if let Some(ctx) = &context {
            user_text.push_str(&Self::format_context(ctx));
        }
        let mut messages: Vec<Value> = history
            .iter()
            .map(|h| json!({"role": h.role, "content": h.content}))
            .collect();
        messages.push(json!({"role": "user", "content": user_text}));
        let tools = dispatcher.api_tools();
        debug!(messages = messages.len(), tools = tools.len(), "starting completion exchange");

        let mut full_text = String::new();
        let mut rounds = 0;
        loop {
            let turn = match self.stream_turn(&messages, &tools, &tx, &cancel).await {
                Ok(turn) => turn,
                Err(e) => {
                    warn!(error = %e, "completion stream failed");
                    let _ = tx
                        .send(Fragment::Text(format!("I apologize, but I encountered an error: {e}")))
                        .await;
                    return;
                }
            };
            let TurnEnd::Complete { text, tool_use } = turn else { return };
            full_text.push_str(&text);

            let Some(call) = tool_use else {
                let _ = tx.send(Fragment::Done(full_text)).await;
                return;
            };
            rounds += 1;
            if rounds > MAX_TOOL_ROUNDS {
                debug!("max tool rounds reached, ending exchange with partial response");
                let _ = tx.send(Fragment::Done(full_text)).await;
                return;
            }
            let (name, result) = match dispatcher.invoke_api_name(&call.name, &call.input).await {
                Ok(pair) => pair,
                Err(ToolError::UnknownTool(name)) => {
                    let _ = tx
                        .send(Fragment::Error(format!("The assistant requested an unknown tool: {name}")))
                        .await;
                    return;
                }
            };
            if tx.send(Fragment::ToolNotice(name)).await.is_err() {
                return;
            }
            if tx.send(Fragment::ToolResult(result.clone())).await.is_err() {
                return;
            }

            // Fold the tool exchange back into the conversation and continue
            // the stream with a follow-up request.
            let mut blocks = Vec::new();
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
            blocks.push(json!({"type": "tool_use", "id": call.id.clone(), "name": call.name, "input": call.input}));
            messages.push(json!({"role": "assistant", "content": blocks}));
            messages.push(json!({
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": call.id, "content": result}],
            }));
        }
    }

    async fn stream_turn(
        &self,
        messages: &[Value],
        tools: &[Value],
        tx: &mpsc::Sender<Fragment>,
        cancel: &CancellationToken,
    ) -> Result<TurnEnd, ClientError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": SYSTEM_PROMPT,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text: String = text.chars().take(200).collect();
            return Err(ClientError::Api(format!("HTTP {status}: {text}")));
        }

        let byte_stream = response.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        let mut lines = BufReader::new(StreamReader::new(byte_stream)).lines();
        let mut parser = SseParser::default();
        let mut assembler = TurnAssembler::default();
        let mut text = String::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                line = lines.next_line() => line.map_err(|e| ClientError::Network(e.to_string()))?,
            };
            let Some(line) = next else { break };
            let Some(event) = parser.push_line(&line) else { continue };
            if let Some(delta) = assembler.handle(&event) {
                text.push_str(&delta);
                if tx.send(Fragment::Text(delta)).await.is_err() {
                    return Ok(TurnEnd::Cancelled);
                }
            }
        }
        if let Some(event) = parser.finish() {
            if let Some(delta) = assembler.handle(&event) {
                text.push_str(&delta);
                let _ = tx.send(Fragment::Text(delta)).await;
            }
        }
        Ok(TurnEnd::Complete { text, tool_use: assembler.take_tool_use() })
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
