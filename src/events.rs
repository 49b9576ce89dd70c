use serde::{Deserialize, Serialize};

/// One SSE-framed event sent to the browser during response generation.
///
/// A stream is exactly one `Start`, then any number of `Chunk`/`ToolNotice`/
/// `ToolResult` in emission order, then exactly one `End` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start { session_id: String },
    Chunk { content: String },
    ToolNotice { tool_name: String },
    ToolResult { content: String },
    End { message_id: String },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }
}
