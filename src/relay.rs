use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::client::Fragment;
use crate::events::StreamEvent;
use crate::session::{Role, SessionStore};

/// Drains an adapter fragment sequence into browser-facing stream events.
///
/// Emits exactly one `Start`, re-emits fragments in arrival order, and closes
/// with exactly one terminal event. The accumulated response is persisted as
/// one assistant message on a clean end; nothing is persisted on error.
/// Draining stops as soon as the event receiver goes away, which drops the
/// fragment receiver and with it the adapter task.
pub async fn run_relay(
    store: SessionStore,
    session_id: String,
    mut fragments: mpsc::Receiver<Fragment>,
    events: mpsc::Sender<StreamEvent>,
) {
    if events.send(StreamEvent::Start { session_id: session_id.clone() }).await.is_err() {
        return;
    }

    let mut buffer = String::new();
    let mut full_text: Option<String> = None;
    while let Some(fragment) = fragments.recv().await {
        let event = match fragment {
            Fragment::Text(text) => {
                buffer.push_str(&text);
                StreamEvent::Chunk { content: text }
            }
            Fragment::ToolNotice(tool_name) => StreamEvent::ToolNotice { tool_name },
            Fragment::ToolResult(content) => StreamEvent::ToolResult { content },
            Fragment::Error(message) => {
                metrics::counter!("chat_streams_errored_total").increment(1);
                debug!(session_id = %session_id, "stream ended with error");
                let _ = events.send(StreamEvent::Error { message }).await;
                return;
            }
            Fragment::Done(text) => {
                full_text = Some(text);
                break;
            }
        };
        if events.send(event).await.is_err() {
            debug!(session_id = %session_id, "client disconnected, stopping relay");
            return;
        }
    }

    let text = full_text.unwrap_or(buffer);
    store.append(&session_id, Role::Assistant, &text, None);
    metrics::counter!("chat_streams_completed_total").increment(1);
    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let _ = events.send(StreamEvent::End { message_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn relay_events(store: &SessionStore, session_id: &str, fragments: Vec<Fragment>) -> Vec<StreamEvent> {
        let (frag_tx, frag_rx) = mpsc::channel(16);
        for f in fragments {
            frag_tx.send(f).await.unwrap();
        }
        drop(frag_tx);
        let (ev_tx, mut ev_rx) = mpsc::channel(16);
        run_relay(store.clone(), session_id.to_string(), frag_rx, ev_tx).await;
        let mut out = Vec::new();
        while let Some(ev) = ev_rx.recv().await {
            out.push(ev);
        }
        out
    }

    fn assert_well_formed(events: &[StreamEvent]) {
        assert!(matches!(events.first(), Some(StreamEvent::Start { .. })), "first event must be start");
        assert_eq!(events.iter().filter(|e| matches!(e, StreamEvent::Start { .. })).count(), 1);
        let terminal = events.iter().position(StreamEvent::is_terminal).expect("must have a terminal event");
        assert_eq!(terminal, events.len() - 1, "nothing may follow the terminal event");
    }

    #[tokio::test]
    async fn plain_text_exchange_persists_assistant_message() {
        let store = SessionStore::new(50);
        store.append("s1", Role::User, "What cell types are in this node?", Some(serde_json::json!({"current_node": "root"})));
        let events = relay_events(
            &store,
            "s1",
            vec![
                Fragment::Text("Alveolar ".into()),
                Fragment::Text("macrophages.".into()),
                Fragment::Done("Alveolar macrophages.".into()),
            ],
        )
        .await;

        assert_well_formed(&events);
        assert_eq!(events.len(), 4);
        assert_eq!(events[1], StreamEvent::Chunk { content: "Alveolar ".into() });
        assert!(matches!(&events[3], StreamEvent::End { message_id } if message_id.starts_with("msg_")));

        let history = store.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Alveolar macrophages.");
    }

    #[tokio::test]
    async fn tool_fragments_map_to_tool_events() {
        let store = SessionStore::new(50);
        let events = relay_events(
            &store,
            "s1",
            vec![
                Fragment::ToolNotice("finngen:query_credible_sets".into()),
                Fragment::ToolResult("3 credible sets found".into()),
                Fragment::Text("Summary".into()),
                Fragment::Done("Summary".into()),
            ],
        )
        .await;

        assert_well_formed(&events);
        assert_eq!(events[1], StreamEvent::ToolNotice { tool_name: "finngen:query_credible_sets".into() });
        assert_eq!(events[2], StreamEvent::ToolResult { content: "3 credible sets found".into() });
    }

    #[tokio::test]
    async fn error_fragment_terminates_without_persisting() {
        let store = SessionStore::new(50);
        store.append("s1", Role::User, "hi", None);
        let events = relay_events(
            &store,
            "s1",
            vec![
                Fragment::Text("partial".into()),
                Fragment::Error("The assistant requested an unknown tool: nonexistent_tool".into()),
                Fragment::Text("ignored".into()),
            ],
        )
        .await;

        assert_well_formed(&events);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], StreamEvent::Error { message } if message.contains("nonexistent_tool")));
        // partial text is dropped, not persisted
        assert_eq!(store.history("s1").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_sequence_without_done_still_ends_cleanly() {
        let store = SessionStore::new(50);
        let events = relay_events(
            &store,
            "s1",
            vec![Fragment::Text("I apologize, but I encountered an error: timeout".into())],
        )
        .await;

        assert_well_formed(&events);
        assert!(matches!(events.last(), Some(StreamEvent::End { .. })));
        let history = store.history("s1");
        assert_eq!(history.len(), 1);
        assert!(history[0].content.starts_with("I apologize"));
    }

    #[tokio::test]
    async fn empty_sequence_yields_start_then_end() {
        let store = SessionStore::new(50);
        let events = relay_events(&store, "s1", vec![]).await;
        assert_well_formed(&events);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn disconnected_client_stops_relay_without_persisting_more_events() {
        let store = SessionStore::new(50);
        let (frag_tx, frag_rx) = mpsc::channel(4);
        frag_tx.send(Fragment::Text("a".into())).await.unwrap();
        frag_tx.send(Fragment::Done("a".into())).await.unwrap();
        drop(frag_tx);
        let (ev_tx, ev_rx) = mpsc::channel(4);
        drop(ev_rx);
        run_relay(store.clone(), "s1".into(), frag_rx, ev_tx).await;
        // start event could not be delivered, so nothing was appended
        assert!(store.history("s1").is_empty());
    }
}
