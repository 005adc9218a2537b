use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::background::spawn_history_writer;
use crate::stores::history::{HistoryStore, NewAction};

pub enum AuditCommand {
    Record(NewAction),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle for action history. Entries are queued and written
/// by a background task in the order they were recorded.
#[derive(Clone)]
pub struct HistoryRecorder {
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl HistoryRecorder {
    /// Must be called inside a tokio runtime.
    pub fn start(store: HistoryStore) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_history_writer(store, rx);
        Self { tx }
    }

    pub fn record(&self, action: NewAction) {
        let action_id = action.id;
        if self.tx.send(AuditCommand::Record(action)).is_err() {
            warn!(%action_id, "history writer stopped; dropping action");
        }
    }

    /// Wait until every entry recorded before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(ack_tx)).is_err() {
            warn!("history writer stopped; nothing to flush");
            return;
        }
        let _ = ack_rx.await;
    }
}
