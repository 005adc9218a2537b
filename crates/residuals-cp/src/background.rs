use tokio::sync::mpsc;
use tracing::warn;

use crate::services::audit::AuditCommand;
use crate::stores::history::HistoryStore;

/// Drain the audit queue into `action_history`. Write failures are logged
/// and dropped so callers never observe them.
pub fn spawn_history_writer(store: HistoryStore, mut rx: mpsc::UnboundedReceiver<AuditCommand>) {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                AuditCommand::Record(action) => {
                    if let Err(err) = store.insert(&action).await {
                        warn!(
                            action_id = %action.id,
                            action_type = action.action_type.as_str(),
                            entity_type = action.entity_type.as_str(),
                            error = %err,
                            "failed to write action history"
                        );
                    }
                }
                AuditCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
}
