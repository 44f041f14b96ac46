use db::models::BuildID;

#[derive(Debug)]
struct Message {
    build_id: BuildID,
    dependent_ids: Vec<BuildID>,
}

/// FIFO queue of build-finished notifications, drained by a single
/// worker. Delivery is best-effort: notifications queued when the
/// process dies are lost.
pub struct NotificationSender {
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Message>>,
}

impl Default for NotificationSender {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSender {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    #[tracing::instrument(skip(self), err)]
    pub fn schedule(&self, build_id: BuildID, dependent_ids: Vec<BuildID>) -> anyhow::Result<()> {
        self.tx.send(Message {
            build_id,
            dependent_ids,
        })?;
        Ok(())
    }

    pub async fn send_once(&self, db: &db::Database) -> bool {
        let Some(msg) = ({
            let mut rx = self.rx.lock().await;
            rx.recv().await
        }) else {
            return false;
        };

        if let Err(e) = send_notification(db, &msg).await {
            tracing::error!(
                "Failed to send build-finished notification for build {}: {e}",
                msg.build_id
            );
        }
        true
    }
}

#[tracing::instrument(skip(db), err)]
async fn send_notification(db: &db::Database, msg: &Message) -> anyhow::Result<()> {
    let mut conn = db.get().await?;
    let mut tx = conn.begin_transaction().await?;
    tx.notify_build_finished(msg.build_id, &msg.dependent_ids)
        .await?;
    tx.commit().await?;
    Ok(())
}
