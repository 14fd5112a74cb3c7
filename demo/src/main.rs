use futures_util::StreamExt;
use outbox_domain::attachment::{AttachmentSet, BlobAttachment};
use outbox_domain::content::Content;
use outbox_domain::pending_event::{PendingEvent, PendingEventRecord, PendingEventUpdate};
use outbox_domain::transport::InMemoryHomeServer;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// 演示配置（环境变量）
struct DemoConfig {
    room_id: String,
    latency: Duration,
}

impl DemoConfig {
    fn from_env() -> anyhow::Result<Self> {
        let room_id = std::env::var("DEMO_ROOM_ID").unwrap_or_else(|_| "!demo:localhost".into());
        let latency = match std::env::var("DEMO_LATENCY_MS") {
            Ok(raw) => Duration::from_millis(raw.parse()?),
            Err(_) => Duration::from_millis(50),
        };
        Ok(Self { room_id, latency })
    }
}

/// 极简发件箱：只负责排序键与移除回调
#[derive(Clone, Default)]
struct Outbox {
    entries: Arc<Mutex<Vec<PendingEventRecord>>>,
}

impl Outbox {
    fn push(&self, record: PendingEventRecord) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    fn remover(&self, txn_id: &str) -> Box<dyn FnOnce() + Send> {
        let entries = self.entries.clone();
        let txn_id = txn_id.to_string();
        Box::new(move || {
            entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|r| r.txn_id() != txn_id)
        })
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn image_message(config: &DemoConfig, queue_index: u64) -> (PendingEventRecord, AttachmentSet) {
    let record = PendingEventRecord::builder()
        .room_id(config.room_id.clone())
        .queue_index(queue_index)
        .event_type("m.room.message")
        .content(
            Content::new()
                .with_path("msgtype", "m.image")
                .with_path("body", "sunset.png"),
        )
        .needs_upload(true)
        .build();

    let attachments = AttachmentSet::new()
        .with(
            "url",
            Arc::new(BlobAttachment::new(vec![7; 4096], "image/png").with_file_name("sunset.png")),
        )
        .with(
            "info.thumbnail_url",
            Arc::new(BlobAttachment::new(vec![7; 256], "image/png")),
        );
    (record, attachments)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DemoConfig::from_env()?;
    let server = InMemoryHomeServer::new().with_latency(config.latency);
    let outbox = Outbox::default();

    // 1. 正常发送：附件上传 → 发送
    let (record, attachments) = image_message(&config, 0);
    outbox.push(record.clone());
    let event = PendingEvent::builder()
        .on_remove(outbox.remover(record.txn_id()))
        .record(record)
        .attachments(attachments)
        .build();

    let mut updates = event.updates();
    let observer = tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            match update {
                PendingEventUpdate::Status(status) => tracing::info!(%status, "status changed"),
                PendingEventUpdate::AttachmentsSentBytes { sent, total } => {
                    tracing::info!(sent, total, "upload progress")
                }
            }
        }
    });

    event.upload_attachments(&server).await?;
    event.send(&server).await?;
    tracing::info!(
        record = %serde_json::to_string(&event.record())?,
        "delivered"
    );
    drop(event);
    observer.await?;

    // 2. 发送途中取消：从发件箱移除，不视为投递失败
    let (record, attachments) = image_message(&config, 1);
    outbox.push(record.clone());
    let event = Arc::new(
        PendingEvent::builder()
            .on_remove(outbox.remover(record.txn_id()))
            .record(record)
            .attachments(attachments)
            .build(),
    );

    let task = {
        let event = event.clone();
        let server = server.clone();
        tokio::spawn(async move {
            event.upload_attachments(&server).await?;
            event.send(&server).await
        })
    };
    tokio::time::sleep(config.latency / 2).await;
    event.abort();

    match task.await? {
        Err(err) if err.is_aborted() => tracing::info!(outbox = outbox.len(), "send cancelled"),
        Err(err) => return Err(err.into()),
        Ok(()) => tracing::warn!("finished before cancellation"),
    }
    event.dispose();

    Ok(())
}
