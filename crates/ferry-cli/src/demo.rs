//! Demo handlers used by `ferry run`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::typed::{Handler, HandlerError, Payload};
use ferry_core::{
    QueueBuilder, QueueError, QueueManager, SubmitOptions, TaskConfig, TaskId,
    TaskPriority, TaskType,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Payload for Echo {
    const NAME: &'static str = "demo.echo.v1";
    type Output = String;
}

pub struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, payload: Echo) -> Result<String, HandlerError> {
        info!(message = %payload.message, "echo");
        Ok(payload.message)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
}

impl Payload for Sleep {
    const NAME: &'static str = "demo.sleep.v1";
    type Output = u64;
}

pub struct SleepHandler;

#[async_trait]
impl Handler<Sleep> for SleepHandler {
    async fn handle(&self, payload: Sleep) -> Result<u64, HandlerError> {
        tokio::time::sleep(Duration::from_millis(payload.millis)).await;
        Ok(payload.millis)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Flaky {
    pub name: String,
}

impl Payload for Flaky {
    const NAME: &'static str = "demo.flaky.v1";
    type Output = String;
}

/// Fails the first `n` calls (across all tasks), then greets.
pub struct FlakyHandler {
    remaining_failures: AtomicU32,
}

impl FlakyHandler {
    pub fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<Flaky> for FlakyHandler {
    async fn handle(&self, payload: Flaky) -> Result<String, HandlerError> {
        let left = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Ok(left) = left {
            return Err(format!("intentional failure (left={left})").into());
        }
        Ok(format!("Hello, {}!", payload.name))
    }
}

/// Builder with every demo handler registered.
pub fn builder() -> anyhow::Result<QueueBuilder> {
    let builder = QueueBuilder::new()
        .register::<Echo, _>(EchoHandler)?
        .register::<Sleep, _>(SleepHandler)?
        .register::<Flaky, _>(FlakyHandler::new(2))?
        .expect_handlers(&[Echo::NAME, Sleep::NAME, Flaky::NAME]);
    Ok(builder)
}

/// Submit one task of each kind, covering success, retry and timeout.
pub async fn submit_all(manager: &QueueManager) -> Result<Vec<TaskId>, QueueError> {
    let mut ids = Vec::new();

    ids.push(
        manager
            .submit(
                &Echo {
                    message: "hello from ferry".into(),
                },
                SubmitOptions::new(TaskConfig::default().with_priority(TaskPriority::High))
                    .user("demo"),
            )
            .await?,
    );
    ids.push(
        manager
            .submit(
                &Flaky {
                    name: "ferry".into(),
                },
                TaskConfig::default()
                    .with_max_retries(3)
                    .with_retry_delay(0.5)
                    .with_task_type(TaskType::Notification),
            )
            .await?,
    );
    ids.push(
        manager
            .submit(
                &Sleep { millis: 3_000 },
                TaskConfig::default()
                    .with_timeout(1.0)
                    .with_task_type(TaskType::FileProcessing),
            )
            .await?,
    );
    ids.push(
        manager
            .submit(
                &Sleep { millis: 200 },
                TaskConfig::default().with_priority(TaskPriority::Low),
            )
            .await?,
    );

    Ok(ids)
}
