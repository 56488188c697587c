// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

/// Handle to a spawned task. Joining waits until the task finished; the
/// task's outcome is reported through the job record, not through the handle.
pub struct TaskHandle {
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    pub fn from_receiver(done: oneshot::Receiver<()>) -> Self {
        Self { done }
    }

    pub fn completed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self { done: rx }
    }

    pub async fn join(self) {
        // A dropped sender means the task died; there is nothing further to
        // wait for either way.
        let _ = self.done.await;
    }
}

/// Explicit task spawner passed through the orchestrator's constructor so
/// tests can run every transition synchronously.
#[async_trait]
pub trait TaskSpawnerPort: Send + Sync {
    async fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// Runs the task to completion before returning. Deterministic spawner for
/// tests.
#[derive(Clone, Default)]
pub struct InlineSpawner;

#[async_trait]
impl TaskSpawnerPort for InlineSpawner {
    async fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        task.await;
        TaskHandle::completed()
    }
}
