// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::app::ports::{TaskHandle, TaskSpawnerPort};

/// Spawner backed by the Tokio runtime.
#[derive(Clone, Default)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskSpawnerPort for TokioSpawner {
    async fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            task.await;
            let _ = tx.send(());
        });
        TaskHandle::from_receiver(rx)
    }
}
