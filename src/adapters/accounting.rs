// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::AccountingPort;
use crate::app::types::AccountingEvent;

/// Accounting sink that logs structured events. A billing pipeline consumes
/// the same port in production deployments.
#[derive(Clone, Default)]
pub struct TracingAccounting;

impl TracingAccounting {
    pub fn new() -> Self {
        Self
    }
}

impl AccountingPort for TracingAccounting {
    fn emit(&self, event: AccountingEvent) {
        let AccountingEvent {
            job_id,
            owner,
            duration_ms,
            nodes,
            completed_at_ms,
            application,
            success,
        } = event;

        tracing::info!(
            target: "convoyd::accounting",
            job_id = %job_id,
            owner = %owner,
            duration_ms,
            nodes,
            completed_at_ms,
            application = %application.name,
            version = %application.version,
            success,
        );
    }
}
