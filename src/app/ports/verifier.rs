// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{Credentials, JobWithCredentials, UnverifiedJob};

/// Verification step between a raw submission and a persisted job. Produces
/// a fully populated job in VALIDATED, with the caller's credential pair
/// attached, or fails describing the first invalid field.
#[async_trait]
pub trait VerifierPort: Send + Sync {
    async fn verify(
        &self,
        unverified: UnverifiedJob,
        credentials: Credentials,
    ) -> AppResult<JobWithCredentials>;
}
