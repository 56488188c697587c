// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod accounting;
pub mod backend;
pub mod clock;
pub mod file_staging;
pub mod job_store;
pub mod spawner;
pub mod verifier;

pub use accounting::AccountingPort;
#[allow(unused_imports)]
pub use accounting::NoopAccounting;
pub use backend::{BackendRegistryPort, ComputeBackendPort};
pub use clock::ClockPort;
pub use file_staging::{FileData, FileStagingPort};
pub use job_store::JobStorePort;
pub use spawner::{TaskHandle, TaskSpawnerPort};
#[allow(unused_imports)]
pub use spawner::InlineSpawner;
pub use verifier::VerifierPort;
