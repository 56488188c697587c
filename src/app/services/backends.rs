// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;

use crate::app::errors::{codes, AppError, AppErrorKind, AppResult};
use crate::app::ports::{BackendRegistryPort, ComputeBackendPort};
use crate::app::types::Principal;

struct RegisteredBackend {
    principal: String,
    api: Arc<dyn ComputeBackendPort>,
}

/// In-memory backend registry. Backends register at startup with the service
/// principal they authenticate as; callbacks claiming a backend identity are
/// checked against that principal.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, RegisteredBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        principal: impl Into<String>,
        api: Arc<dyn ComputeBackendPort>,
    ) {
        self.backends.insert(
            name.into(),
            RegisteredBackend {
                principal: principal.into(),
                api,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn get(&self, name: &str) -> AppResult<&RegisteredBackend> {
        self.backends.get(name).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("no backend named '{name}' is registered"),
            )
        })
    }
}

impl BackendRegistryPort for BackendRegistry {
    fn resolve(&self, name: &str) -> AppResult<Arc<dyn ComputeBackendPort>> {
        Ok(self.get(name)?.api.clone())
    }

    fn verify_caller(
        &self,
        name: &str,
        caller: &Principal,
    ) -> AppResult<Arc<dyn ComputeBackendPort>> {
        let backend = self.get(name)?;
        if backend.principal != caller.username {
            return Err(AppError::with_message(
                AppErrorKind::Unauthorized,
                codes::UNAUTHORIZED,
                format!(
                    "'{}' is not authorized to act as backend '{name}'",
                    caller.username
                ),
            ));
        }
        Ok(backend.api.clone())
    }
}
