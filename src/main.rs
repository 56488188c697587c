// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use anyhow::Context;

use convoyd::adapters;
use convoyd::app::orchestrator::JobOrchestrator;
use convoyd::app::services::backends::BackendRegistry;
use convoyd::app::services::verification::JobVerifier;
use convoyd::config;
use convoyd::logging;

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::info!("config path: (none)");
        }
    }
    tracing::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    tracing::info!(
        "config staging_root: {} (source={})",
        report.staging_root.value.display(),
        report.staging_root.source.as_str()
    );
    tracing::info!(
        "config default_backend: {} (source={})",
        report.default_backend.value,
        report.default_backend.source.as_str()
    );
    tracing::info!(
        "config reaper_interval_secs: {} (source={})",
        report.reaper_interval_secs.value,
        report.reaper_interval_secs.source.as_str()
    );
    tracing::info!(
        "config max_job_age_hours: {} (source={})",
        report.max_job_age_hours.value,
        report.max_job_age_hours.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            staging_root: opts.staging_root,
            default_backend: opts.default_backend,
            reaper_interval_secs: opts.reaper_interval_secs,
            max_job_age_hours: opts.max_job_age_hours,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);

    config::ensure_parent_dir(&config.database_path)?;
    std::fs::create_dir_all(&config.staging_root).with_context(|| {
        format!(
            "failed to create staging root {}",
            config.staging_root.display()
        )
    })?;

    let db = adapters::db::JobStore::open(&config.database_path).await?;
    let jobs = Arc::new(adapters::db::SqliteStoreAdapter::new(db));
    let staging = Arc::new(adapters::staging::LocalStaging::new(
        config.staging_root.clone(),
    ));
    let clock = Arc::new(adapters::time::SystemClock::new());

    let dev_backend = adapters::backend::DevBackend::new(config.default_backend.clone(), false);
    let dev_principal = dev_backend.principal();
    let mut registry = BackendRegistry::new();
    registry.register(
        config.default_backend.clone(),
        dev_principal,
        Arc::new(dev_backend),
    );

    let orchestrator = JobOrchestrator::new(
        jobs,
        Arc::new(registry),
        staging,
        Arc::new(JobVerifier::new(clock.clone())),
        Arc::new(adapters::accounting::TracingAccounting::new()),
        clock,
        Arc::new(adapters::spawn::TokioSpawner::new()),
        config.default_backend.clone(),
        time::Duration::hours(config.max_job_age_hours as i64),
    );

    // Recover jobs left mid-flight by the previous process lifetime before
    // accepting any traffic. Exactly one daemon per job store may do this.
    orchestrator.replay_lost_jobs().await?;

    let reaper = orchestrator.clone();
    let interval = tokio::time::Duration::from_secs(config.reaper_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = reaper.remove_expired_jobs().await {
                tracing::warn!("expired job sweep failed: {err}");
            }
        }
    });

    tracing::info!("convoyd ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
