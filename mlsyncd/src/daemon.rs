use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mlsync_core::{Identity, IndexerClient, ItemMetadata};
use serde::Serialize;

use crate::backoff::PollBackoff;
use crate::scan::{ScanSummary, scan_media_root};
use crate::sync::classifier::{FatalRunError, ItemOutcome};
use crate::sync::collaborators::{Indexer, LocalItemSource, ProcessingStore};
use crate::sync::index::IndexStore;
use crate::sync::orchestrator::{
    DEFAULT_BATCH_SIZE, DEFAULT_SCHEMA_VERSION, MAX_SYNC_ERROR_COUNT, SyncError,
    SyncOrchestrator, SyncSettings,
};
use crate::sync::queue::{concurrency_for, default_concurrency};

const DEFAULT_MEDIA_DIR_NAME: &str = "Pictures";
const DEFAULT_POLL_SECS: u64 = 60;
const DEFAULT_UPLOAD_MAX_BYTES: u64 = 32 * 1024 * 1024;
/// Upper bound on back-to-back batch runs in one cycle.
const MAX_BATCH_RUNS_PER_CYCLE: usize = 64;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub identity: Identity,
    pub indexer_url: String,
    pub media_root: PathBuf,
    pub db_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub upload_max_bytes: u64,
    pub backoff_jitter: bool,
    pub sync: SyncSettings,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let token = std::env::var("MLSYNC_TOKEN").context("MLSYNC_TOKEN is not set")?;
        let indexer_url =
            std::env::var("MLSYNC_INDEXER_URL").context("MLSYNC_INDEXER_URL is not set")?;
        let user_agent =
            std::env::var("MLSYNC_USER_AGENT").unwrap_or_else(|_| default_user_agent());
        let identity = Identity::new(token, read_i64_env("MLSYNC_USER_ID", 0), user_agent);
        identity.validate().context("MLSYNC_TOKEN is empty")?;

        let media_root = std::env::var("MLSYNC_MEDIA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_MEDIA_DIR_NAME));
        let db_path = std::env::var("MLSYNC_DB_PATH")
            .ok()
            .map(|value| expand_with_home(&value, &home));
        let poll_interval =
            Duration::from_secs(read_u64_env("MLSYNC_POLL_SECS", DEFAULT_POLL_SECS));
        let upload_max_bytes = read_u64_env("MLSYNC_UPLOAD_MAX_BYTES", DEFAULT_UPLOAD_MAX_BYTES);
        let backoff_jitter = read_bool_env("MLSYNC_BACKOFF_JITTER", true);

        let concurrency = std::env::var("MLSYNC_PARALLELISM")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(concurrency_for)
            .unwrap_or_else(default_concurrency);
        let sync = SyncSettings {
            batch_size: read_u64_env("MLSYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE as u64) as usize,
            current_version: read_i64_env("MLSYNC_SCHEMA_VERSION", DEFAULT_SCHEMA_VERSION),
            max_sync_error_count: read_u64_env(
                "MLSYNC_MAX_SYNC_ERRORS",
                u64::from(MAX_SYNC_ERROR_COUNT),
            )
            .min(u64::from(u32::MAX)) as u32,
            concurrency,
        };

        Ok(Self {
            identity,
            indexer_url,
            media_root,
            db_path,
            poll_interval,
            upload_max_bytes,
            backoff_jitter,
            sync,
        })
    }
}

/// What one daemon cycle (scan, foreground pass, batch runs) did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub registered: usize,
    pub removed: usize,
    pub foreground_indexed: usize,
    pub batch_runs: usize,
    pub batch_processed: usize,
    pub fatal: Option<FatalRunError>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: Arc<IndexStore>,
    orchestrator: Arc<SyncOrchestrator>,
    backoff: PollBackoff,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.media_root)
            .await
            .with_context(|| format!("failed to create media root at {:?}", config.media_root))?;
        let store = IndexStore::open(config.db_path.clone())
            .await
            .context("failed to initialize index store")?;
        let client = IndexerClient::new(&config.indexer_url, config.identity.session_token.clone())
            .context("invalid indexer url")?;

        Ok(Self::with_parts(config, Arc::new(store), Arc::new(client)))
    }

    pub fn with_parts(config: DaemonConfig, store: Arc<IndexStore>, indexer: Arc<dyn Indexer>) -> Self {
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&store) as Arc<dyn LocalItemSource>,
            Arc::clone(&store) as Arc<dyn ProcessingStore>,
            indexer,
            config.sync.clone(),
        ));
        let backoff = PollBackoff::new(config.poll_interval, config.backoff_jitter);
        Self {
            config,
            store,
            orchestrator,
            backoff,
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Runs a single cycle and releases the sync contexts.
    pub async fn run_once(&self) -> anyhow::Result<CycleReport> {
        let report = self.run_cycle().await;
        self.orchestrator.shutdown().await;
        report
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            media_root = %self.config.media_root.display(),
            indexer = %self.config.indexer_url,
            user_id = self.config.identity.user_id,
            concurrency = self.config.sync.concurrency,
            poll_secs = self.config.poll_interval.as_secs(),
            "mlsyncd started"
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut failures = 0u32;
        loop {
            let outcome = tokio::select! {
                res = &mut shutdown => {
                    res.context("failed waiting for shutdown signal")?;
                    break;
                }
                outcome = self.run_cycle() => outcome,
            };
            match outcome {
                Ok(report) if report.fatal.is_none() => failures = 0,
                Ok(report) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(error = ?report.fatal, failures, "sync cycle aborted");
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    tracing::error!(error = %format!("{err:#}"), failures, "sync cycle failed");
                }
            }

            let delay = self.backoff.delay(failures);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "sleeping until next cycle");
            tokio::select! {
                res = &mut shutdown => {
                    res.context("failed waiting for shutdown signal")?;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("shutting down");
        self.orchestrator.shutdown().await;
        Ok(())
    }

    async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();
        let identity = &self.config.identity;

        match scan_media_root(&self.store, identity.user_id, &self.config.media_root).await {
            Ok(summary) => {
                report.registered = summary.registered.len();
                report.removed = summary.removed;
                self.sync_new_items(&summary, &mut report).await?;
            }
            Err(err) => tracing::warn!(error = %err, "media scan failed, syncing known items"),
        }
        if report.fatal.is_some() {
            return Ok(report);
        }

        while report.batch_runs < MAX_BATCH_RUNS_PER_CYCLE {
            let run = self.orchestrator.sync_report(identity).await?;
            report.batch_runs += 1;
            report.batch_processed += run.processed;
            if let Some(fatal) = run.run_error {
                report.fatal = Some(fatal);
                break;
            }
            if !run.made_progress() {
                break;
            }
        }
        Ok(report)
    }

    /// Indexes freshly registered files on the foreground context, uploading
    /// their bytes when they are small enough.
    async fn sync_new_items(
        &self,
        summary: &ScanSummary,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        if summary.registered.is_empty() {
            return Ok(());
        }
        for item in &summary.registered {
            let raw = read_raw_bytes(item, self.config.upload_max_bytes).await;
            match self.orchestrator.sync_one(&self.config.identity, item, raw).await {
                Ok(ItemOutcome::Indexed) => report.foreground_indexed += 1,
                Ok(_) => {}
                Err(SyncError::Fatal(fatal)) => {
                    report.fatal = Some(fatal);
                    break;
                }
                Err(err) => {
                    self.orchestrator.close_foreground_context().await;
                    return Err(err).context("foreground sync failed");
                }
            }
        }
        self.orchestrator.close_foreground_context().await;
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
