use crate::controller::clock::Clock;
use crate::controller::notification::NotificationSink;
use crate::controller::requirements::RequirementChecker;
use crate::controller::settings::{Settings, SettingsError};
use crate::controller::store::ReleaseStore;
use crate::controller::updater::engine::{
    UpdateOutcome, Updater, UpdaterError, DEFAULT_RETRY_AFTER,
};
use crate::crd::release::PlatformRelease;
use crate::server::SharedMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const MIN_REQUEUE: Duration = Duration::from_secs(5);
pub const MAX_REQUEUE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("update pass failed: {0}")]
    Updater(#[from] UpdaterError),

    #[error("invalid updater settings: {0}")]
    Settings(#[from] SettingsError),
}

/// Produces a fresh settings snapshot for every pass
pub type SettingsLoader = Arc<dyn Fn() -> Result<Settings, SettingsError> + Send + Sync>;

pub struct Context {
    pub updater: Updater<PlatformRelease>,
    pub settings: SettingsLoader,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
    /// Every watched release triggers a full pass; passes must not overlap
    pass_lock: Mutex<()>,
}

impl Context {
    pub fn new(
        store: Arc<dyn ReleaseStore<PlatformRelease>>,
        requirements: Arc<dyn RequirementChecker>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        settings: SettingsLoader,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            updater: Updater::new(store, requirements, notifier, clock)
                .with_metrics(metrics.clone()),
            settings,
            metrics,
            pass_lock: Mutex::new(()),
        }
    }
}

pub fn clamp_requeue(interval: Duration) -> Duration {
    interval.clamp(MIN_REQUEUE, MAX_REQUEUE)
}

fn outcome_requeue(outcome: &UpdateOutcome) -> Duration {
    match outcome {
        UpdateOutcome::UpToDate => MAX_REQUEUE,
        UpdateOutcome::Deployed(_) => MIN_REQUEUE,
        UpdateOutcome::Awaiting { .. } | UpdateOutcome::Skipped(_) => DEFAULT_RETRY_AFTER,
    }
}

/// Requeue for a policy block; a zero retry (manual approval) polls at the default rate
fn block_requeue(err: &UpdaterError) -> Duration {
    let retry = err
        .retry_after()
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_RETRY_AFTER);
    clamp_requeue(retry)
}

/// Reconcile the release set
///
/// Any watched release triggers one full update pass over all releases.
pub async fn reconcile(
    release: Arc<PlatformRelease>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start_time = std::time::Instant::now();
    let _pass = ctx.pass_lock.lock().await;
    let trigger = release.name_any();

    let settings = (ctx.settings)()?;
    let result = ctx.updater.run(&settings).await;
    let duration_secs = start_time.elapsed().as_secs_f64();

    let (label, requeue) = match result {
        Ok(outcome) => {
            debug!(trigger = %trigger, outcome = ?outcome, "Update pass finished");
            ("success", clamp_requeue(outcome_requeue(&outcome)))
        }
        Err(e) if e.is_policy_block() => {
            info!(trigger = %trigger, reason = %e, "Release deploy blocked by policy");
            ("blocked", block_requeue(&e))
        }
        Err(e) if e.is_race() => {
            debug!(trigger = %trigger, error = %e, "Release changed during pass, retrying");
            ("race", MIN_REQUEUE)
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_reconciliation("error", duration_secs);
            }
            return Err(e.into());
        }
    };

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation(label, duration_secs);
    }
    Ok(Action::requeue(requeue))
}

/// Error policy for the controller
///
/// Uses `warn!` since reconciliation errors are expected and trigger retries.
pub fn error_policy(release: Arc<PlatformRelease>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(release = %release.name_any(), error = %error, "Reconcile error (will retry)");
    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation_error();
    }
    Action::requeue(Duration::from_secs(10))
}
