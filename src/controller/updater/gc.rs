//! Release garbage collection
//!
//! Corrects transient double-Deployed states, retires Pending releases left
//! below the deployed one and prunes old terminal releases.

use crate::controller::release::{sort_by_version, Release};
use crate::controller::store::{ReleaseStore, StoreError};
use crate::controller::updater::engine::SKIPPED_MESSAGE;
use crate::controller::version::is_greater;
use crate::crd::release::ReleasePhase;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Terminal releases kept for history
pub const DEFAULT_KEEP: usize = 3;

pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub superseded: Vec<String>,
    pub skipped: Vec<String>,
    pub deleted: Vec<String>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.superseded.is_empty() && self.skipped.is_empty() && self.deleted.is_empty()
    }
}

pub async fn collect_garbage<R: Release>(
    store: &dyn ReleaseStore<R>,
    keep: usize,
) -> Result<GcReport, StoreError> {
    let sorted = sort_by_version(store.list_releases().await?);
    let mut report = GcReport::default();
    // Phases after this pass's writes, aligned with `sorted`
    let mut phases: Vec<Option<ReleasePhase>> = sorted.iter().map(|v| v.release.phase()).collect();

    let newest_deployed = phases
        .iter()
        .rposition(|p| *p == Some(ReleasePhase::Deployed));

    if let Some(newest) = newest_deployed {
        let deployed_version = sorted[newest].version.clone();
        for (index, entry) in sorted.iter().enumerate() {
            match phases[index] {
                Some(ReleasePhase::Deployed) if index != newest => {
                    store
                        .update_status(&entry.release, "", ReleasePhase::Superseded)
                        .await?;
                    phases[index] = Some(ReleasePhase::Superseded);
                    report.superseded.push(entry.release.name());
                }
                Some(ReleasePhase::Pending) if is_greater(&deployed_version, &entry.version) => {
                    store
                        .update_status(&entry.release, SKIPPED_MESSAGE, ReleasePhase::Skipped)
                        .await?;
                    phases[index] = Some(ReleasePhase::Skipped);
                    report.skipped.push(entry.release.name());
                }
                _ => {}
            }
        }
    }

    let prunable: Vec<usize> = (0..sorted.len())
        .rev()
        .filter(|&i| phases[i].is_some_and(|p| p.is_prunable()))
        .collect();
    for &index in prunable.iter().skip(keep) {
        let release = &sorted[index].release;
        store.delete_release(release).await?;
        report.deleted.push(release.name());
    }

    if !report.is_empty() {
        info!(
            superseded = report.superseded.len(),
            skipped = report.skipped.len(),
            deleted = report.deleted.len(),
            "Release garbage collection finished"
        );
    }
    Ok(report)
}

/// Run garbage collection on a fixed interval until shutdown
pub async fn run_gc_loop<R: Release>(
    store: Arc<dyn ReleaseStore<R>>,
    interval: Duration,
    keep: usize,
    mut shutdown: crate::server::ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = collect_garbage(store.as_ref(), keep).await {
                    warn!(error = %e, "Release garbage collection failed (non-fatal)");
                }
            }
            _ = shutdown.wait() => {
                info!("Garbage collection loop stopped");
                return;
            }
        }
    }
}
