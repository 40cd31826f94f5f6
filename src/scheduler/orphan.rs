//! Guard against containers left behind by a previous session.
//!
//! The state store starts empty every session, so any managed container that
//! already exists at startup is unknown to it and would never be reconciled.
//! Serving is refused until an operator removes them (`precheck-server cleanup`).
//!
//! While a session is live, an orphan is a managed container that no running
//! run is bound to.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{PrecheckError, Result};
use crate::runtime::{ContainerRecord, ContainerRuntime};

/// Managed containers whose id is not in `tracked`, sorted by name.
pub async fn find_orphans(
    runtime: &dyn ContainerRuntime,
    tracked: &HashSet<String>,
) -> Result<Vec<ContainerRecord>> {
    let mut orphans: Vec<ContainerRecord> = runtime
        .list_managed()
        .await?
        .into_iter()
        .filter(|c| !tracked.contains(&c.id))
        .collect();
    orphans.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(orphans)
}

/// Startup check: fails with [`PrecheckError::ConfigurationConflict`] if any
/// managed container exists.
pub async fn check(runtime: &dyn ContainerRuntime) -> Result<()> {
    let orphans = find_orphans(runtime, &HashSet::new()).await?;
    if orphans.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = orphans.into_iter().map(|c| c.name).collect();
    tracing::error!(count = names.len(), orphans = ?names, "Orphaned containers found");
    Err(PrecheckError::ConfigurationConflict(names))
}

/// Stop and remove every managed container not in `tracked`; returns the
/// removed names. A container that fails to stop is logged and skipped.
pub async fn cleanup(
    runtime: &dyn ContainerRuntime,
    tracked: &HashSet<String>,
    stop_timeout: Duration,
) -> Result<Vec<String>> {
    if tracked.is_empty() {
        let mut removed = runtime.cleanup_all(stop_timeout).await?;
        removed.sort();
        tracing::info!(count = removed.len(), "Removed managed containers");
        return Ok(removed);
    }

    let mut removed = Vec::new();
    for orphan in find_orphans(runtime, tracked).await? {
        match runtime.stop_and_remove(&orphan.id, stop_timeout).await {
            Ok(true) => removed.push(orphan.name),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(container = %orphan.name, error = %e, "Failed to remove orphaned container");
            }
        }
    }
    tracing::info!(count = removed.len(), "Removed orphaned containers");
    Ok(removed)
}
