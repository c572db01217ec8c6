//! Install and activate steps run before the host starts serving.
//!
//! *Install* pre-caches the configured critical resources. *Activate* drops
//! cache generations left behind by older releases and runs one maintenance
//! pass over the current one. Neither step can fail the start-up: problems are
//! logged and the host serves anyway.

use crate::server::AppState;
use slipstream_cache::purge_stale_generations;

/// What the activate step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// Sibling cache directories deleted
    pub removed_generations: Vec<String>,
    /// Entries removed by trimming
    pub trimmed: usize,
    /// Entries removed as expired
    pub expired: usize,
}

/// Pre-cache every configured resource. Returns how many were stored.
pub async fn install(state: &AppState) -> usize {
    let orchestrator = state.orchestrator();
    let configured = &orchestrator.config().precache;
    if configured.is_empty() {
        tracing::debug!("Nothing to pre-cache");
        return 0;
    }

    let urls: Vec<String> = configured
        .iter()
        .filter_map(|target| match state.resolve(target) {
            Some(url) => Some(url.to_string()),
            None => {
                tracing::warn!("Skipping pre-cache of unresolvable URL {target}");
                None
            }
        })
        .collect();

    orchestrator.precache(&urls).await
}

/// Remove old cache generations, then trim and expire the current cache.
pub async fn activate(state: &AppState) -> Activation {
    let orchestrator = state.orchestrator();
    let mut activation = Activation::default();

    if let (Some(dir), Some(cache)) = (state.cache_dir(), orchestrator.cache()) {
        let prefix = orchestrator.config().cache_prefix();
        match purge_stale_generations(dir, prefix, cache.name()).await {
            Ok(removed) => {
                for name in &removed {
                    tracing::info!("Deleted old cache generation {name}");
                }
                activation.removed_generations = removed;
            }
            Err(e) => tracing::warn!("Failed to clean old cache generations: {e}"),
        }
    }

    let (trimmed, expired) = orchestrator.run_maintenance().await;
    activation.trimmed = trimmed;
    activation.expired = expired;
    activation
}
