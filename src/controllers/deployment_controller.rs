//! Controller watching Deployments in every namespace

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::informer::ObservationCache;
use super::Context;
use crate::metrics::{
    INFORMER_SYNCED, ORPHANED_CRONSCALERS_DELETED, RECONCILIATIONS, RECONCILIATION_ERRORS,
};
use crate::reconcilers::mirror;

/// How long queued jobs get to finish after shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Run the Deployment controller until shutdown
pub async fn run(client: Client, ctx: Arc<Context>) {
    let deployments: Api<Deployment> = Api::all(client);

    info!(
        enforce_resources = ctx.settings.features.enforce_resources,
        mirror_deployments = ctx.settings.features.mirror_deployments,
        "Starting Deployment controller"
    );

    let sweeper = ctx
        .settings
        .features
        .mirror_deployments
        .then(|| tokio::spawn(sweep_orphans(Arc::clone(&ctx))));

    let events = watcher(deployments, watcher::Config::default()).default_backoff();
    drive(events, Arc::clone(&ctx)).await;

    if let Some(sweeper) = sweeper {
        ctx.shutdown.cancel();
        if let Err(e) = sweeper.await {
            error!("Orphan sweep task failed: {}", e);
        }
    }

    info!("Deployment controller stopped");
}

/// Feed watch events through the observation cache into the worker pools
///
/// Returns once the stream ends or shutdown is requested, after the pools
/// have drained (bounded by [`SHUTDOWN_GRACE`]).
pub async fn drive<S>(events: S, ctx: Arc<Context>)
where
    S: Stream<Item = Result<watcher::Event<Deployment>, watcher::Error>>,
{
    let dispatcher = Dispatcher::start(Arc::clone(&ctx));
    let mut cache = ObservationCache::new();
    let mut events = std::pin::pin!(events);

    loop {
        let next = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            next = events.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("Deployment watch error: {}", e);
                continue;
            }
            None => break,
        };

        let initial_list_done = matches!(event, watcher::Event::InitDone);
        for observation in cache.observe(event) {
            if let Err(e) = dispatcher.dispatch(observation).await {
                error!("Failed to queue work: {}", e);
            }
        }

        if initial_list_done && INFORMER_SYNCED.get() < 1.0 {
            INFORMER_SYNCED.set(1.0);
            info!(deployments = cache.len(), "Initial Deployment list complete");
        }
    }

    debug!("Draining worker pools");
    if tokio::time::timeout(SHUTDOWN_GRACE, dispatcher.shutdown())
        .await
        .is_err()
    {
        warn!("Worker pools did not drain within {:?}", SHUTDOWN_GRACE);
    }
}

/// Periodically delete cronscalers left behind by removed shadows
pub async fn sweep_orphans(ctx: Arc<Context>) {
    let mut interval = tokio::time::interval(ctx.settings.orphan_sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        RECONCILIATIONS.with_label_values(&["orphan_sweep"]).inc();
        match mirror::collect_orphans(ctx.cluster.as_ref()).await {
            Ok(0) => debug!("No orphaned cronscalers"),
            Ok(deleted) => {
                ORPHANED_CRONSCALERS_DELETED.inc_by(deleted as f64);
                info!(deleted, "Deleted orphaned cronscalers");
            }
            Err(e) => {
                RECONCILIATION_ERRORS
                    .with_label_values(&["orphan_sweep", e.kind()])
                    .inc();
                warn!("Orphan sweep failed: {}", e);
            }
        }
    }

    debug!("Orphan sweep stopped");
}
