//! Routing of observations to bounded worker pools
//!
//! Each observation is planned into at most one enforcement job and one
//! mirror job. Jobs of each kind go to their own pool so that a slow rollout
//! wait never delays shadow maintenance. Within a pool, every job for the same
//! Deployment lands on the same worker and runs in arrival order. Submission
//! waits for queue space, which throttles the watch stream instead of
//! spawning unbounded tasks.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::{Context, WorkloadEvent};
use crate::config::Settings;
use crate::metrics::{
    MIRROR_SYNCS, RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS,
    SKIPPED_ENFORCEMENTS,
};
use crate::reconcilers::mirror::{self, is_mirror_eligible};
use crate::reconcilers::resources::{self, designated_resources, EnforceOutcome};
use crate::{Error, Result};

/// Shadow maintenance for one source Deployment
#[derive(Clone, Debug, PartialEq)]
pub enum MirrorJob {
    Sync(Deployment),
    Remove(Deployment),
}

impl MirrorJob {
    pub fn source(&self) -> &Deployment {
        match self {
            MirrorJob::Sync(source) | MirrorJob::Remove(source) => source,
        }
    }
}

/// Routing key of a Deployment
fn object_key(deployment: &Deployment) -> (String, String) {
    (
        deployment.namespace().unwrap_or_default(),
        deployment.name_any(),
    )
}

/// Work derived from a single observation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub enforce: Option<Deployment>,
    pub mirror: Option<MirrorJob>,
}

/// Decide which jobs an observation calls for
pub fn plan(event: WorkloadEvent, settings: &Settings) -> Plan {
    let enforcing = settings.features.enforce_resources && settings.resource_policy.is_some();
    let mirroring = settings.features.mirror_deployments;
    let admitted = |d: &Deployment| {
        d.namespace()
            .is_some_and(|ns| settings.namespaces.admits(&ns))
    };

    match event {
        WorkloadEvent::Added(deployment) => Plan {
            enforce: (enforcing && admitted(&deployment)).then(|| deployment.clone()),
            mirror: (mirroring && is_mirror_eligible(&deployment, &settings.mirror))
                .then(|| MirrorJob::Sync(deployment)),
        },
        WorkloadEvent::Updated { old, new } => {
            let resources_changed = designated_resources(&old, &settings.container_name)
                != designated_resources(&new, &settings.container_name);
            Plan {
                enforce: (enforcing && resources_changed && admitted(&new)).then(|| new.clone()),
                mirror: (mirroring
                    && old.spec != new.spec
                    && is_mirror_eligible(&new, &settings.mirror))
                .then(|| MirrorJob::Sync(new)),
            }
        }
        WorkloadEvent::Deleted(deployment) => Plan {
            enforce: None,
            mirror: (mirroring && is_mirror_eligible(&deployment, &settings.mirror))
                .then(|| MirrorJob::Remove(deployment)),
        },
    }
}

/// Fixed number of workers, each draining its own bounded queue
///
/// Jobs are routed by key, so jobs sharing a key never run concurrently and
/// complete in the order they were submitted.
pub struct WorkerPool<J> {
    kind: &'static str,
    senders: Vec<mpsc::Sender<J>>,
    tracker: TaskTracker,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `workers` tasks that run `handler` for every submitted job
    ///
    /// `queue_depth` bounds the jobs waiting across the whole pool.
    pub fn spawn<F, Fut>(kind: &'static str, workers: usize, queue_depth: usize, handler: F) -> Self
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let workers = workers.max(1);
        let per_worker = queue_depth.div_ceil(workers).max(1);
        let handler = Arc::new(handler);
        let tracker = TaskTracker::new();

        let senders = (0..workers)
            .map(|worker| {
                let (sender, mut receiver) = mpsc::channel(per_worker);
                let handler = Arc::clone(&handler);
                tracker.spawn(async move {
                    while let Some(job) = receiver.recv().await {
                        handler(job).await;
                    }
                    debug!(kind, worker, "Worker stopped");
                });
                sender
            })
            .collect();
        tracker.close();

        debug!(kind, workers, queue_depth, "Started worker pool");
        Self {
            kind,
            senders,
            tracker,
        }
    }

    /// Worker that owns `key`
    fn route<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a job on the worker owning `key`, waiting while its queue is full
    pub async fn submit<K: Hash + ?Sized>(&self, key: &K, job: J) -> Result<()> {
        self.senders[self.route(key)]
            .send(job)
            .await
            .map_err(|_| Error::QueueClosed(self.kind))
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(self) {
        drop(self.senders);
        self.tracker.wait().await;
        debug!(kind = self.kind, "Worker pool drained");
    }
}

/// Owns the worker pools and feeds them planned jobs
pub struct Dispatcher {
    settings: Arc<Settings>,
    enforcement: Option<WorkerPool<Deployment>>,
    mirror: Option<WorkerPool<MirrorJob>>,
}

impl Dispatcher {
    /// Start a pool for every enabled feature
    pub fn start(ctx: Arc<Context>) -> Self {
        let settings = Arc::clone(&ctx.settings);
        let workers = &settings.workers;

        let enforcement = settings.features.enforce_resources.then(|| {
            let ctx = Arc::clone(&ctx);
            WorkerPool::spawn(
                "enforcement",
                workers.enforcement,
                workers.queue_depth,
                move |deployment| run_enforcement(deployment, Arc::clone(&ctx)),
            )
        });

        let mirror = settings.features.mirror_deployments.then(|| {
            let ctx = Arc::clone(&ctx);
            WorkerPool::spawn("mirror", workers.mirror, workers.queue_depth, move |job| {
                run_mirror(job, Arc::clone(&ctx))
            })
        });

        Self {
            settings,
            enforcement,
            mirror,
        }
    }

    /// Plan `event` and queue the resulting jobs
    pub async fn dispatch(&self, event: WorkloadEvent) -> Result<()> {
        let Plan { enforce, mirror } = plan(event, &self.settings);

        if let (Some(deployment), Some(pool)) = (enforce, self.enforcement.as_ref()) {
            pool.submit(&object_key(&deployment), deployment).await?;
        }
        if let (Some(job), Some(pool)) = (mirror, self.mirror.as_ref()) {
            pool.submit(&object_key(job.source()), job).await?;
        }
        Ok(())
    }

    /// Drain both pools
    pub async fn shutdown(self) {
        let enforcement = async {
            if let Some(pool) = self.enforcement {
                pool.shutdown().await;
            }
        };
        let mirror = async {
            if let Some(pool) = self.mirror {
                pool.shutdown().await;
            }
        };
        tokio::join!(enforcement, mirror);
    }
}

async fn run_enforcement(deployment: Deployment, ctx: Arc<Context>) {
    let Some(policy) = ctx.settings.resource_policy.as_ref() else {
        return;
    };

    let kind = "enforcement";
    let start = Instant::now();
    RECONCILIATIONS.with_label_values(&[kind]).inc();

    let result = resources::enforce(&deployment, policy, &ctx).await;
    RECONCILE_DURATION
        .with_label_values(&[kind])
        .observe(start.elapsed().as_secs_f64());

    match result {
        Ok(EnforceOutcome::Applied) => {}
        Ok(outcome) => {
            SKIPPED_ENFORCEMENTS
                .with_label_values(&[outcome.as_str()])
                .inc();
        }
        Err(e) => {
            RECONCILIATION_ERRORS
                .with_label_values(&[kind, e.kind()])
                .inc();
            error!(
                namespace = deployment.namespace().unwrap_or_default(),
                name = %deployment.name_any(),
                error = %e,
                "Resource enforcement failed"
            );
        }
    }
}

async fn run_mirror(job: MirrorJob, ctx: Arc<Context>) {
    let policy = &ctx.settings.mirror;
    let cluster = ctx.cluster.as_ref();
    let start = Instant::now();

    let (kind, source, result) = match &job {
        MirrorJob::Sync(source) => {
            let result = mirror::sync_shadow(source, policy, cluster).await.map(|outcome| {
                MIRROR_SYNCS.with_label_values(&[outcome.as_str()]).inc();
            });
            ("mirror_sync", source, result)
        }
        MirrorJob::Remove(source) => {
            let result = mirror::remove_shadow(source, policy, cluster).await;
            ("mirror_remove", source, result)
        }
    };

    RECONCILIATIONS.with_label_values(&[kind]).inc();
    RECONCILE_DURATION
        .with_label_values(&[kind])
        .observe(start.elapsed().as_secs_f64());

    if let Err(e) = result {
        RECONCILIATION_ERRORS
            .with_label_values(&[kind, e.kind()])
            .inc();
        error!(
            namespace = source.namespace().unwrap_or_default(),
            name = %source.name_any(),
            error = %e,
            "{} failed", kind
        );
    } else {
        info!(
            namespace = source.namespace().unwrap_or_default(),
            name = %source.name_any(),
            "{} complete", kind
        );
    }
}
