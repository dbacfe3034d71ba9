//! Translation of watch events into Added / Updated / Deleted observations
//!
//! The watcher only reports the current state of an object. Deciding whether
//! anything relevant changed needs the previous state too, so the last seen
//! version of every Deployment is kept here. Relists (initial list and
//! re-lists after a watch desync) are diffed against that cache: objects seen
//! again become updates, and objects that vanished become deletions.

use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};

use super::WorkloadEvent;

type ObjectKey = (String, String);

fn key_of(deployment: &Deployment) -> ObjectKey {
    (
        deployment.namespace().unwrap_or_default(),
        deployment.name_any(),
    )
}

/// Last observed state of every Deployment
#[derive(Debug, Default)]
pub struct ObservationCache {
    known: HashMap<ObjectKey, Deployment>,
    relisting: Option<HashSet<ObjectKey>>,
}

impl ObservationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of Deployments currently known
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Feed one watch event, returning the observations it produces
    pub fn observe(&mut self, event: watcher::Event<Deployment>) -> Vec<WorkloadEvent> {
        match event {
            watcher::Event::Apply(deployment) => vec![self.apply(deployment)],
            watcher::Event::Delete(deployment) => {
                self.known.remove(&key_of(&deployment));
                vec![WorkloadEvent::Deleted(deployment)]
            }
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(deployment) => {
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(key_of(&deployment));
                }
                vec![self.apply(deployment)]
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                let vanished: Vec<ObjectKey> = self
                    .known
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(WorkloadEvent::Deleted)
                    .collect()
            }
        }
    }

    fn apply(&mut self, deployment: Deployment) -> WorkloadEvent {
        match self.known.insert(key_of(&deployment), deployment.clone()) {
            None => WorkloadEvent::Added(deployment),
            Some(old) => WorkloadEvent::Updated {
                old,
                new: deployment,
            },
        }
    }
}
