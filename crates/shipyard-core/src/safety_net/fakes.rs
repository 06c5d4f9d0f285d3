//! Scripted [`ReplicaRuntime`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::health::HealthCheck;
use super::rollout::{LaunchRequest, ReplicaRuntime, ReplicaSet};
use crate::domain::{Result, ShipyardError};

/// How the next launched replica set behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPlan {
    /// Every replica is healthy from the first poll.
    Healthy,
    /// Healthy once more than `n` polls have been made.
    HealthyAfterPolls(u32),
    /// Exactly `n` replicas ever become healthy.
    PartiallyHealthy(u32),
    NeverHealthy,
    /// `launch` itself returns an error.
    FailLaunch,
    /// Healthy, but `route_traffic` to it returns an error.
    FailRouting,
}

#[derive(Debug, Default)]
struct State {
    plans: VecDeque<LaunchPlan>,
    active: HashMap<String, (LaunchPlan, u32)>,
    launched: Vec<ReplicaSet>,
    routed: Vec<String>,
    retired: Vec<String>,
}

/// Replica runtime whose launches follow queued [`LaunchPlan`]s; once the
/// queue is empty every launch is [`LaunchPlan::Healthy`].
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    state: Mutex<State>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_plan(&self, plan: LaunchPlan) {
        self.state.lock().unwrap().plans.push_back(plan);
    }

    pub fn launched(&self) -> Vec<ReplicaSet> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn routed(&self) -> Vec<String> {
        self.state.lock().unwrap().routed.clone()
    }

    pub fn retired(&self) -> Vec<String> {
        self.state.lock().unwrap().retired.clone()
    }
}

#[async_trait]
impl ReplicaRuntime for ScriptedRuntime {
    async fn launch(&self, request: &LaunchRequest) -> Result<ReplicaSet> {
        let mut state = self.state.lock().unwrap();
        let plan = state.plans.pop_front().unwrap_or(LaunchPlan::Healthy);
        if plan == LaunchPlan::FailLaunch {
            return Err(ShipyardError::Deployment(format!(
                "scripted launch failure for {}",
                request.service
            )));
        }
        let id = format!(
            "{}-{}-{}",
            request.environment,
            request.service,
            state.launched.len() + 1
        );
        let set = ReplicaSet {
            id: id.clone(),
            service: request.service.clone(),
            environment: request.environment.clone(),
            image: request.image.clone(),
            replicas: request.replicas,
            endpoints: (0..request.replicas)
                .map(|i| format!("http://{id}-{i}:{}", request.container_port))
                .collect(),
        };
        state.active.insert(id, (plan, 0));
        state.launched.push(set.clone());
        Ok(set)
    }

    async fn healthy_replicas(&self, set: &ReplicaSet, _check: &HealthCheck) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let (plan, polls) = state
            .active
            .get_mut(&set.id)
            .ok_or_else(|| ShipyardError::Deployment(format!("unknown replica set {}", set.id)))?;
        *polls += 1;
        Ok(match *plan {
            LaunchPlan::Healthy | LaunchPlan::FailRouting => set.replicas,
            LaunchPlan::HealthyAfterPolls(n) if *polls > n => set.replicas,
            LaunchPlan::HealthyAfterPolls(_) => 0,
            LaunchPlan::PartiallyHealthy(n) => n.min(set.replicas),
            LaunchPlan::NeverHealthy | LaunchPlan::FailLaunch => 0,
        })
    }

    async fn route_traffic(&self, set: &ReplicaSet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if matches!(state.active.get(&set.id), Some((LaunchPlan::FailRouting, _))) {
            return Err(ShipyardError::Deployment(format!(
                "scripted routing failure for {}",
                set.id
            )));
        }
        state.routed.push(set.id.clone());
        Ok(())
    }

    async fn retire(&self, set: &ReplicaSet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(&set.id);
        state.retired.push(set.id.clone());
        Ok(())
    }
}
