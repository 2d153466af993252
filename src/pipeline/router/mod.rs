//! Multi-endpoint routing with per-endpoint failure isolation.
//!
//! Each endpoint carries its own [`CircuitBreaker`]. `route` walks the
//! preference list for a task type and hands out a [`Lease`] on the first
//! endpoint whose breaker grants a permit; the caller must `report` the
//! outcome of the call made with that lease. Breaker state lives behind one
//! mutex per endpoint and is shared by every concurrent run.

pub mod breaker;

pub use breaker::{CircuitBreaker, CircuitState, Permit};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::Stage;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN_SECS: f64 = 300.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("No available endpoint for {stage} stage")]
    NoAvailableEndpoint { stage: Stage },
}

// ──────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────

/// One text-generation endpoint as configured (`[[endpoints]]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub base_url: String,
    /// Model identifier sent to the endpoint; defaults to `name`.
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Task types this endpoint serves. Empty means all.
    #[serde(default)]
    pub task_affinity: Vec<Stage>,
    #[serde(default)]
    pub cost_per_1k: f64,
    #[serde(default = "default_max_context")]
    pub max_context: u32,
    /// 1 = fastest.
    #[serde(default = "default_tier")]
    pub speed_tier: u8,
    /// 3 = strongest.
    #[serde(default = "default_tier")]
    pub capability_tier: u8,
}

fn default_max_context() -> u32 {
    64_000
}

fn default_tier() -> u8 {
    2
}

impl EndpointSpec {
    pub fn new(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            model: None,
            api_key_env: None,
            task_affinity: Vec::new(),
            cost_per_1k: 0.0,
            max_context: default_max_context(),
            speed_tier: default_tier(),
            capability_tier: default_tier(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.name)
    }

    pub fn serves(&self, stage: Stage) -> bool {
        self.task_affinity.is_empty() || self.task_affinity.contains(&stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub failure_threshold: u32,
    /// Seconds an OPEN endpoint waits before its HALF_OPEN probe.
    pub cooldown_secs: f64,
    /// Endpoint names per task type, most preferred first.
    pub preferences: HashMap<Stage, Vec<String>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            preferences: HashMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_COOLDOWN_SECS))
    }
}

// ──────────────────────────────────────────────
// Router
// ──────────────────────────────────────────────

/// Outcome of a call made under a [`Lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Permission to call one endpoint. Report its outcome exactly once.
#[derive(Debug, Clone)]
pub struct Lease {
    index: usize,
    permit: Permit,
    endpoint: Arc<EndpointSpec>,
}

impl Lease {
    pub fn endpoint(&self) -> &EndpointSpec {
        &self.endpoint
    }

    pub fn is_probe(&self) -> bool {
        self.permit == Permit::Probe
    }
}

/// Serializable view of one endpoint for `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub model: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub task_affinity: Vec<Stage>,
    pub cost_per_1k: f64,
    pub max_context: u32,
    pub speed_tier: u8,
    pub capability_tier: u8,
}

struct Endpoint {
    spec: Arc<EndpointSpec>,
    breaker: Mutex<CircuitBreaker>,
}

pub struct ModelRouter {
    endpoints: Vec<Endpoint>,
    by_name: HashMap<String, usize>,
    preferences: HashMap<Stage, Vec<String>>,
}

impl ModelRouter {
    pub fn new(endpoints: Vec<EndpointSpec>, config: &RouterConfig) -> Self {
        let cooldown = config.cooldown();
        let mut by_name = HashMap::new();
        let mut registered = Vec::with_capacity(endpoints.len());
        for spec in endpoints {
            if by_name.contains_key(&spec.name) {
                tracing::warn!(endpoint = %spec.name, "Duplicate endpoint name ignored");
                continue;
            }
            by_name.insert(spec.name.clone(), registered.len());
            registered.push(Endpoint {
                spec: Arc::new(spec),
                breaker: Mutex::new(CircuitBreaker::new(config.failure_threshold, cooldown)),
            });
        }

        Self {
            endpoints: registered,
            by_name,
            preferences: config.preferences.clone(),
        }
    }

    pub fn route(&self, stage: Stage) -> Result<Lease, RouterError> {
        self.route_with(stage, None, 0)
    }

    /// Route using `preferences` (falling back to the configured order, then
    /// to the endpoint profile order), skipping endpoints whose context window
    /// is smaller than `estimated_tokens`. When no healthy endpoint fits, the
    /// healthy one with the largest context window is used.
    pub fn route_with(
        &self,
        stage: Stage,
        preferences: Option<&[String]>,
        estimated_tokens: u32,
    ) -> Result<Lease, RouterError> {
        let (fitting, mut oversize): (Vec<usize>, Vec<usize>) = self
            .candidates(stage, preferences)
            .into_iter()
            .partition(|&i| {
                estimated_tokens == 0 || self.endpoints[i].spec.max_context >= estimated_tokens
            });

        if let Some(lease) = fitting.into_iter().find_map(|i| self.lease(i, stage)) {
            return Ok(lease);
        }

        // Largest window first; the sort is stable so ties keep candidate order.
        oversize.sort_by_key(|&i| std::cmp::Reverse(self.endpoints[i].spec.max_context));
        if let Some(lease) = oversize.into_iter().find_map(|i| self.lease(i, stage)) {
            tracing::warn!(
                endpoint = %lease.endpoint.name,
                estimated_tokens,
                max_context = lease.endpoint.max_context,
                "No endpoint fits the prompt, using largest context window"
            );
            return Ok(lease);
        }

        tracing::warn!(%stage, "No available endpoint");
        Err(RouterError::NoAvailableEndpoint { stage })
    }

    fn lease(&self, index: usize, stage: Stage) -> Option<Lease> {
        let endpoint = &self.endpoints[index];
        let permit = lock(&endpoint.breaker).try_acquire()?;
        if permit == Permit::Probe {
            tracing::info!(endpoint = %endpoint.spec.name, %stage, "Half-open probe");
        }
        Some(Lease {
            index,
            permit,
            endpoint: Arc::clone(&endpoint.spec),
        })
    }

    pub fn report(&self, lease: &Lease, outcome: CallOutcome) {
        let Some(endpoint) = self.endpoints.get(lease.index) else {
            return;
        };
        let mut breaker = lock(&endpoint.breaker);
        let before = breaker.state();
        match outcome {
            CallOutcome::Success => breaker.record_success(lease.permit),
            CallOutcome::Failure => breaker.record_failure(lease.permit),
        }
        let after = breaker.state();
        drop(breaker);

        if before != after {
            tracing::info!(
                endpoint = %endpoint.spec.name,
                from = ?before,
                to = ?after,
                "Circuit state changed"
            );
        }
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .map(|e| {
                let breaker = lock(&e.breaker);
                EndpointStatus {
                    name: e.spec.name.clone(),
                    model: e.spec.model_name().to_string(),
                    state: breaker.state(),
                    consecutive_failures: breaker.consecutive_failures(),
                    task_affinity: e.spec.task_affinity.clone(),
                    cost_per_1k: e.spec.cost_per_1k,
                    max_context: e.spec.max_context,
                    speed_tier: e.spec.speed_tier,
                    capability_tier: e.spec.capability_tier,
                }
            })
            .collect()
    }

    /// Ordered candidate indices for a stage.
    fn candidates(&self, stage: Stage, preferences: Option<&[String]>) -> Vec<usize> {
        let explicit = preferences
            .filter(|p| !p.is_empty())
            .or_else(|| self.preferences.get(&stage).map(Vec::as_slice))
            .filter(|p| !p.is_empty());

        if let Some(names) = explicit {
            let mut order = Vec::with_capacity(names.len());
            for name in names {
                match self.by_name.get(name) {
                    Some(&i) if self.endpoints[i].spec.serves(stage) && !order.contains(&i) => {
                        order.push(i)
                    }
                    Some(_) => {}
                    None => tracing::debug!(endpoint = %name, "Unknown endpoint in preferences"),
                }
            }
            return order;
        }

        let mut order: Vec<usize> = (0..self.endpoints.len())
            .filter(|&i| self.endpoints[i].spec.serves(stage))
            .collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.endpoints[a].spec, &self.endpoints[b].spec);
            profile_key(stage, a)
                .cmp(&profile_key(stage, b))
                .then(a.cost_per_1k.total_cmp(&b.cost_per_1k))
        });
        order
    }
}

/// Primary sort key when no preference list exists: quick tasks favour
/// speed, the final verdict favours capability, code analysis sits in the
/// middle tier. Ties break on cost.
fn profile_key(stage: Stage, spec: &EndpointSpec) -> i32 {
    match stage {
        Stage::Manual | Stage::Log => i32::from(spec.speed_tier),
        Stage::Boss => -i32::from(spec.capability_tier),
        Stage::Code => (i32::from(spec.capability_tier) - 2).abs(),
    }
}

fn lock(m: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    // A poisoned breaker still holds a consistent state machine.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn config(cooldown_secs: f64) -> RouterConfig {
        RouterConfig {
            failure_threshold: 3,
            cooldown_secs,
            preferences: HashMap::from([(
                Stage::Log,
                vec!["a".to_string(), "b".to_string()],
            )]),
        }
    }

    fn two_endpoints(cooldown_secs: f64) -> ModelRouter {
        ModelRouter::new(
            vec![
                EndpointSpec::new("a", "http://a.local/v1"),
                EndpointSpec::new("b", "http://b.local/v1"),
            ],
            &config(cooldown_secs),
        )
    }

    fn fail_three_times(router: &ModelRouter, stage: Stage) {
        for _ in 0..3 {
            let lease = router.route(stage).unwrap();
            assert_eq!(lease.endpoint().name, "a");
            router.report(&lease, CallOutcome::Failure);
        }
    }

    #[test]
    fn routes_in_preference_order() {
        let router = two_endpoints(60.0);
        let lease = router.route(Stage::Log).unwrap();
        assert_eq!(lease.endpoint().name, "a");
        assert!(!lease.is_probe());
    }

    #[test]
    fn three_failures_open_then_single_probe() {
        let router = two_endpoints(0.01);
        fail_three_times(&router, Stage::Log);
        assert_eq!(router.status()[0].state, CircuitState::Open);

        // While open, traffic goes to b.
        let lease = router.route(Stage::Log).unwrap();
        assert_eq!(lease.endpoint().name, "b");
        router.report(&lease, CallOutcome::Success);

        std::thread::sleep(Duration::from_millis(20));

        let probe = router.route(Stage::Log).unwrap();
        assert_eq!(probe.endpoint().name, "a");
        assert!(probe.is_probe());

        // Probe outstanding: the next caller is served by b.
        let other = router.route(Stage::Log).unwrap();
        assert_eq!(other.endpoint().name, "b");

        router.report(&probe, CallOutcome::Success);
        assert_eq!(router.status()[0].state, CircuitState::Closed);
        assert_eq!(router.route(Stage::Log).unwrap().endpoint().name, "a");
    }

    #[test]
    fn failed_probe_reopens() {
        let router = two_endpoints(0.01);
        fail_three_times(&router, Stage::Log);
        std::thread::sleep(Duration::from_millis(20));

        let probe = router.route(Stage::Log).unwrap();
        router.report(&probe, CallOutcome::Failure);
        assert_eq!(router.status()[0].state, CircuitState::Open);
        assert_eq!(router.route(Stage::Log).unwrap().endpoint().name, "b");
    }

    #[test]
    fn all_open_is_no_available_endpoint() {
        let router = ModelRouter::new(
            vec![EndpointSpec::new("a", "http://a.local/v1")],
            &config(60.0),
        );
        fail_three_times(&router, Stage::Log);
        assert_eq!(
            router.route(Stage::Log).unwrap_err(),
            RouterError::NoAvailableEndpoint { stage: Stage::Log }
        );
    }

    #[test]
    fn concurrent_routers_grant_one_probe() {
        let router = two_endpoints(0.01);
        fail_three_times(&router, Stage::Log);
        std::thread::sleep(Duration::from_millis(20));

        let barrier = Barrier::new(8);
        let leases: Vec<Lease> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        router.route(Stage::Log).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let probes = leases.iter().filter(|l| l.endpoint().name == "a").count();
        assert_eq!(probes, 1);
        assert_eq!(leases.iter().filter(|l| l.is_probe()).count(), 1);
    }

    #[test]
    fn request_preferences_override_configured() {
        let router = two_endpoints(60.0);
        let prefs = vec!["b".to_string()];
        let lease = router.route_with(Stage::Log, Some(&prefs), 0).unwrap();
        assert_eq!(lease.endpoint().name, "b");
    }

    #[test]
    fn unknown_preferences_are_skipped() {
        let router = two_endpoints(60.0);
        let prefs = vec!["missing".to_string(), "b".to_string()];
        let lease = router.route_with(Stage::Log, Some(&prefs), 0).unwrap();
        assert_eq!(lease.endpoint().name, "b");
    }

    #[test]
    fn profile_order_without_preferences() {
        let mut fast = EndpointSpec::new("fast", "http://fast/v1");
        fast.speed_tier = 1;
        fast.capability_tier = 2;
        fast.cost_per_1k = 0.0001;
        let mut strong = EndpointSpec::new("strong", "http://strong/v1");
        strong.speed_tier = 3;
        strong.capability_tier = 3;
        strong.cost_per_1k = 0.0025;
        let mut weak = EndpointSpec::new("weak", "http://weak/v1");
        weak.speed_tier = 2;
        weak.capability_tier = 1;
        weak.cost_per_1k = 0.00005;

        let router = ModelRouter::new(vec![strong, weak, fast], &RouterConfig::default());
        assert_eq!(router.route(Stage::Manual).unwrap().endpoint().name, "fast");
        assert_eq!(router.route(Stage::Boss).unwrap().endpoint().name, "strong");
        assert_eq!(router.route(Stage::Code).unwrap().endpoint().name, "fast");
    }

    #[test]
    fn affinity_and_context_filter() {
        let mut boss_only = EndpointSpec::new("boss-only", "http://x/v1");
        boss_only.task_affinity = vec![Stage::Boss];
        let mut small = EndpointSpec::new("small", "http://y/v1");
        small.max_context = 1_000;
        let big = EndpointSpec::new("big", "http://z/v1");

        let router = ModelRouter::new(
            vec![boss_only, small, big],
            &RouterConfig::default(),
        );
        let prefs: Vec<String> = ["boss-only", "small", "big"].map(String::from).to_vec();
        let lease = router.route_with(Stage::Log, Some(&prefs), 5_000).unwrap();
        assert_eq!(lease.endpoint().name, "big");
        let lease = router.route_with(Stage::Log, Some(&prefs), 500).unwrap();
        assert_eq!(lease.endpoint().name, "small");
    }

    #[test]
    fn oversized_prompt_falls_back_to_largest_context() {
        let mut small = EndpointSpec::new("small", "http://s/v1");
        small.max_context = 8_000;
        let mut big = EndpointSpec::new("big", "http://b/v1");
        big.max_context = 32_000;
        let router = ModelRouter::new(vec![small, big], &RouterConfig::default());

        let lease = router.route_with(Stage::Log, None, 40_000).unwrap();
        assert_eq!(lease.endpoint().name, "big");
    }

    #[test]
    fn largest_context_fallback_respects_open_circuit() {
        let mut small = EndpointSpec::new("small", "http://s/v1");
        small.max_context = 8_000;
        let mut big = EndpointSpec::new("big", "http://b/v1");
        big.max_context = 32_000;
        let router = ModelRouter::new(
            vec![small, big],
            &RouterConfig {
                failure_threshold: 1,
                cooldown_secs: 60.0,
                preferences: HashMap::new(),
            },
        );

        let lease = router.route_with(Stage::Log, None, 40_000).unwrap();
        router.report(&lease, CallOutcome::Failure);
        assert_eq!(router.status()[1].state, CircuitState::Open);

        let lease = router.route_with(Stage::Log, None, 40_000).unwrap();
        assert_eq!(lease.endpoint().name, "small");
        router.report(&lease, CallOutcome::Failure);
        assert_eq!(
            router.route_with(Stage::Log, None, 40_000).unwrap_err(),
            RouterError::NoAvailableEndpoint { stage: Stage::Log }
        );
    }

    #[test]
    fn status_lists_every_endpoint() {
        let router = two_endpoints(60.0);
        let status = router.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].name, "b");
        assert_eq!(status[1].state, CircuitState::Closed);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json[0]["state"], "CLOSED");
    }
}
