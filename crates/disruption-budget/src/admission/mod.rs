//! Decides whether a pod may be disrupted right now.
//!
//! Every admitted disruption claims one unit of `unavailableAllowed` of each governing budget by
//! a conditional status write. Concurrent requests, in this process or in other replicas, are
//! serialized by the API server through these writes alone.

use std::{fmt, sync::Arc, time::Duration};

use k8s_openapi::{
    api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp,
};
use kube::ResourceExt;
use rand::Rng;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;
use tracing::instrument;

use crate::{
    client::{self, BudgetStore, Read},
    crd::{BudgetKey, PodUnavailableBudget},
    expectations::{ObjectKey, ResourceVersionExpectations},
    pod_utils,
    workload::WorkloadResolver,
};

pub mod webhook;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("pod {pod} has no namespace"))]
    MissingNamespace { pod: String },

    #[snafu(display("failed to list the budgets in namespace {namespace}"))]
    ListBudgets {
        source: client::Error,
        namespace: String,
    },

    #[snafu(display("failed to read budget {budget}"))]
    ReadBudget {
        source: client::Error,
        budget: BudgetKey,
    },

    #[snafu(display("failed to claim a disruption of {budget}"))]
    WriteClaim {
        source: client::Error,
        budget: BudgetKey,
    },
}

/// How a pod is about to be disrupted.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum DisruptionKind {
    Eviction,
    Deletion,

    /// In-place update, the pod keeps existing but restarts containers.
    Update,
}

impl DisruptionKind {
    /// Whether claims of this kind end up in `unavailablePods` rather than `disruptedPods`.
    fn is_in_place(self) -> bool {
        self == Self::Update
    }
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum DenyReason {
    #[strum(to_string = "rate limited")]
    RateLimited,

    #[strum(to_string = "contended")]
    Contended,

    #[strum(to_string = "budget status not yet processed")]
    StatusNotProcessed,

    #[strum(to_string = "timed out")]
    Timeout,

    #[strum(to_string = "internal error")]
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allow,
    Deny {
        /// The budget refusing the disruption, if a specific one did.
        budget: Option<BudgetKey>,
        reason: DenyReason,
    },
}

impl Decision {
    fn deny(budget: &BudgetKey, reason: DenyReason) -> Self {
        Self::Deny {
            budget: Some(budget.clone()),
            reason,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allowed"),
            Self::Deny {
                budget: Some(budget),
                reason,
            } => write!(f, "denied by pod unavailable budget {budget}: {reason}"),
            Self::Deny {
                budget: None,
                reason,
            } => write!(f, "denied: {reason}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Upper bound for a single decision, including all reads and claim attempts.
    pub timeout: Duration,

    /// Allow disruptions whose decision timed out or failed, instead of denying them.
    pub fail_open: bool,

    /// Conditional writes attempted per budget before the request is denied as contended.
    pub max_claim_attempts: u32,

    /// Delay after the first conflict, doubled for every further one and jittered.
    pub conflict_backoff: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            fail_open: false,
            max_claim_attempts: 5,
            conflict_backoff: Duration::from_millis(10),
        }
    }
}

/// A single disruption request.
#[derive(Clone, Copy, Debug)]
pub struct Disruption<'a> {
    pub pod: &'a Pod,
    pub kind: DisruptionKind,

    /// Evaluate the request without recording a claim.
    pub dry_run: bool,
}

pub struct AdmissionGate {
    store: Arc<dyn BudgetStore>,
    resolver: WorkloadResolver,
    expectations: ResourceVersionExpectations,
    config: GateConfig,
}

/// The result of checking one budget.
#[derive(Debug, PartialEq)]
enum Verdict {
    /// The pod was claimed before, admitting it again consumes nothing.
    AlreadyClaimed,
    Deny(DenyReason),

    /// The budget with the claim recorded, to be written.
    Claim(Box<PodUnavailableBudget>),
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn BudgetStore>,
        resolver: WorkloadResolver,
        expectations: ResourceVersionExpectations,
        config: GateConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            expectations,
            config,
        }
    }

    /// Decides the request within [`GateConfig::timeout`]. Failures and timeouts deny, unless
    /// [`GateConfig::fail_open`] is set.
    #[instrument(skip_all, fields(k8s.pod.name = %disruption.pod.name_any(), kind = %disruption.kind))]
    pub async fn admit(&self, disruption: Disruption<'_>) -> Decision {
        let reason = match tokio::time::timeout(self.config.timeout, self.decide(disruption)).await
        {
            Ok(Ok(decision)) => {
                tracing::debug!(%decision, "decided disruption request");
                return decision;
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    fail_open = self.config.fail_open,
                    "failed to decide disruption request"
                );
                DenyReason::Failed
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.timeout,
                    fail_open = self.config.fail_open,
                    "disruption request timed out"
                );
                DenyReason::Timeout
            }
        };

        if self.config.fail_open {
            Decision::Allow
        } else {
            Decision::Deny {
                budget: None,
                reason,
            }
        }
    }

    async fn decide(&self, disruption: Disruption<'_>) -> Result<Decision> {
        let pod = disruption.pod;
        if !pod_utils::is_available(pod) {
            tracing::debug!("pod is already unavailable, nothing to claim");
            return Ok(Decision::Allow);
        }

        let budgets = self.governing_budgets(pod).await?;
        if budgets.is_empty() {
            return Ok(Decision::Allow);
        }

        // Check all budgets before claiming anything, so a denying budget does not leave
        // claims in the others behind.
        let pod_name = pod.name_any();
        let now = Timestamp::now();
        for key in &budgets {
            if let Some(budget) = self.read_budget(key, Read::Cached).await? {
                if let Verdict::Deny(reason) = evaluate(&budget, &pod_name, disruption.kind, now) {
                    return Ok(Decision::deny(key, reason));
                }
            }
        }

        for key in &budgets {
            let decision = self.claim(key, &pod_name, disruption).await?;
            if !decision.is_allowed() {
                return Ok(decision);
            }
        }
        Ok(Decision::Allow)
    }

    async fn governing_budgets(&self, pod: &Pod) -> Result<Vec<BudgetKey>> {
        let namespace = pod.namespace().context(MissingNamespaceSnafu {
            pod: pod.name_any(),
        })?;
        let budgets = self
            .store
            .list_budgets(&namespace)
            .await
            .context(ListBudgetsSnafu {
                namespace: &namespace,
            })?;

        let mut governing = Vec::new();
        for budget in budgets {
            let Ok(key) = budget.key() else {
                continue;
            };
            match self.resolver.governs(&budget, pod).await {
                Ok(true) => governing.push(key),
                Ok(false) => {}
                // A broken budget must not block every pod in its namespace
                Err(error) => tracing::warn!(
                    k8s.budget.name = %key.name,
                    error = &error as &dyn std::error::Error,
                    "ignoring budget which cannot be evaluated"
                ),
            }
        }
        Ok(governing)
    }

    /// Reads the budget, from the API server if the cached copy is older than a version this
    /// process already saw.
    async fn read_budget(
        &self,
        key: &BudgetKey,
        read: Read,
    ) -> Result<Option<PodUnavailableBudget>> {
        let budget = self
            .store
            .get_budget(key, read)
            .await
            .context(ReadBudgetSnafu { budget: key.clone() })?;

        let stale = read == Read::Cached
            && budget.as_ref().is_some_and(|budget| {
                !self.expectations.is_satisfied(
                    &ObjectKey::from(key),
                    budget.metadata.resource_version.as_deref().unwrap_or_default(),
                )
            });
        if !stale {
            return Ok(budget);
        }

        tracing::debug!(k8s.budget.name = %key.name, "cached budget is stale, reading it live");
        self.store
            .get_budget(key, Read::Live)
            .await
            .context(ReadBudgetSnafu { budget: key.clone() })
    }

    /// Claims one disruption of the budget for the pod, retrying conflicting writes.
    #[instrument(skip(self, disruption), fields(k8s.budget = %key))]
    async fn claim(
        &self,
        key: &BudgetKey,
        pod_name: &str,
        disruption: Disruption<'_>,
    ) -> Result<Decision> {
        let mut read = Read::Cached;
        for attempt in 1..=self.config.max_claim_attempts {
            let Some(budget) = self.read_budget(key, read).await? else {
                // deleted in the meantime, it does not govern anything anymore
                return Ok(Decision::Allow);
            };

            let claimed = match evaluate(&budget, pod_name, disruption.kind, Timestamp::now()) {
                Verdict::AlreadyClaimed => return Ok(Decision::Allow),
                Verdict::Deny(reason) => return Ok(Decision::deny(key, reason)),
                Verdict::Claim(claimed) => claimed,
            };
            if disruption.dry_run {
                return Ok(Decision::Allow);
            }

            match self.store.replace_status(&claimed).await {
                Ok(written) => {
                    if let Some(resource_version) = written.metadata.resource_version.as_deref() {
                        self.expectations
                            .observe(&ObjectKey::from(key), resource_version);
                    }
                    tracing::info!(
                        k8s.budget.name = %key.name,
                        pod = pod_name,
                        unavailable_allowed = written
                            .status
                            .as_ref()
                            .map_or(0, |status| status.unavailable_allowed),
                        "claimed disruption"
                    );
                    return Ok(Decision::Allow);
                }
                Err(error) if error.is_conflict() => {
                    let delay = jittered(self.config.conflict_backoff, attempt);
                    tracing::debug!(attempt, ?delay, "claim conflicted, retrying");
                    tokio::time::sleep(delay).await;
                    read = Read::Live;
                }
                Err(error) => {
                    return Err(error).context(WriteClaimSnafu { budget: key.clone() });
                }
            }
        }

        tracing::info!(
            attempts = self.config.max_claim_attempts,
            "claim attempts exhausted"
        );
        Ok(Decision::deny(key, DenyReason::Contended))
    }
}

/// Checks whether the budget allows disrupting the pod, and if so records the claim.
fn evaluate(
    budget: &PodUnavailableBudget,
    pod_name: &str,
    kind: DisruptionKind,
    now: Timestamp,
) -> Verdict {
    if !budget.status_is_current() {
        return Verdict::Deny(DenyReason::StatusNotProcessed);
    }
    let Some(status) = &budget.status else {
        return Verdict::Deny(DenyReason::StatusNotProcessed);
    };

    if status.disrupted_pods.contains_key(pod_name) || status.unavailable_pods.contains_key(pod_name)
    {
        return Verdict::AlreadyClaimed;
    }
    if status.unavailable_allowed <= 0 {
        return Verdict::Deny(DenyReason::RateLimited);
    }

    let mut claimed = budget.clone();
    let status = claimed.status.get_or_insert_with(Default::default);
    let claims = if kind.is_in_place() {
        &mut status.unavailable_pods
    } else {
        &mut status.disrupted_pods
    };
    claims.insert(pod_name.to_string(), Time(now));
    status.unavailable_allowed -= 1;
    Verdict::Claim(Box::new(claimed))
}

fn jittered(base: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::rng().random_range(0.0..=0.5);
    delay.mul_f64(1.0 + jitter)
}
