//! Keeps the status of every [`PodUnavailableBudget`] in line with its governed pods.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use k8s_openapi::jiff::Timestamp;
use kube::{ResourceExt, runtime::controller::Action};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::instrument;

use crate::{
    availability::{self, Observation},
    client::{self, BudgetStore, Read},
    crd::{
        BudgetKey, InvalidBudgetError, MissingMetadataError, PodUnavailableBudget,
        PodUnavailableBudgetStatus,
    },
    expectations::{ObjectKey, ResourceVersionExpectations},
    logging::controller::ReconcilerError,
    workload::{WorkloadResolver, resolver},
};

pub mod controller;

pub use controller::{BudgetController, Caches};

pub const CONTROLLER_NAME: &str = "podunavailablebudget";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("budget is missing metadata"))]
    MissingMetadata { source: MissingMetadataError },

    #[snafu(display("failed to read budget {budget}"))]
    ReadBudget {
        source: client::Error,
        budget: BudgetKey,
    },

    #[snafu(display("invalid budget {budget}"))]
    InvalidBudget {
        source: InvalidBudgetError,
        budget: BudgetKey,
    },

    #[snafu(display("failed to resolve the pods governed by {budget}"))]
    ResolvePods {
        source: resolver::Error,
        budget: BudgetKey,
    },

    #[snafu(display("failed to write the status of {budget}"))]
    WriteStatus {
        source: client::Error,
        budget: BudgetKey,
    },

    #[snafu(display("the status of {budget} still conflicted after {attempts} attempts"))]
    ConflictRetriesExhausted { budget: BudgetKey, attempts: u32 },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Claims in `disruptedPods` and `unavailablePods` older than this are dropped.
    pub claim_ttl: Duration,

    /// Status writes attempted per reconciliation before giving up on conflicts.
    pub max_status_attempts: u32,

    /// Budgets without claims are reconciled again after this time, even without changes.
    pub resync_period: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(120),
            max_status_attempts: 5,
            resync_period: Duration::from_secs(300),
        }
    }
}

/// Shared state of all reconciliations.
pub struct Context {
    pub store: Arc<dyn BudgetStore>,
    pub resolver: WorkloadResolver,
    pub expectations: ResourceVersionExpectations,
    pub failures: FailureBackoff,
    pub config: ReconcilerConfig,
}

/// Exponentially growing retry delays of budgets whose reconciliation keeps failing.
pub struct FailureBackoff {
    initial: Duration,
    max: Duration,
    budgets: Mutex<HashMap<BudgetKey, ExponentialBackoff>>,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(300))
    }
}

impl FailureBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            budgets: Mutex::default(),
        }
    }

    /// Delay before retrying the budget after another failure.
    pub fn next_delay(&self, key: &BudgetKey) -> Duration {
        let mut budgets = self.lock();
        let backoff = budgets.entry(key.clone()).or_insert_with(|| {
            ExponentialBackoffBuilder::new()
                .with_initial_interval(self.initial)
                .with_max_interval(self.max)
                .with_max_elapsed_time(None)
                .build()
        });
        backoff.next_backoff().unwrap_or(self.max)
    }

    pub fn reset(&self, key: &BudgetKey) {
        self.lock().remove(key);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BudgetKey, ExponentialBackoff>> {
        self.budgets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a reconciliation did.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The budget does not exist (anymore).
    Deleted,

    /// The stored status was already up to date, nothing was written.
    Unchanged { requeue_after: Option<Duration> },

    /// A new status was written.
    Updated {
        status: PodUnavailableBudgetStatus,
        requeue_after: Option<Duration>,
    },
}

impl Outcome {
    /// When the budget needs to be looked at again even without any event, because claims
    /// expire.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Deleted => None,
            Self::Unchanged { requeue_after } | Self::Updated { requeue_after, .. } => {
                *requeue_after
            }
        }
    }
}

/// Reconciles a budget delivered by the [`BudgetController`].
///
/// Budgets are looked at again once their oldest claim expires, or after
/// [`ReconcilerConfig::resync_period`] without claims.
pub async fn reconcile(budget: Arc<PodUnavailableBudget>, ctx: Arc<Context>) -> Result<Action> {
    let key = budget.key().context(MissingMetadataSnafu)?;
    let outcome = reconcile_budget(&key, &ctx).await?;
    ctx.failures.reset(&key);

    Ok(match outcome {
        Outcome::Deleted => Action::await_change(),
        outcome => Action::requeue(
            outcome
                .requeue_after()
                .unwrap_or(ctx.config.resync_period),
        ),
    })
}

/// Retries failed budgets with exponential backoff. Invalid budgets wait for a change of their
/// spec instead.
pub fn error_policy(
    budget: Arc<PodUnavailableBudget>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    match (error, budget.key()) {
        (Error::InvalidBudget { .. } | Error::MissingMetadata { .. }, _) | (_, Err(_)) => {
            Action::await_change()
        }
        (_, Ok(key)) => {
            let delay = ctx.failures.next_delay(&key);
            tracing::debug!(%key, ?delay, category = error.category(), "retrying failed budget");
            Action::requeue(delay)
        }
    }
}

/// Recomputes and persists the status of the budget identified by `key`.
///
/// The status is written conditionally on the resource version it was computed from. On
/// conflicts, the budget is read again from the API server and the status recomputed, up to
/// [`ReconcilerConfig::max_status_attempts`] times.
#[instrument(skip(ctx), fields(k8s.budget = %key))]
pub async fn reconcile_budget(key: &BudgetKey, ctx: &Context) -> Result<Outcome> {
    let object_key = ObjectKey::from(key);
    let mut read = Read::Cached;

    for attempt in 1..=ctx.config.max_status_attempts.max(1) {
        let Some(budget) = read_budget(key, &object_key, read, ctx).await? else {
            ctx.expectations.delete(&object_key);
            return Ok(Outcome::Deleted);
        };

        let status = compute_status(key, &budget, ctx).await?;
        let requeue_after = next_claim_expiry(&status, ctx.config.claim_ttl, Timestamp::now());
        if budget.status.as_ref() == Some(&status) {
            tracing::debug!("status is up to date");
            return Ok(Outcome::Unchanged { requeue_after });
        }

        let mut updated = budget.clone();
        updated.status = Some(status.clone());
        match ctx.store.replace_status(&updated).await {
            Ok(written) => {
                if let Some(resource_version) = written.resource_version() {
                    ctx.expectations.observe(&object_key, &resource_version);
                }
                tracing::info!(
                    total = status.total_replicas,
                    current = status.current_available,
                    desired = status.desired_available,
                    allowed = status.unavailable_allowed,
                    "updated budget status"
                );
                return Ok(Outcome::Updated {
                    status,
                    requeue_after,
                });
            }
            Err(error) if error.is_conflict() => {
                tracing::debug!(attempt, "status write conflicted, retrying with a live read");
                read = Read::Live;
            }
            Err(source) => {
                return Err(source).context(WriteStatusSnafu {
                    budget: key.clone(),
                });
            }
        }
    }

    ConflictRetriesExhaustedSnafu {
        budget: key.clone(),
        attempts: ctx.config.max_status_attempts.max(1),
    }
    .fail()
}

/// Reads the budget, falling back to a live read if the cached copy is older than a version
/// this process already wrote.
async fn read_budget(
    key: &BudgetKey,
    object_key: &ObjectKey,
    read: Read,
    ctx: &Context,
) -> Result<Option<PodUnavailableBudget>> {
    let budget = ctx
        .store
        .get_budget(key, read)
        .await
        .with_context(|_| ReadBudgetSnafu {
            budget: key.clone(),
        })?;

    match budget {
        Some(budget)
            if read == Read::Cached
                && !ctx
                    .expectations
                    .is_satisfied(object_key, &budget.resource_version().unwrap_or_default()) =>
        {
            tracing::debug!("cached budget is stale, reading it from the API server");
            ctx.store
                .get_budget(key, Read::Live)
                .await
                .with_context(|_| ReadBudgetSnafu {
                    budget: key.clone(),
                })
        }
        budget => Ok(budget),
    }
}

async fn compute_status(
    key: &BudgetKey,
    budget: &PodUnavailableBudget,
    ctx: &Context,
) -> Result<PodUnavailableBudgetStatus> {
    let constraint = budget
        .spec
        .validate()
        .and_then(|()| budget.spec.constraint())
        .with_context(|_| InvalidBudgetSnafu {
            budget: key.clone(),
        })?;

    let resolution = ctx
        .resolver
        .resolve(budget)
        .await
        .with_context(|_| ResolvePodsSnafu {
            budget: key.clone(),
        })?;

    let previous = budget.status.clone().unwrap_or_default();
    let observation = Observation {
        pods: &resolution.pods,
        total_replicas: resolution.total_replicas,
        now: Timestamp::now(),
        claim_ttl: ctx.config.claim_ttl,
    };
    let mut status = availability::compute(&observation, constraint, &previous);
    status.observed_generation = budget
        .metadata
        .generation
        .unwrap_or(previous.observed_generation);
    Ok(status)
}

/// Time until the oldest claim of the status expires, if there are any claims.
fn next_claim_expiry(
    status: &PodUnavailableBudgetStatus,
    claim_ttl: Duration,
    now: Timestamp,
) -> Option<Duration> {
    let oldest = status
        .disrupted_pods
        .values()
        .chain(status.unavailable_pods.values())
        .map(|claimed_at| claimed_at.0)
        .min()?;
    let age = Duration::from_millis(
        u64::try_from(now.as_millisecond() - oldest.as_millisecond()).unwrap_or_default(),
    );
    // a little slack, so the claim is expired when looked at again
    Some(claim_ttl.saturating_sub(age) + Duration::from_secs(1))
}
