//! The [`PodUnavailableBudget`] custom resource.
//!
//! A budget governs a set of pods, selected either by a label selector or by a reference to a
//! single workload object, and declares how many of those pods may be voluntarily disrupted at
//! the same time. The status is exclusively written by this operator: the reconciler overwrites
//! the counters and the admission gate appends claims to `disruptedPods`/`unavailablePods`.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::apimachinery::pkg::{
    apis::meta::v1::{LabelSelector, Time},
    util::intstr::IntOrString,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::availability::{Constraint, Quantity, QuantityError};

mod yaml;

pub use yaml::{CustomResourceExt, Error as YamlError};

type Result<T, E = InvalidBudgetError> = std::result::Result<T, E>;

/// The spec of a budget violates one of its structural invariants.
///
/// These are rejected at the boundary: the reconciler reports them and never computes a status
/// from an invalid spec, and the admission gate ignores invalid budgets.
#[derive(Debug, PartialEq, Snafu)]
pub enum InvalidBudgetError {
    #[snafu(display("selector and targetRef are mutually exclusive, but both are set"))]
    SelectorAndTargetRef,

    #[snafu(display("either selector or targetRef must be set"))]
    MissingTarget,

    #[snafu(display("maxUnavailable and minAvailable are mutually exclusive, but both are set"))]
    MaxUnavailableAndMinAvailable,

    #[snafu(display("invalid {field}"))]
    InvalidQuantity {
        source: QuantityError,
        field: &'static str,
    },

    #[snafu(display("targetRef.{field} must not be empty"))]
    EmptyTargetRefField { field: &'static str },
}

/// Limits the number of governed pods that may be unavailable because of voluntary
/// disruptions (evictions, deletions and in-place updates) at any point in time.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "policy.disruption-budget.dev",
    version = "v1alpha1",
    kind = "PodUnavailableBudget",
    plural = "podunavailablebudgets",
    shortname = "pub",
    status = "PodUnavailableBudgetStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Allowed", "type":"integer", "description":"Disruptions currently allowed", "jsonPath":".status.unavailableAllowed"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "description":"Currently available pods", "jsonPath":".status.currentAvailable"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "description":"Pods which must stay available", "jsonPath":".status.desiredAvailable"}"#,
    printcolumn = r#"{"name":"Total", "type":"integer", "description":"Declared replicas", "jsonPath":".status.totalReplicas"}"#,
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct PodUnavailableBudgetSpec {
    /// Label selector for the governed pods. Mutually exclusive with `targetRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Reference to a single workload whose pods are governed. Mutually exclusive with
    /// `selector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetReference>,

    /// Maximum number (or percentage, rounded down) of governed pods that may be unavailable.
    /// Defaults to `1` if neither `maxUnavailable` nor `minAvailable` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Minimum number (or percentage, rounded up) of governed pods that must stay available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,
}

/// Points at a single workload object in the namespace of the budget.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    /// API version of the referent, e.g. `apps/v1`.
    pub api_version: String,

    /// Kind of the referent, e.g. `Deployment`.
    pub kind: String,

    /// Name of the referent.
    pub name: String,
}

impl fmt::Display for TargetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.kind, self.api_version, self.name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodUnavailableBudgetStatus {
    /// The most recent generation observed by the budget controller.
    #[serde(default)]
    pub observed_generation: i64,

    /// Pods whose eviction or deletion was admitted but not yet observed, keyed by pod name.
    /// The value is the time the disruption was admitted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disrupted_pods: BTreeMap<String, Time>,

    /// Pods whose in-place update was admitted but which have not yet become available again,
    /// keyed by pod name. The value is the time the update was admitted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unavailable_pods: BTreeMap<String, Time>,

    /// Number of further pod disruptions that are currently allowed.
    #[serde(default)]
    pub unavailable_allowed: i32,

    /// Number of governed pods which are currently available.
    #[serde(default)]
    pub current_available: i32,

    /// Minimum number of governed pods which must stay available.
    #[serde(default)]
    pub desired_available: i32,

    /// Declared replica count of the governed workloads.
    #[serde(default)]
    pub total_replicas: i32,
}

/// How the governed pods of a budget are selected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BudgetTarget<'a> {
    Selector(&'a LabelSelector),
    Reference(&'a TargetReference),
}

impl PodUnavailableBudgetSpec {
    /// Returns how the governed pods are selected, enforcing that exactly one of `selector` and
    /// `targetRef` is set.
    pub fn target(&self) -> Result<BudgetTarget<'_>> {
        match (&self.selector, &self.target_ref) {
            (Some(_), Some(_)) => SelectorAndTargetRefSnafu.fail(),
            (None, None) => MissingTargetSnafu.fail(),
            (Some(selector), None) => Ok(BudgetTarget::Selector(selector)),
            (None, Some(target_ref)) => {
                for (field, value) in [
                    ("apiVersion", &target_ref.api_version),
                    ("kind", &target_ref.kind),
                    ("name", &target_ref.name),
                ] {
                    if value.is_empty() {
                        return EmptyTargetRefFieldSnafu { field }.fail();
                    }
                }
                Ok(BudgetTarget::Reference(target_ref))
            }
        }
    }

    /// Returns the availability constraint of this budget. A budget without any constraint
    /// allows a single unavailable pod.
    pub fn constraint(&self) -> Result<Constraint> {
        match (&self.max_unavailable, &self.min_available) {
            (Some(_), Some(_)) => MaxUnavailableAndMinAvailableSnafu.fail(),
            (Some(max_unavailable), None) => Quantity::parse(max_unavailable)
                .map(Constraint::MaxUnavailable)
                .context(InvalidQuantitySnafu {
                    field: "maxUnavailable",
                }),
            (None, Some(min_available)) => Quantity::parse(min_available)
                .map(Constraint::MinAvailable)
                .context(InvalidQuantitySnafu {
                    field: "minAvailable",
                }),
            (None, None) => Ok(Constraint::MaxUnavailable(Quantity::Absolute(1))),
        }
    }

    /// Validates the whole spec.
    pub fn validate(&self) -> Result<()> {
        self.target()?;
        self.constraint()?;
        Ok(())
    }
}

/// Namespace and name of a [`PodUnavailableBudget`], keying per budget state.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BudgetKey {
    pub namespace: String,
    pub name: String,
}

impl BudgetKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BudgetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("budget has no {field}"))]
pub struct MissingMetadataError {
    field: &'static str,
}

impl PodUnavailableBudget {
    /// The key of this budget.
    pub fn key(&self) -> Result<BudgetKey, MissingMetadataError> {
        let namespace = self
            .namespace()
            .context(MissingMetadataSnafu { field: "namespace" })?;
        Ok(BudgetKey::new(namespace, self.name_any()))
    }

    /// Whether the status reflects the current spec generation.
    ///
    /// Objects without a generation (never persisted by an API server) are treated as observed.
    pub fn status_is_current(&self) -> bool {
        let observed = self
            .status
            .as_ref()
            .map_or(0, |status| status.observed_generation);
        self.metadata
            .generation
            .is_none_or(|generation| observed >= generation)
    }
}
