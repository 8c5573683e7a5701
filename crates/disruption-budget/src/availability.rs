//! Turns the governed pods of a budget into its status counters.
//!
//! Everything in here is pure: the same pods, replica count, constraint and previous status
//! always produce the same status.

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
    jiff::Timestamp,
};
use snafu::{OptionExt, Snafu};

use crate::{crd::PodUnavailableBudgetStatus, pod_utils};

#[derive(Debug, PartialEq, Snafu)]
pub enum QuantityError {
    #[snafu(display("{value:?} is neither an integer nor a percentage like \"20%\""))]
    Malformed { value: String },

    #[snafu(display("{value:?} must not be negative"))]
    Negative { value: String },
}

/// An absolute pod count or a percentage of the declared replicas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Quantity {
    Absolute(i32),
    Percent(i32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rounding {
    Down,
    Up,
}

impl Quantity {
    pub fn parse(value: &IntOrString) -> Result<Self, QuantityError> {
        match value {
            IntOrString::Int(count) if *count < 0 => NegativeSnafu {
                value: count.to_string(),
            }
            .fail(),
            IntOrString::Int(count) => Ok(Self::Absolute(*count)),
            IntOrString::String(value) => {
                let percent = value
                    .strip_suffix('%')
                    .and_then(|digits| digits.parse::<i32>().ok())
                    .context(MalformedSnafu { value })?;
                if percent < 0 {
                    return NegativeSnafu { value }.fail();
                }
                Ok(Self::Percent(percent))
            }
        }
    }

    /// Resolves the quantity against `total` pods. Percentages are rounded as requested.
    pub fn scaled(self, total: i32, rounding: Rounding) -> i32 {
        match self {
            Self::Absolute(count) => count,
            Self::Percent(percent) => {
                let product = i64::from(percent) * i64::from(total.max(0));
                let scaled = match rounding {
                    Rounding::Down => product / 100,
                    Rounding::Up => (product + 99) / 100,
                };
                i32::try_from(scaled).unwrap_or(i32::MAX)
            }
        }
    }
}

/// The effective availability constraint of a budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Constraint {
    MaxUnavailable(Quantity),
    MinAvailable(Quantity),
}

impl Constraint {
    /// Number of pods which must stay available out of `total`.
    ///
    /// `maxUnavailable` percentages round down and `minAvailable` percentages round up, so the
    /// effective allowance never exceeds the configured percentage.
    pub fn desired_available(self, total: i32) -> i32 {
        let desired = match self {
            Self::MaxUnavailable(quantity) => {
                total.saturating_sub(quantity.scaled(total, Rounding::Down))
            }
            Self::MinAvailable(quantity) => quantity.scaled(total, Rounding::Up),
        };
        desired.max(0)
    }
}

/// The observed state a status is computed from.
#[derive(Clone, Copy, Debug)]
pub struct Observation<'a> {
    /// The governed pods.
    pub pods: &'a [Pod],

    /// Sum of the declared replicas of the governing workloads.
    pub total_replicas: i32,

    /// Point in time the claims are aged against.
    pub now: Timestamp,

    /// Claims older than this are dropped.
    pub claim_ttl: Duration,
}

/// Computes the status of a budget. `observedGeneration` is taken over from `previous`.
pub fn compute(
    observation: &Observation<'_>,
    constraint: Constraint,
    previous: &PodUnavailableBudgetStatus,
) -> PodUnavailableBudgetStatus {
    if observation.pods.is_empty() {
        return PodUnavailableBudgetStatus {
            observed_generation: previous.observed_generation,
            ..PodUnavailableBudgetStatus::default()
        };
    }

    let pods_by_name: BTreeMap<&str, &Pod> = observation
        .pods
        .iter()
        .filter_map(|pod| Some((pod.metadata.name.as_deref()?, pod)))
        .collect();

    let disrupted_pods = retain_claims(&previous.disrupted_pods, |name, claimed_at| {
        let Some(pod) = pods_by_name.get(name) else {
            return false;
        };
        !pod_utils::is_terminating(pod) && !is_expired(claimed_at, observation)
    });

    let unavailable_pods = retain_claims(&previous.unavailable_pods, |name, claimed_at| {
        let Some(pod) = pods_by_name.get(name) else {
            return false;
        };
        let recovered = pod_utils::is_ready(pod)
            && pod_utils::ready_transition_time(pod).is_some_and(|since| since > claimed_at.0);
        !pod_utils::is_terminating(pod) && !is_expired(claimed_at, observation) && !recovered
    });

    let current_available = pods_by_name
        .iter()
        .filter(|(name, pod)| {
            pod_utils::is_available(pod)
                && !disrupted_pods.contains_key(**name)
                && !unavailable_pods.contains_key(**name)
        })
        .count();
    let current_available = i32::try_from(current_available).unwrap_or(i32::MAX);
    let desired_available = constraint.desired_available(observation.total_replicas);

    PodUnavailableBudgetStatus {
        observed_generation: previous.observed_generation,
        disrupted_pods,
        unavailable_pods,
        unavailable_allowed: (current_available - desired_available).max(0),
        current_available,
        desired_available,
        total_replicas: observation.total_replicas,
    }
}

fn retain_claims(
    claims: &BTreeMap<String, Time>,
    mut keep: impl FnMut(&str, &Time) -> bool,
) -> BTreeMap<String, Time> {
    claims
        .iter()
        .filter(|(name, claimed_at)| keep(name, claimed_at))
        .map(|(name, claimed_at)| (name.clone(), claimed_at.clone()))
        .collect()
}

fn is_expired(claimed_at: &Time, observation: &Observation<'_>) -> bool {
    let age = observation.now.as_millisecond() - claimed_at.0.as_millisecond();
    let ttl = i64::try_from(observation.claim_ttl.as_millis()).unwrap_or(i64::MAX);
    age > ttl
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use rstest::rstest;

    use super::*;
    use crate::test_utils::{TestPod, timestamp};

    const TTL: Duration = Duration::from_secs(120);

    fn observe(pods: &[Pod], total_replicas: i32) -> Observation<'_> {
        Observation {
            pods,
            total_replicas,
            now: timestamp("2024-05-01T10:00:00Z"),
            claim_ttl: TTL,
        }
    }

    fn ready_pods(count: usize) -> Vec<Pod> {
        (0..count)
            .map(|index| TestPod::new(&format!("web-{index}")).build())
            .collect()
    }

    fn counters(status: &PodUnavailableBudgetStatus) -> (i32, i32, i32, i32) {
        (
            status.total_replicas,
            status.current_available,
            status.desired_available,
            status.unavailable_allowed,
        )
    }

    fn claims(entries: &[(&str, &str)]) -> BTreeMap<String, Time> {
        entries
            .iter()
            .map(|(name, at)| (name.to_string(), Time(timestamp(at))))
            .collect()
    }

    #[rstest]
    #[case(IntOrString::Int(3), Ok(Quantity::Absolute(3)))]
    #[case(IntOrString::Int(0), Ok(Quantity::Absolute(0)))]
    #[case(IntOrString::String("20%".to_string()), Ok(Quantity::Percent(20)))]
    #[case(IntOrString::String("150%".to_string()), Ok(Quantity::Percent(150)))]
    #[case(IntOrString::Int(-1), Err(QuantityError::Negative { value: "-1".to_string() }))]
    #[case(
        IntOrString::String("-5%".to_string()),
        Err(QuantityError::Negative { value: "-5%".to_string() })
    )]
    #[case(
        IntOrString::String("20".to_string()),
        Err(QuantityError::Malformed { value: "20".to_string() })
    )]
    #[case(
        IntOrString::String("x%".to_string()),
        Err(QuantityError::Malformed { value: "x%".to_string() })
    )]
    fn parse_quantity(#[case] input: IntOrString, #[case] expected: Result<Quantity, QuantityError>) {
        assert_eq!(Quantity::parse(&input), expected);
    }

    #[rstest]
    // maxUnavailable rounds the allowance down
    #[case(Constraint::MaxUnavailable(Quantity::Percent(20)), 0, 0)]
    #[case(Constraint::MaxUnavailable(Quantity::Percent(20)), 1, 1)]
    #[case(Constraint::MaxUnavailable(Quantity::Percent(50)), 1, 1)]
    #[case(Constraint::MaxUnavailable(Quantity::Percent(100)), 1, 0)]
    #[case(Constraint::MaxUnavailable(Quantity::Percent(20)), 10, 8)]
    #[case(Constraint::MaxUnavailable(Quantity::Percent(25)), 10, 8)]
    #[case(Constraint::MaxUnavailable(Quantity::Absolute(1)), 0, 0)]
    #[case(Constraint::MaxUnavailable(Quantity::Absolute(1)), 1, 0)]
    #[case(Constraint::MaxUnavailable(Quantity::Absolute(1)), 2, 1)]
    #[case(Constraint::MaxUnavailable(Quantity::Absolute(5)), 2, 0)]
    // minAvailable rounds the requirement up
    #[case(Constraint::MinAvailable(Quantity::Percent(50)), 0, 0)]
    #[case(Constraint::MinAvailable(Quantity::Percent(1)), 1, 1)]
    #[case(Constraint::MinAvailable(Quantity::Percent(50)), 1, 1)]
    #[case(Constraint::MinAvailable(Quantity::Percent(75)), 10, 8)]
    #[case(Constraint::MinAvailable(Quantity::Absolute(1)), 0, 1)]
    #[case(Constraint::MinAvailable(Quantity::Absolute(3)), 2, 3)]
    fn desired_available(
        #[case] constraint: Constraint,
        #[case] total: i32,
        #[case] expected: i32,
    ) {
        assert_eq!(constraint.desired_available(total), expected);
    }

    #[test]
    fn no_pods_is_inert() {
        let previous = PodUnavailableBudgetStatus {
            observed_generation: 4,
            disrupted_pods: claims(&[("web-0", "2024-05-01T09:59:00Z")]),
            unavailable_allowed: 3,
            ..Default::default()
        };
        let status = compute(
            &observe(&[], 2),
            Constraint::MinAvailable(Quantity::Absolute(1)),
            &previous,
        );

        assert_eq!(counters(&status), (0, 0, 0, 0));
        assert!(status.disrupted_pods.is_empty());
        assert_eq!(status.observed_generation, 4);
    }

    #[test]
    fn two_replicas_one_unavailable() {
        let pods = ready_pods(2);
        let status = compute(
            &observe(&pods, 2),
            Constraint::MaxUnavailable(Quantity::Absolute(1)),
            &PodUnavailableBudgetStatus::default(),
        );
        assert_eq!(counters(&status), (2, 2, 1, 1));
    }

    #[test]
    fn not_ready_pod_consumes_the_allowance() {
        let pods = vec![
            TestPod::new("web-0").build(),
            TestPod::new("web-1").not_ready().build(),
        ];
        let constraint = Constraint::MaxUnavailable(Quantity::Absolute(1));
        let status = compute(&observe(&pods, 2), constraint, &Default::default());
        assert_eq!(counters(&status), (2, 1, 1, 0));

        let recovered = ready_pods(2);
        let status = compute(&observe(&recovered, 2), constraint, &status);
        assert_eq!(counters(&status), (2, 2, 1, 1));
    }

    #[test]
    fn percentage_across_two_workloads() {
        let pods = ready_pods(10);
        let status = compute(
            &observe(&pods, 10),
            Constraint::MaxUnavailable(Quantity::Percent(20)),
            &Default::default(),
        );
        assert_eq!(counters(&status), (10, 10, 8, 2));
    }

    #[test]
    fn claimed_pods_are_not_available() {
        let pods = ready_pods(5);
        let previous = PodUnavailableBudgetStatus {
            disrupted_pods: claims(&[("web-0", "2024-05-01T09:59:00Z")]),
            unavailable_pods: claims(&[("web-1", "2024-05-01T09:59:30Z")]),
            ..Default::default()
        };
        let status = compute(
            &observe(&pods, 5),
            Constraint::MaxUnavailable(Quantity::Absolute(2)),
            &previous,
        );

        assert_eq!(counters(&status), (5, 3, 3, 0));
        assert_eq!(status.disrupted_pods, previous.disrupted_pods);
        assert_eq!(status.unavailable_pods, previous.unavailable_pods);
    }

    #[test]
    fn claims_are_pruned() {
        let pods = vec![
            TestPod::new("kept").build(),
            TestPod::new("terminating").terminating().build(),
            TestPod::new("expired").build(),
            TestPod::new("recovered").ready_since("2024-05-01T09:59:45Z").build(),
            TestPod::new("updating").not_ready().build(),
        ];
        let previous = PodUnavailableBudgetStatus {
            disrupted_pods: claims(&[
                ("kept", "2024-05-01T09:59:00Z"),
                ("gone", "2024-05-01T09:59:00Z"),
                ("terminating", "2024-05-01T09:59:00Z"),
                ("expired", "2024-05-01T09:57:59Z"),
            ]),
            unavailable_pods: claims(&[
                ("recovered", "2024-05-01T09:59:30Z"),
                ("updating", "2024-05-01T09:59:30Z"),
            ]),
            ..Default::default()
        };
        let status = compute(
            &observe(&pods, 5),
            Constraint::MaxUnavailable(Quantity::Absolute(1)),
            &previous,
        );

        assert_eq!(
            status.disrupted_pods,
            claims(&[("kept", "2024-05-01T09:59:00Z")])
        );
        assert_eq!(
            status.unavailable_pods,
            claims(&[("updating", "2024-05-01T09:59:30Z")])
        );
        // expired and recovered are available again
        assert_eq!(status.current_available, 2);
    }

    #[test]
    fn compute_is_idempotent() {
        let pods = vec![
            TestPod::new("web-0").build(),
            TestPod::new("web-1").not_ready().build(),
            TestPod::new("web-2").build(),
        ];
        let previous = PodUnavailableBudgetStatus {
            disrupted_pods: claims(&[("web-2", "2024-05-01T09:59:00Z")]),
            ..Default::default()
        };
        let constraint = Constraint::MinAvailable(Quantity::Percent(30));

        let first = compute(&observe(&pods, 3), constraint, &previous);
        let second = compute(&observe(&pods, 3), constraint, &first);
        assert_eq!(first, second);
    }

    #[test]
    fn allowance_is_never_negative() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..500 {
            let total = rng.random_range(0..12);
            let pods: Vec<Pod> = (0..rng.random_range(0..12))
                .map(|index| {
                    let mut pod = TestPod::new(&format!("web-{index}"));
                    if rng.random_bool(0.3) {
                        pod = pod.not_ready();
                    }
                    if rng.random_bool(0.1) {
                        pod = pod.terminating();
                    }
                    pod.build()
                })
                .collect();
            let quantity = if rng.random_bool(0.5) {
                Quantity::Absolute(rng.random_range(0..8))
            } else {
                Quantity::Percent(rng.random_range(0..=100))
            };
            let constraint = if rng.random_bool(0.5) {
                Constraint::MaxUnavailable(quantity)
            } else {
                Constraint::MinAvailable(quantity)
            };

            let status = compute(&observe(&pods, total), constraint, &Default::default());

            assert!(status.unavailable_allowed >= 0);
            assert!(status.desired_available >= 0);
            assert!(status.current_available <= i32::try_from(pods.len()).unwrap());
            assert_eq!(
                status.unavailable_allowed,
                (status.current_available - status.desired_available).max(0),
                "{constraint:?} with {total} replicas"
            );
        }
    }
}
