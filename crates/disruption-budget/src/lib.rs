//! Pod unavailable budgets: a controller keeping the status of every
//! [`PodUnavailableBudget`](crd::PodUnavailableBudget) in line with the pods it governs, and an
//! admission gate which lets a pod be evicted, deleted or updated in place only while the budget
//! still allows another disruption.
pub mod admission;
pub mod availability;
pub mod cli;
pub mod client;
pub mod crd;
pub mod expectations;
pub mod logging;
pub mod pod_utils;
pub mod reconciler;
pub mod selector;
pub mod utils;
pub mod workload;

#[cfg(test)]
mod test_utils;
