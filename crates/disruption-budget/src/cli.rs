use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser};

use crate::{admission::GateConfig, reconciler::ReconcilerConfig};

pub const APP_NAME: &str = "disruption-budget-operator";

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(name = APP_NAME, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, clap::Subcommand)]
pub enum Command {
    /// Print the PodUnavailableBudget CustomResourceDefinition as YAML
    Crd,

    /// Run the status controller and the admission webhook
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Only watch budgets, pods and workloads in this namespace. Watches all namespaces if unset.
    #[arg(long, env)]
    pub watch_namespace: Option<String>,

    #[command(flatten)]
    pub controller: ControllerOptions,

    #[command(flatten)]
    pub admission: AdmissionOptions,

    #[command(flatten)]
    pub webhook: WebhookOptions,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Controller Options")]
pub struct ControllerOptions {
    /// Number of budgets reconciled in parallel.
    #[arg(long, env, default_value_t = 3)]
    pub workers: u16,

    /// Interval in which all budgets are reconciled, even without changes.
    #[arg(long, env, default_value = "5m", value_parser = humantime::parse_duration)]
    pub resync_period: Duration,

    /// Age after which claims in `disruptedPods` and `unavailablePods` are dropped.
    #[arg(long, env, default_value = "2m", value_parser = humantime::parse_duration)]
    pub claim_ttl: Duration,

    /// Status writes attempted per reconciliation before conflicts are retried with backoff.
    #[arg(long, env, default_value_t = 5)]
    pub max_status_attempts: u32,

    /// Idle time after which remembered resource versions are forgotten.
    #[arg(long, env, default_value = "5m", value_parser = humantime::parse_duration)]
    pub expectation_timeout: Duration,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Admission Options")]
pub struct AdmissionOptions {
    /// Upper bound for deciding a single disruption request.
    #[arg(long, env, default_value = "10s", value_parser = humantime::parse_duration)]
    pub admission_timeout: Duration,

    /// Allow disruptions whose decision failed or timed out.
    #[arg(long, env)]
    pub fail_open: bool,

    /// Conditional writes attempted per budget before a request is denied as contended.
    #[arg(long, env, default_value_t = 5)]
    pub max_claim_attempts: u32,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Webhook Options")]
pub struct WebhookOptions {
    #[arg(long, env, default_value_t = disruption_budget_webhook::DEFAULT_SOCKET_ADDRESS)]
    pub webhook_bind_address: SocketAddr,

    /// PEM encoded certificate chain served by the webhook.
    #[arg(long, env, value_name = "FILE")]
    pub tls_cert: PathBuf,

    /// PEM encoded private key of the certificate.
    #[arg(long, env, value_name = "FILE")]
    pub tls_key: PathBuf,
}

impl ControllerOptions {
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            claim_ttl: self.claim_ttl,
            max_status_attempts: self.max_status_attempts.max(1),
            resync_period: self.resync_period,
        }
    }
}

impl AdmissionOptions {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            timeout: self.admission_timeout,
            fail_open: self.fail_open,
            max_claim_attempts: self.max_claim_attempts.max(1),
            ..GateConfig::default()
        }
    }
}
