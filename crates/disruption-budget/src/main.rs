use std::sync::Arc;

use clap::Parser;
use disruption_budget::{
    admission::{
        AdmissionGate,
        webhook::{self, AdmissionState},
    },
    cli::{APP_NAME, Cli, Command, RunArguments},
    client::KubeClient,
    crd::{CustomResourceExt, PodUnavailableBudget, YamlError},
    expectations::ResourceVersionExpectations,
    logging,
    reconciler::{BudgetController, CONTROLLER_NAME, Context, FailureBackoff},
    utils::signal::{ShutdownSignal, SignalError},
    workload::{WorkloadRegistry, WorkloadResolver},
};
use disruption_budget_webhook::{WebhookError, WebhookOptions, WebhookServer};
use kube::runtime::{
    events::{Recorder, Reporter},
    reflector,
};
use snafu::{ResultExt, Snafu};

const LOG_ENV: &str = "DISRUPTION_BUDGET_LOG";
const FIELD_MANAGER: &str = "disruption-budget-operator";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print the CustomResourceDefinition"))]
    PrintCrd { source: YamlError },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to install the shutdown signal handlers"))]
    InstallSignalHandlers { source: SignalError },

    #[snafu(display("failed to create the Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("the {store} watch stopped before its cache was filled"))]
    FillCache {
        source: reflector::store::WriterDropped,
        store: &'static str,
    },

    #[snafu(display("failed to create the admission webhook server"))]
    CreateWebhookServer { source: WebhookError },

    #[snafu(display("failed to run the admission webhook server"))]
    RunWebhookServer { source: WebhookError },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    match cli.command {
        Command::Crd => PodUnavailableBudget::print_yaml_schema().context(PrintCrdSnafu),
        Command::Run(args) => {
            logging::initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "starting {APP_NAME}"
            );
            run(args).await
        }
    }
}

async fn run(args: RunArguments) -> Result<(), Error> {
    let shutdown = ShutdownSignal::install().context(InstallSignalHandlersSnafu)?;
    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;

    let registry = Arc::new(WorkloadRegistry::with_builtin_kinds());
    let expectations = ResourceVersionExpectations::new();
    let sweeper = expectations.spawn_sweeper(args.controller.expectation_timeout);

    let controller = BudgetController::new(
        client.clone(),
        args.watch_namespace.clone(),
        registry.clone(),
        expectations.clone(),
    )
    .await;
    let caches = controller.caches().clone();
    let cluster = Arc::new(KubeClient::new(
        client.clone(),
        caches.budgets.clone(),
        caches.pods.clone(),
        caches.workloads.clone(),
        FIELD_MANAGER,
    ));
    let resolver = WorkloadResolver::new(cluster.clone(), registry);

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        },
    );
    let ctx = Arc::new(Context {
        store: cluster.clone(),
        resolver: resolver.clone(),
        expectations: expectations.clone(),
        failures: FailureBackoff::default(),
        config: args.controller.reconciler_config(),
    });
    let reconciling = tokio::spawn(controller.run(
        ctx,
        recorder,
        args.controller.workers,
        shutdown.handle(),
    ));

    // Deciding admissions on an empty cache would allow everything
    caches
        .budgets
        .wait_until_ready()
        .await
        .context(FillCacheSnafu { store: "budget" })?;
    caches
        .pods
        .wait_until_ready()
        .await
        .context(FillCacheSnafu { store: "pod" })?;
    caches
        .workloads
        .wait_until_ready()
        .await
        .context(FillCacheSnafu { store: "workload" })?;
    tracing::info!(
        workload_kinds = caches.workloads.len(),
        "watch caches are filled"
    );

    let gate = AdmissionGate::new(
        cluster.clone(),
        resolver,
        expectations,
        args.admission.gate_config(),
    );
    let router = webhook::router(Arc::new(AdmissionState { gate, cluster }));
    let options = WebhookOptions::builder(&args.webhook.tls_cert, &args.webhook.tls_key)
        .socket_addr(args.webhook.webhook_bind_address)
        .build();
    let server = WebhookServer::new(router, options)
        .await
        .context(CreateWebhookServerSnafu)?;
    let served = server
        .run(shutdown.handle())
        .await
        .context(RunWebhookServerSnafu);

    tracing::info!("shutting down");
    sweeper.abort();
    if served.is_err() {
        // the controller only stops on the shutdown signal
        reconciling.abort();
    }
    if let Err(error) = reconciling.await
        && !error.is_cancelled()
    {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "budget controller did not stop cleanly"
        );
    }
    served
}
