//! HTTPS server for Kubernetes admission webhooks.
//!
//! The [`WebhookServer`] terminates TLS with a mounted certificate, serves the routes of the
//! provided Axum [`Router`] plus a `/health` route, and stops gracefully once the provided
//! shutdown future completes.
//!
//! ```no_run
//! use axum::Router;
//! use disruption_budget_webhook::{WebhookOptions, WebhookServer};
//!
//! # async fn run() -> Result<(), disruption_budget_webhook::WebhookError> {
//! let options = WebhookOptions::builder("/tls/tls.crt", "/tls/tls.key").build();
//! let server = WebhookServer::new(Router::new(), options).await?;
//! server.run(std::future::pending()).await
//! # }
//! ```
use axum::{Router, routing::get};
use snafu::{ResultExt, Snafu};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{constants::HEALTH_PATH, tls::TlsServer};

pub mod constants;
pub mod options;
pub mod tls;

// Selected re-exports
pub use crate::{constants::DEFAULT_SOCKET_ADDRESS, options::WebhookOptions};

/// A result type alias with the [`WebhookError`] type as the default error type.
pub type Result<T, E = WebhookError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },
}

/// A ready-to-use webhook server.
pub struct WebhookServer {
    tls_server: TlsServer,
}

impl WebhookServer {
    /// Loads the TLS material named in `options` and prepares serving `router`.
    pub async fn new(router: Router, options: WebhookOptions) -> Result<Self> {
        tracing::trace!("create new webhook server");

        let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());
        let router = router
            .layer(service_builder)
            // The health route is below the trace layer so probes are not traced
            .route(HEALTH_PATH, get(|| async { "ok" }));

        tracing::debug!("create TLS server");
        let tls_server = TlsServer::new(&options, router)
            .await
            .context(CreateTlsServerSnafu)?;

        Ok(Self { tls_server })
    }

    /// Serves requests until `shutdown` completes, then drains open connections.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::debug!("run webhook server");

        self.tls_server
            .run(shutdown)
            .await
            .context(RunTlsServerSnafu)
    }
}
