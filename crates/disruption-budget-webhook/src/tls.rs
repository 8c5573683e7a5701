//! TLS termination with the certificate and key mounted into the container, handing the
//! decrypted HTTP connections to an Axum [`Router`].
use std::{net::SocketAddr, path::Path, pin::pin, sync::Arc, time::Duration};

use axum::{Router, extract::Request};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
        version::{TLS12, TLS13},
    },
};
use tower::ServiceExt;
use tracing::{Instrument, instrument};

use crate::options::WebhookOptions;

/// How long open connections may take to finish their requests once the server stops.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub type Result<T, E = TlsServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TlsServerError {
    #[snafu(display("failed to read {}", path.display()))]
    ReadPemFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to parse the PEM encoded {item} in {}", path.display()))]
    ParsePem {
        source: tokio_rustls::rustls::pki_types::pem::Error,
        item: &'static str,
        path: std::path::PathBuf,
    },

    #[snafu(display("{} contains no certificate", path.display()))]
    NoCertificates { path: std::path::PathBuf },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("the certificate and private key do not form a valid identity"))]
    InvalidIdentity { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },
}

/// A server which terminates TLS connections and allows clients to communicate
/// via HTTPS with the underlying HTTP router.
pub struct TlsServer {
    config: ServerConfig,
    socket_addr: SocketAddr,
    router: Router,
}

impl TlsServer {
    #[instrument(name = "create_tls_server", skip(router))]
    pub async fn new(options: &WebhookOptions, router: Router) -> Result<Self> {
        let certificates = read_certificates(&options.certificate_path).await?;
        let private_key = read_private_key(&options.private_key_path).await?;

        let mut config = ServerConfig::builder_with_provider(default_provider().into())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_single_cert(certificates, private_key)
            .context(InvalidIdentitySnafu)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            config,
            socket_addr: options.socket_addr,
            router,
        })
    }

    /// Accepts TLS connections until `shutdown` completes. Afterwards no new connections are
    /// accepted, and open ones get [`SHUTDOWN_GRACE_PERIOD`] to finish their requests.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let tls_acceptor = TlsAcceptor::from(Arc::new(self.config));
        let tcp_listener =
            TcpListener::bind(self.socket_addr)
                .await
                .context(BindTcpListenerSnafu {
                    socket_addr: self.socket_addr,
                })?;
        tracing::info!(socket_addr = %self.socket_addr, "webhook server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let mut shutdown = pin!(shutdown);
        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                () = &mut shutdown => break,
                accepted = tcp_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::trace!(%err, "failed to accept incoming TCP connection");
                        continue;
                    }
                },
            };

            let tls_acceptor = tls_acceptor.clone();
            let router = self.router.clone();
            let mut stop_rx = stop_rx.clone();
            let span = tracing::debug_span!("accept tcp connection", %remote_addr);
            connections.spawn(
                async move {
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            tracing::trace!(%err, "error during tls handshake");
                            return;
                        }
                    };

                    // Hyper has its own `Service` trait, `service_fn` bridges it to tower
                    let service = service_fn(move |request: Request<Incoming>| {
                        router.clone().oneshot(request)
                    });
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let mut connection =
                        pin!(builder.serve_connection(TokioIo::new(tls_stream), service));

                    let result = tokio::select! {
                        result = connection.as_mut() => result,
                        () = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {
                            connection.as_mut().graceful_shutdown();
                            connection.await
                        }
                    };
                    if let Err(err) = result {
                        tracing::warn!(%err, "failed to serve connection");
                    }
                }
                .instrument(span),
            );

            // reap finished connections
            while connections.try_join_next().is_some() {}
        }

        tracing::info!(
            open_connections = connections.len(),
            "webhook server stops accepting connections"
        );
        // Nobody listens anymore once all connections are closed
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                grace_period = ?SHUTDOWN_GRACE_PERIOD,
                "aborting connections which did not finish in time"
            );
            connections.abort_all();
        }
        Ok(())
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.context(ReadPemFileSnafu { path })
}

async fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path).await?;
    let certificates = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .context(ParsePemSnafu {
            item: "certificates",
            path,
        })?;
    if certificates.is_empty() {
        return NoCertificatesSnafu { path }.fail();
    }
    Ok(certificates)
}

async fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path).await?;
    PrivateKeyDer::from_pem_slice(&pem).context(ParsePemSnafu {
        item: "private key",
        path,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn pem_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn missing_files_are_reported() {
        let error = read_certificates(Path::new("/does/not/exist.crt"))
            .await
            .unwrap_err();
        assert!(matches!(error, TlsServerError::ReadPemFile { .. }));
    }

    #[tokio::test]
    async fn files_without_certificates_are_rejected() {
        let file = pem_file("not a certificate\n");
        let error = read_certificates(file.path()).await.unwrap_err();
        assert!(matches!(error, TlsServerError::NoCertificates { .. }));
    }

    #[tokio::test]
    async fn files_without_private_key_are_rejected() {
        let file = pem_file("not a key\n");
        let error = read_private_key(file.path()).await.unwrap_err();
        assert!(matches!(error, TlsServerError::ParsePem { .. }));
    }
}
