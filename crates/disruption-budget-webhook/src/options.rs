//! Contains available options to configure the [WebhookServer][crate::WebhookServer].
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use crate::constants::DEFAULT_SOCKET_ADDRESS;

/// Specifies available webhook server options.
///
/// ```
/// use disruption_budget_webhook::WebhookOptions;
///
/// let options = WebhookOptions::builder("/tls/tls.crt", "/tls/tls.key")
///     .bind_address([127, 0, 0, 1], 12345)
///     .build();
/// assert_eq!(options.socket_addr.port(), 12345);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookOptions {
    /// The HTTPS socket address the [`TcpListener`][tokio::net::TcpListener] binds to.
    pub socket_addr: SocketAddr,

    /// PEM file containing the certificate chain, leaf certificate first.
    pub certificate_path: PathBuf,

    /// PEM file containing the private key of the leaf certificate.
    pub private_key_path: PathBuf,
}

impl WebhookOptions {
    /// Starts building options serving the mounted certificate and key. Binds to
    /// [`DEFAULT_SOCKET_ADDRESS`] unless told otherwise.
    pub fn builder(
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
    ) -> WebhookOptionsBuilder {
        WebhookOptionsBuilder {
            socket_addr: None,
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
        }
    }
}

#[derive(Debug)]
pub struct WebhookOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    certificate_path: PathBuf,
    private_key_path: PathBuf,
}

impl WebhookOptionsBuilder {
    /// Sets the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    pub fn socket_addr(mut self, socket_addr: SocketAddr) -> Self {
        self.socket_addr = Some(socket_addr);
        self
    }

    pub fn build(self) -> WebhookOptions {
        WebhookOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            certificate_path: self.certificate_path,
            private_key_path: self.private_key_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_to_all_addresses_by_default() {
        let options = WebhookOptions::builder("tls.crt", "tls.key").build();
        assert_eq!(options.socket_addr.to_string(), "0.0.0.0:8443");
        assert_eq!(options.certificate_path, PathBuf::from("tls.crt"));
    }
}
