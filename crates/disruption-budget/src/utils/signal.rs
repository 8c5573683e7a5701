use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to register the {name} handler"))]
pub struct SignalError {
    source: std::io::Error,
    name: &'static str,
}

/// Fans a single `SIGTERM` or `SIGINT` out to any number of tasks shutting down gracefully.
#[derive(Clone)]
pub struct ShutdownSignal {
    watch_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn install() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu { name: "SIGTERM" })?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu { name: "SIGINT" })?;
        let (watch_tx, watch_rx) = watch::channel(false);

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "received shutdown signal");
            // receivers may already be gone during shutdown
            let _ = watch_tx.send(true);
        });

        Ok(Self { watch_rx })
    }

    /// Completes once a shutdown was requested. Can be called any number of times, also after
    /// the signal arrived.
    pub fn handle(&self) -> impl Future<Output = ()> + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            // An error means the sender is gone, which only happens after it sent
            watch_rx.wait_for(|requested| *requested).await.ok();
        }
    }
}
