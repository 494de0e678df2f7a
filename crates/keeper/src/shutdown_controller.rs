//! Reacts to SIGINT/SIGTERM so the main loop can drain a final settlement
//! batch before exiting.

pub struct ShutdownController {
    shutdown: tokio::sync::oneshot::Receiver<()>,
}

pub struct ShutdownSignal(tokio::sync::oneshot::Sender<()>);

impl ShutdownController {
    /// Creates a controller which resolves on sigint or sigterm from the OS.
    pub fn new_shutdown_on_signal() -> Self {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        tokio::spawn(Self::wait_for_signal(ShutdownSignal(sender)));
        Self { shutdown: receiver }
    }

    /// Creates a controller that is triggered manually, for tests.
    pub fn new_manual_shutdown() -> (ShutdownSignal, Self) {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        (ShutdownSignal(sender), Self { shutdown: receiver })
    }

    async fn wait_for_signal(shutdown: ShutdownSignal) {
        #[cfg(unix)]
        {
            use tokio::{signal, signal::unix};
            let mut sigterm = unix::signal(unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = signal::ctrl_c() => tracing::info!("received SIGINT"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            tracing::info!("received SIGINT");
        }

        shutdown.shutdown();
    }

    /// Resolves once the shutdown signal has been received.
    pub async fn wait(&mut self) {
        // An error means the signal task was dropped, which only happens on
        // teardown; treat it as a shutdown as well.
        let _ = (&mut self.shutdown).await;
    }
}

impl ShutdownSignal {
    pub fn shutdown(self) {
        let _ = self.0.send(());
    }
}
