use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cfg_if::cfg_if;
use futures::future::Shared;
use futures::FutureExt;
use tokio::select;
use tokio::sync::Notify;
use tracing::info;

cfg_if! {
    if #[cfg(unix)] {
        use tokio::signal::unix::{signal, SignalKind};

        async fn os_signal(kind: SignalKind) {
            let mut stream = signal(kind).expect("Failed to listen to unix shutdown signal");
            stream.recv().await;
        }

        async fn raw_os_shutdown_signal() {
            select! {
                _ = os_signal(SignalKind::interrupt()) => (),
                _ = os_signal(SignalKind::terminate()) => (),
                _ = os_signal(SignalKind::hangup()) => (),
            }
        }
    } else if #[cfg(windows)] {
        use tokio::signal::windows::{ctrl_c, ctrl_close, ctrl_shutdown};

        async fn raw_os_shutdown_signal() {
            let mut c = ctrl_c().expect("Failed to attach ctrl_c shutdown signal");
            let mut close = ctrl_close().expect("Failed to attach ctrl_close shutdown signal");
            let mut shutdown = ctrl_shutdown().expect("Failed to attach ctrl_shutdown shutdown signal");
            select! {
                _ = c.recv() => (),
                _ = close.recv() => (),
                _ = shutdown.recv() => (),
            }
        }
    } else {
        compile_error!("Your OS does not support shutdown signals! Are you targeting wasm?");
    }
}

/// A cloneable future that completes when shutdown has been requested.
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Builds a signal that completes when `notify` receives a permit.
pub fn notified_shutdown_signal(notify: Arc<Notify>) -> ShutdownSignal {
    async move {
        notify.notified().await;
    }
    .boxed()
    .shared()
}

/// Builds a signal that completes on an OS termination signal or when `notify`
/// receives a permit, whichever comes first.
pub fn shutdown_signal(notify: Arc<Notify>) -> ShutdownSignal {
    async move {
        select! {
            _ = raw_os_shutdown_signal() => {
                info!("Shutdown signal detected. Attempting graceful shutdown...");
            }
            _ = notify.notified() => (),
        }
    }
    .boxed()
    .shared()
}
