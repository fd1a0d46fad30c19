//! Signal handling: SIGINT and SIGTERM cancel the relay.

use mediarelay_core::CancellationToken;
use std::io;
use std::thread;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Start a thread that cancels `cancel` on the first SIGINT or SIGTERM.
///
/// Handlers are installed before this returns.
///
/// # Errors
///
/// Returns an error if the runtime or the handlers cannot be set up.
pub fn spawn_listener(cancel: CancellationToken) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (mut interrupt, mut terminate) = {
        let _guard = runtime.enter();
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
        )
    };

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let name = tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                };
                info!("{} received, stopping", name);
                cancel.cancel();
            });
        })?;
    Ok(())
}
