//! OS signal handling.
//!
//! # Responsibilities
//! - Listen for SIGTERM, SIGINT and SIGHUP
//! - Translate signals to [`SignalEvent`]s for the binary's main loop
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP asks for a config reload, not shutdown
//! - On non-unix targets only Ctrl-C is observed

/// What the process should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Wait for the next signal of interest.
#[cfg(unix)]
pub async fn next_signal() -> std::io::Result<SignalEvent> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let event = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            SignalEvent::Shutdown
        }
        _ = term.recv() => SignalEvent::Shutdown,
        _ = hup.recv() => SignalEvent::Reload,
    };
    tracing::info!(event = ?event, "signal received");
    Ok(event)
}

#[cfg(not(unix))]
pub async fn next_signal() -> std::io::Result<SignalEvent> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("signal received");
    Ok(SignalEvent::Shutdown)
}
