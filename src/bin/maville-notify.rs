//! Notification listener for the MaVille dashboard backend.
//!
//! Connects with the method configured in the environment, shows every
//! notification as a logged toast, and runs until Ctrl-C.
//!
//! Run with: MAVILLE_USER_ROLE=resident MAVILLE_USER_ID=marie@test.com \
//!   RUST_LOG=info cargo run --bin maville-notify
//!
//! Requires the backend at `MAVILLE_API_URL` (default `http://localhost:7000/api`).

use std::sync::Arc;

use maville_notify::{
    //
    NotificationSelector,
    NotifyConfig,
    NotifyError,
    Result,
    ToastNotifier,
    TracingToastSink,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_ansi(false)
        .with_line_number(true)
        .init();

    let config = NotifyConfig::from_env()?;
    let identity = config.identity.clone().ok_or_else(|| {
        NotifyError::InvalidConfig("set MAVILLE_USER_ROLE (and MAVILLE_USER_ID) to listen".into())
    })?;

    let selector = NotificationSelector::from_config(&config, &identity)?;
    let toasts = Arc::new(ToastNotifier::new(TracingToastSink, config.method));

    let activation = selector.activate(&identity, toasts)?;
    tracing::info!("listening as {identity} via {}", config.method);

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down ({})", activation.status());
    activation.deactivate();
    Ok(())
}
