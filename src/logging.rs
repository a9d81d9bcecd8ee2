use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use tracing_subscriber::{prelude::*, EnvFilter};

fn do_init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();

    debug!(default_directive, "Logging with: stdout");
}

/// Initialize tracing.
/// `RUST_LOG` takes precedence over the given default directive, such as `"info"`.
///
/// Will only initialize once, so tests may call this.
pub async fn init(default_directive: &str) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(default_directive);

        *initialized = true;

        info!("Logging initialized");
    }
}

/// Mark the end of logging, right before exiting.
pub fn shutdown() {
    trace!("Shutting down");
}
