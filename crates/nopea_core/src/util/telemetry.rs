use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing
pub fn init() {
    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap();

    let collector = Registry::default().with(logger).with(env_filter);

    // Tests may race to install a subscriber; the first one wins.
    let _ = tracing::subscriber::set_global_default(collector);
}
