use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// Initializes the global tracing subscriber exactly once. The filter uses
/// the `tracing_subscriber::EnvFilter` directive syntax.
pub fn initialize(filter: &str) {
    static INIT: Once = Once::new();
    let filter = filter.to_string();
    INIT.call_once(move || {
        let filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
            eprintln!("invalid log filter, falling back to \"info\": {err}");
            EnvFilter::new("info")
        });
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    });
}
