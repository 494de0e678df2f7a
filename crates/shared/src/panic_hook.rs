/// Registers a panic hook that logs panics through tracing before the
/// default hook runs, so they show up in structured log collection.
pub fn install() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("thread panicked: {info}");
        default_hook(info);
    }));
}
