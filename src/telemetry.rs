// Structured logging bootstrap, shared by the demo binary and available to
// embedders who want the engine's `tracing` spans without rolling their own
// subscriber.

/// Installs a `tracing_subscriber::fmt` layer with thread ids and levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}
