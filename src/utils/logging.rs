use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` directives win when set; otherwise every target logs at
/// `default_level`, and unknown level names fall back to `info`.
pub fn init(default_level: &str) {
    let level = default_level
        .trim()
        .to_lowercase()
        .replace("warning", "warn")
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
