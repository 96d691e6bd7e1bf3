use crate::config::LoggingConfig;

/// Install the global `tracing` subscriber. Logs go to stderr; stdout carries command output.
pub fn init_tracing(config: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(err) = result {
        eprintln!("lockstash: failed to initialize logging: {err}");
    }
}
