use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Map repeated `-v` flags onto a tracing level.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber. Logs go to stderr so the live status view
/// on stdout stays readable.
pub fn setup_logging(level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .with_file(level >= Level::DEBUG)
        .with_line_number(level >= Level::DEBUG)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
