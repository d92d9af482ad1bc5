use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_tracing(verbosity_level: u8) {
    let default_level = match verbosity_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over the verbosity flag when set
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("unable to set global subscriber");
}
