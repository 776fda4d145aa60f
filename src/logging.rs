use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level.
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        filter_for(verbosity)
    }
}

fn filter_for(verbosity: u8) -> EnvFilter {
    match verbosity {
        0 => EnvFilter::new("sshdeck=warn"),
        1 => EnvFilter::new("sshdeck=info"),
        2 => EnvFilter::new("sshdeck=debug"),
        _ => EnvFilter::new("sshdeck=trace"),
    }
}

/// Log to stderr so command output on stdout stays clean.
pub fn init(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(create_env_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(filter_for(0).max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(filter_for(1).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(filter_for(2).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(filter_for(7).max_level_hint(), Some(LevelFilter::TRACE));
    }
}
