use tracing_subscriber::EnvFilter;

/// HTTP stack crates kept at `warn` unless `RUST_LOG` says otherwise
const TRANSPORT_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls"];

fn directives(log_level: &str) -> String {
    let mut directives = log_level.to_string();
    for name in TRANSPORT_CRATES {
        directives.push_str(&format!(",{}=warn", name));
    }
    directives
}

/// Initialize structured logging with tracing-subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to the provided level.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_quiet_transport() {
        assert_eq!(
            directives("debug"),
            "debug,hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn"
        );
    }
}
