use tracing_subscriber::{prelude::*, util::SubscriberInitExt, EnvFilter};

/// What the replay logs when `RUST_LOG` is unset: each block and upgrade, but
/// not every storage access.
const DEFAULT_DIRECTIVES: &str = "info,overlay_state::storage=warn";

/// Picks `RUST_LOG` when it is set and non-empty.
fn directives(from_env: Option<String>) -> String {
    from_env
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_owned())
}

/// Installs the global subscriber for the replay binary. Records the overlay
/// crates emit through `log` end up here too.
pub fn init() {
    let filter = EnvFilter::new(directives(std::env::var(EnvFilter::DEFAULT_ENV).ok()));
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_filter(filter),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_the_default() {
        assert_eq!(directives(None), DEFAULT_DIRECTIVES);
        assert_eq!(directives(Some("  ".into())), DEFAULT_DIRECTIVES);
        assert_eq!(directives(Some("overlay_state=trace".into())), "overlay_state=trace");
    }
}
