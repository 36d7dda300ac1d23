use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global fmt subscriber. `RUST_LOG` overrides `default_directive`.
/// Returns false when a subscriber was already set.
pub fn init(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init("registry_client=debug");
        assert!(!super::init("registry_client=debug"));
    }
}
