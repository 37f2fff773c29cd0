use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "opendrive_fs=info";

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays machine readable.
pub fn init_tracing() -> anyhow::Result<()> {
    let directives = filter_directives(|name| std::env::var(name).ok());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter: {directives}"))?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

fn filter_directives<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["OPENDRIVE_LOG", "RUST_LOG"]
        .into_iter()
        .filter_map(|name| lookup(name))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_variable_wins_over_rust_log() {
        let directives = filter_directives(|name| match name {
            "OPENDRIVE_LOG" => Some("opendrive_fs=debug".into()),
            "RUST_LOG" => Some("warn".into()),
            _ => None,
        });
        assert_eq!(directives, "opendrive_fs=debug");
    }

    #[test]
    fn falls_back_to_rust_log_then_default() {
        let rust_log = filter_directives(|name| (name == "RUST_LOG").then(|| "trace".into()));
        assert_eq!(rust_log, "trace");

        let blank = filter_directives(|name| (name == "OPENDRIVE_LOG").then(|| "  ".into()));
        assert_eq!(blank, DEFAULT_FILTER);
    }
}
