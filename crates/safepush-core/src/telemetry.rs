//! Tracing initialisation for safepush binaries.
//!
//! Logs go to stderr so machine-readable command output on stdout stays
//! clean. `SAFEPUSH_LOG` (then `RUST_LOG`) overrides the default filter,
//! which keeps HTTP and runtime crates at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SAFEPUSH_LOG";

/// Crates whose events follow the requested level.
const OWN_TARGETS: &[&str] = &["safepush_core", "safepush"];

/// Filter directives used when no environment override is set.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(OWN_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Initialise the global tracing subscriber.
///
/// Only the first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let plain = (!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));
    let json = json.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
    });

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(plain)
        .with(json)
        .try_init()
        .ok();
}
