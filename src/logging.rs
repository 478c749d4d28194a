//! Logger setup for binaries and tests embedding the engine.
//!
//! The engine itself only emits through the `log` facade.

use std::io::Write;

/// Installs an `env_logger` backend.
///
/// The default filter is `info`, or `debug` when `verbose` is set, and
/// `RUST_LOG` overrides both. Warnings and errors carry a `[LEVEL]`
/// prefix. Returns `false` when a logger was already installed.
pub fn init_logging(verbose: bool) -> bool {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| match record.level() {
            log::Level::Warn | log::Level::Error => {
                writeln!(buf, "[{}] {}", record.level(), record.args())
            }
            _ => writeln!(buf, "{}", record.args()),
        })
        .try_init()
        .is_ok()
}
