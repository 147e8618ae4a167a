use std::io::Write;

use chrono::Local;
use log::{LevelFilter, SetLoggerError};

/// Installs the console logger.
///
/// `level` is the default filter; `RUST_LOG` overrides it when set.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
}
