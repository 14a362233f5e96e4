//! Logger setup shared by the binaries
//!
//! Progress goes through the `log` facade; `RUST_LOG` overrides the level.

use std::io::Write;

/// Initialise `env_logger` with `info` as the default level
pub fn init() {
    init_with_default("info");
}

pub fn init_with_default(filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            let level = record.level();
            let style = buf.default_level_style(level);
            writeln!(buf, "{style}{level:>5}{style:#} {}", record.args())
        })
        .init();
}
