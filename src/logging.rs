//! One-shot `slog` drain installation, mirroring the teacher's
//! `slog_scope::set_global_logger` pattern. Stdout is reserved for the CNI
//! result on stdout; every log line goes to stderr.

use slog::{Drain, Logger};

use crate::config::{LogFormat, RuntimeConfig};

pub fn init(config: &RuntimeConfig) -> slog_scope::GlobalLoggerGuard {
    let logger = build_logger(config);
    slog_scope::set_global_logger(logger)
}

fn build_logger(config: &RuntimeConfig) -> Logger {
    let level = config.log_level;
    match config.log_format {
        LogFormat::Term => {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, slog::o!("program" => config.program_name))
        }
        LogFormat::Json => {
            let drain = slog_json::Json::new(std::io::stderr())
                .add_default_keys()
                .build()
                .fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, slog::o!("program" => config.program_name))
        }
    }
}
