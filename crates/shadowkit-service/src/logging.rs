//! Logging facilities with log4rs

use std::path::Path;

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};

use crate::config::LogConfig;

/// Error of initializing the logger
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid logging configuration, {0}")]
    Config(String),
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

/// Initialize logger ([log4rs](https://crates.io/crates/log4rs)) from yaml configuration file
pub fn init_with_file<P>(path: P) -> Result<(), Error>
where
    P: AsRef<Path>,
{
    log4rs::init_file(path, Default::default()).map_err(|err| Error::Config(err.to_string()))
}

/// Initialize logger with provided configuration
///
/// `config.config_path` takes precedence if it is set.
pub fn init_with_config(bin_name: &str, config: &LogConfig) -> Result<(), Error> {
    if let Some(ref path) = config.config_path {
        return init_with_file(path);
    }

    let debug_level = config.level;

    let mut pattern = String::new();
    if !config.format.without_time {
        pattern += "{d} ";
    }
    pattern += "{h({l}):<5} ";
    if debug_level >= 1 {
        pattern += "[{P}:{I}] [{M}] ";
    }
    pattern += "{m}{n}";

    let logging_builder = Config::builder().appender(
        Appender::builder().build(
            "console",
            Box::new(
                ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(&pattern)))
                    .target(Target::Stderr)
                    .build(),
            ),
        ),
    );

    // (our crates, everything else)
    let (l1, l2) = match debug_level {
        0 => (LevelFilter::Info, LevelFilter::Off),
        1 => (LevelFilter::Debug, LevelFilter::Off),
        2 => (LevelFilter::Trace, LevelFilter::Off),
        3 => (LevelFilter::Trace, LevelFilter::Debug),
        _ => (LevelFilter::Off, LevelFilter::Trace),
    };

    let config = match debug_level {
        0..=3 => logging_builder
            .logger(Logger::builder().build(bin_name, l1))
            .logger(Logger::builder().build("shadowkit", l1))
            .logger(Logger::builder().build("shadowkit_service", l1)),
        _ => logging_builder,
    }
    .build(Root::builder().appender("console").build(l2))
    .map_err(|err| Error::Config(err.to_string()))?;

    log4rs::init_config(config)?;
    Ok(())
}

/// Init a default logger, `info` for our crates only
pub fn init_with_default(bin_name: &str) -> Result<(), Error> {
    init_with_config(bin_name, &LogConfig::default())
}
