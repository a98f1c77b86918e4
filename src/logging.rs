use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;
use std::sync::Once;

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}\n";

fn level_filter(level: &str) -> log::LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Initializes log4rs with a console appender and, when configured, a file
/// appender. Safe to call more than once; only the first call takes effect.
pub fn setup_logging(cfg: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut result: Result<(), String> = Ok(());

    INIT.call_once(|| {
        result = (|| {
            let console = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                .build();

            let mut builder = Config::builder()
                .appender(Appender::builder().build("console", Box::new(console)));
            let mut root = Root::builder().appender("console");

            if let Some(log_file) = &cfg.log_file {
                if let Some(dir) = Path::new(log_file).parent() {
                    if !dir.as_os_str().is_empty() {
                        fs::create_dir_all(dir)
                            .map_err(|e| format!("Failed to create log directory: {}", e))?;
                    }
                }
                let appender = FileAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                    .append(true)
                    .build(log_file)
                    .map_err(|e| format!("Failed to create log file: {}", e))?;
                builder = builder.appender(Appender::builder().build("file", Box::new(appender)));
                root = root.appender("file");
            }

            let config = builder
                .build(root.build(level_filter(&cfg.log_level)))
                .map_err(|e| format!("Failed to build log config: {}", e))?;

            log4rs::init_config(config)
                .map_err(|e| format!("Logging initialization failed: {}", e))?;
            Ok(())
        })();
    });

    result.map_err(|msg| {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg)) as Box<dyn std::error::Error>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_defaults_to_info() {
        assert_eq!(level_filter("nonsense"), log::LevelFilter::Info);
        assert_eq!(level_filter("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(level_filter("warn"), log::LevelFilter::Warn);
    }
}
