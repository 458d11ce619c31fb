use crate::config::Config;
use log::LevelFilter;
use simplelog::{self, ConfigBuilder};

/// Log targets of this workspace. Below Trace only these are shown, which
/// keeps the HTTP stack and the redis client out of normal output.
const WORKSPACE_TARGETS: &[&str] = &["eventcast", "web", "sse", "cluster", "service"];

pub struct Logger {}

impl Logger {
    /// Installs the terminal logger. A second call leaves the first logger in place.
    pub fn init_logger(config: &Config) {
        let log_config = Self::build_log_config(config.log_level_filter);

        if let Err(e) = simplelog::TermLogger::init(
            Self::convert_level_filter(config.log_level_filter),
            log_config,
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ) {
            eprintln!("Logger already initialized: {e}");
        }
    }

    /// Converts log::LevelFilter to simplelog::LevelFilter.
    fn convert_level_filter(level: LevelFilter) -> simplelog::LevelFilter {
        match level {
            LevelFilter::Off => simplelog::LevelFilter::Off,
            LevelFilter::Error => simplelog::LevelFilter::Error,
            LevelFilter::Warn => simplelog::LevelFilter::Warn,
            LevelFilter::Info => simplelog::LevelFilter::Info,
            LevelFilter::Debug => simplelog::LevelFilter::Debug,
            LevelFilter::Trace => simplelog::LevelFilter::Trace,
        }
    }

    /// Trace shows every target, any other level only the workspace's own.
    fn workspace_only(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    fn build_log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        // Prefix every line with its module path, e.g. `sse::manager`
        builder.set_target_level(simplelog::LevelFilter::Error);

        if Self::workspace_only(level) {
            for target in WORKSPACE_TARGETS {
                builder.add_filter_allow_str(target);
            }
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_targets_cover_every_crate() {
        for target in ["eventcast", "web", "sse", "cluster", "service"] {
            assert!(
                WORKSPACE_TARGETS.contains(&target),
                "{target} should be logged"
            );
        }
        assert!(!WORKSPACE_TARGETS.contains(&"redis"));
    }

    #[test]
    fn test_only_trace_shows_dependency_logs() {
        assert!(!Logger::workspace_only(LevelFilter::Trace));
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
        ] {
            assert!(Logger::workspace_only(level), "{level} should filter");
        }
    }

    #[test]
    fn test_build_log_config_for_every_level() {
        for level in [LevelFilter::Info, LevelFilter::Trace] {
            let _config = Logger::build_log_config(level);
        }
    }

    #[test]
    fn test_convert_level_filter_keeps_verbosity() {
        assert_eq!(
            Logger::convert_level_filter(LevelFilter::Warn) as u8,
            simplelog::LevelFilter::Warn as u8
        );
        assert_eq!(
            Logger::convert_level_filter(LevelFilter::Trace) as u8,
            simplelog::LevelFilter::Trace as u8
        );
    }
}
