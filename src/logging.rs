use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

/// Level the logger was installed with.
static INSTALLED: OnceCell<LevelFilter> = OnceCell::new();

/// Level from `UMH_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var("UMH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

/// Parse a level name such as `"debug"` (case-insensitive).
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Install the stderr logger at the level given by `UMH_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    init_with_level(env_level());
}

/// Install the stderr logger at `level`. Only the first call has any effect.
pub fn init_with_level(level: LevelFilter) {
    INSTALLED.get_or_init(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if installed.is_err() {
            // Someone else owns the global logger; just honour the level.
            log::set_max_level(level);
        }
        level
    });
}

/// The level passed to the first successful init, if logging was initialised.
pub fn installed_level() -> Option<LevelFilter> {
    INSTALLED.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn init_is_idempotent() {
        init_with_level(LevelFilter::Debug);
        init_with_level(LevelFilter::Error);
        assert_eq!(installed_level(), Some(LevelFilter::Debug));
    }
}
