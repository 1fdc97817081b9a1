use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

/// Initialize logging for the host process.
///
/// Installs a `fern` dispatcher that writes to stdout. Only the first call
/// installs a logger; the return value reports whether this process owns
/// the dispatcher (it is `false` when another logger was already set).
pub fn init_logging(level: LevelFilter) -> bool {
    *LOGGER_INSTALLED.get_or_init(|| dispatch(level).chain(std::io::stdout()).apply().is_ok())
}

fn dispatch(level: LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds the dispatcher without installing it; tests capture logs themselves.
    #[test]
    fn test_dispatch_uses_requested_level() {
        let (level, _logger) = dispatch(LevelFilter::Debug)
            .chain(Box::new(std::io::sink()) as Box<dyn std::io::Write + Send>)
            .into_log();

        assert_eq!(level, LevelFilter::Debug);
    }
}
