//! Console logger setup
//!
//! Verbosity-indexed fern dispatch to stdout. Library crates only use
//! the `log` facade; whoever embeds the kernel decides whether and how
//! loudly to log.

use log::LevelFilter;

/// Install a console logger at the given verbosity
///
/// 0 = errors only, 1 = warnings, 2 = info, 3 = debug, 4+ = trace.
/// Installing twice returns the underlying `SetLoggerError`.
pub fn init_logger(verbosity: u64) -> Result<(), fern::InitError> {
    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
