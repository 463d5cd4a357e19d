use log::LevelFilter;

/// Install `env_logger` for this crate.
///
/// 0 is the most verbose, 4 only reports errors. Calling it again is a no-op.
pub fn init(log_level: usize) {
    let level = match log_level {
        #[cfg(debug_assertions)]
        0 => LevelFilter::Trace,
        #[cfg(not(debug_assertions))]
        0 => LevelFilter::Debug,
        1 => LevelFilter::Debug,
        2 => LevelFilter::Info,
        3 => LevelFilter::Warn,
        4 => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_module("overlay", level)
        .try_init()
        .ok();
}
