//! Logging setup. Colorized level, timestamped, chained to stderr.

pub fn setup_logging(verbosity: i8) {
    let level = match verbosity {
        i8::MIN..=-1 => log::LevelFilter::Warn,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let level = std::env::var("RESOLVERD_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(level);

    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{level}\x1b[0m"),
                log::Level::Warn => format!("\x1b[33m{level}\x1b[0m"),
                log::Level::Info => format!("\x1b[32m{level}\x1b[0m"),
                log::Level::Debug => format!("\x1b[34m{level}\x1b[0m"),
                log::Level::Trace => format!("\x1b[36m{level}\x1b[0m"),
            };
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                colored_level,
                message
            ));
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();

    if result.is_err() {
        eprintln!("resolverd: failed to set up logging, continuing with eprintln");
    }
}
