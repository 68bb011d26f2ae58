/// `fern`-based console + file logger with log rotation.
pub mod logger;
