use std::fmt;

/// Severity of a log [`Record`], ordered from most to least severe to match
/// the historical syslog-style levels the reactor's components log at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Emerg,
    Alert,
    Crit,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Emerg => "Emerg",
            Level::Alert => "Alert",
            Level::Crit => "Crit",
            Level::Error => "Error",
            Level::Warn => "Warn",
            Level::Notice => "Notice",
            Level::Info => "Info",
            Level::Debug => "Debug",
        };
        f.write_str(s)
    }
}

/// A log entry queued on the ring. Kept deliberately small: just the level
/// and an already-formatted payload, so producers never block on anything
/// heavier than a `String` allocation.
#[derive(Debug)]
pub struct Record {
    pub level: Level,
    pub payload: String,
}
