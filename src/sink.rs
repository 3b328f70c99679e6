//! Categorized log events emitted by the endpoint core.
//!
//! The core never renders or filters its own output; it hands every event to
//! a [`LogSink`] together with a [`Category`]. The default sink routes events
//! through `tracing` and applies a runtime-adjustable [`PrintFilter`] mask.
//! Errors, warnings and command responses always pass the filter.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info, warn};

/// Message category attached to every event the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Error messages (always displayed).
    Error,
    /// Warning messages (always displayed).
    Warning,
    /// Responses to user commands (always displayed).
    Query,
    /// Current status information (always displayed).
    Status,
    /// Messages echoed by a worker.
    Sent,
    /// Messages received back on an outbound connection.
    Received,
    /// Socket lifecycle information.
    Socket,
    /// Everything else.
    Other,
}

impl Category {
    fn mask(self) -> u32 {
        match self {
            Category::Error => 0x0001,
            Category::Warning => 0x0002,
            Category::Query => 0x0004,
            Category::Status => 0x0008,
            Category::Sent => 0x0010,
            Category::Received => 0x0020,
            Category::Socket => 0x0040,
            Category::Other => 0x0080,
        }
    }
}

/// Bitmask selecting which optional categories are displayed.
///
/// Error, Warning, Query and Status are not selectable; they always pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintFilter(pub u32);

impl PrintFilter {
    pub const NONE: PrintFilter = PrintFilter(0);
    pub const SENT: PrintFilter = PrintFilter(0x0010);
    pub const RECEIVED: PrintFilter = PrintFilter(0x0020);
    pub const SOCKET: PrintFilter = PrintFilter(0x0040);
    pub const OTHER: PrintFilter = PrintFilter(0x0080);
    pub const ALL: PrintFilter = PrintFilter(0x00f0);

    /// Mask of categories that cannot be filtered out.
    const ALWAYS: u32 = 0x000f;

    /// Parse the flag letters of the `#p` command.
    ///
    /// `0` clears the mask, `a` selects everything, and `s`, `r`, `c`, `o`
    /// enable the sent, received, socket and other categories. Returns the
    /// offending character if an unknown flag is seen.
    pub fn parse(flags: &str) -> Result<PrintFilter, char> {
        let mut mask = 0u32;
        for ch in flags.trim().chars() {
            match ch {
                '0' => mask = 0,
                'a' => mask = PrintFilter::ALL.0,
                's' => mask |= PrintFilter::SENT.0,
                'r' => mask |= PrintFilter::RECEIVED.0,
                'c' => mask |= PrintFilter::SOCKET.0,
                'o' => mask |= PrintFilter::OTHER.0,
                other => return Err(other),
            }
        }
        Ok(PrintFilter(mask))
    }

    /// Whether the filter lets events of `category` through.
    pub fn allows(self, category: Category) -> bool {
        (self.0 | Self::ALWAYS) & category.mask() != 0
    }
}

impl fmt::Display for PrintFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Destination for categorized events.
///
/// Implementations must be callable from the dispatcher and from worker
/// threads, hence `Send + Sync`.
pub trait LogSink: Send + Sync {
    fn emit(&self, category: Category, message: &str);

    /// Replace the display filter mask.
    fn set_filter(&self, filter: PrintFilter);
}

/// Sink rendering events through `tracing`.
pub struct TracingSink {
    filter: AtomicU32,
}

impl TracingSink {
    pub fn new(filter: PrintFilter) -> Self {
        Self {
            filter: AtomicU32::new(filter.0),
        }
    }
}

impl LogSink for TracingSink {
    fn emit(&self, category: Category, message: &str) {
        let filter = PrintFilter(self.filter.load(Ordering::Relaxed));
        if !filter.allows(category) {
            return;
        }

        match category {
            Category::Error => error!("{message}"),
            Category::Warning => warn!("{message}"),
            Category::Sent => info!("> {message}"),
            Category::Received => info!("< {message}"),
            Category::Query | Category::Status | Category::Socket | Category::Other => {
                info!("{message}")
            }
        }
    }

    fn set_filter(&self, filter: PrintFilter) {
        self.filter.store(filter.0, Ordering::Relaxed);
    }
}

/// Truncate a message for display, the way the interactive log lines do.
pub fn preview(text: &str) -> String {
    text.chars().take(30).collect()
}

/// Sink that records events in memory. Test support.
#[cfg(test)]
pub struct MemorySink {
    pub events: std::sync::Mutex<Vec<(Category, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self, category: Category) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn emit(&self, category: Category, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((category, message.to_string()));
    }

    fn set_filter(&self, _filter: PrintFilter) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_on_categories() {
        let filter = PrintFilter::NONE;
        assert!(filter.allows(Category::Error));
        assert!(filter.allows(Category::Warning));
        assert!(filter.allows(Category::Query));
        assert!(filter.allows(Category::Status));
        assert!(!filter.allows(Category::Sent));
        assert!(!filter.allows(Category::Received));
        assert!(!filter.allows(Category::Socket));
        assert!(!filter.allows(Category::Other));
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(PrintFilter::parse("a"), Ok(PrintFilter::ALL));
        assert_eq!(PrintFilter::parse("0"), Ok(PrintFilter::NONE));
        assert_eq!(
            PrintFilter::parse("sr"),
            Ok(PrintFilter(
                PrintFilter::SENT.0 | PrintFilter::RECEIVED.0
            ))
        );
        assert_eq!(PrintFilter::parse("co"), Ok(PrintFilter(0x00c0)));
        // a reset mid-string drops earlier selections
        assert_eq!(PrintFilter::parse("s0"), Ok(PrintFilter::NONE));
        assert_eq!(PrintFilter::parse("sq"), Err('q'));
    }

    #[test]
    fn test_selected_categories_pass() {
        let filter = PrintFilter::SENT;
        assert!(filter.allows(Category::Sent));
        assert!(!filter.allows(Category::Received));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(100);
        assert_eq!(preview(&long).len(), 30);
        assert_eq!(preview("short"), "short");
    }
}
