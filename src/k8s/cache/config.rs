/**
 * Configuration constants for the watch source and controller plumbing
 */
/// Maximum number of consecutive failed restarts before a watch source gives up
pub const MAX_WATCH_RESTARTS: u32 = 50;

/// Maximum backoff time in seconds between restart attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Brief delay between restart attempts in seconds
pub const RESTART_DELAY_SECONDS: u64 = 1;

/// Channel buffer size for events flowing from the watch source into the store
pub const INGEST_CHANNEL_CAPACITY: usize = 100;

/// Channel buffer size for errors surfaced by one controller
pub const ERROR_CHANNEL_CAPACITY: usize = 100;

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_WATCH_RESTARTS > 0, "MAX_WATCH_RESTARTS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(INGEST_CHANNEL_CAPACITY > 0, "INGEST_CHANNEL_CAPACITY must be greater than 0");
    assert!(ERROR_CHANNEL_CAPACITY > 0, "ERROR_CHANNEL_CAPACITY must be greater than 0");
    assert!(RESTART_DELAY_SECONDS > 0, "RESTART_DELAY_SECONDS must be greater than 0");
};
