//! Session configuration.

/// Default delay between two busy polls.
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 2;

/// Default bound on busy polls. With the default interval this allows bulk
/// erases of several minutes.
pub const DEFAULT_MAX_POLLS: u32 = 150_000;

/// Default upper bound on the data bytes moved by one read command.
pub const DEFAULT_READ_CHUNK: usize = 2048;

/// How the region to be programmed is erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStrategy {
    /// Erase every sector touched by the data.
    Sectors,
    /// Erase every subsector touched by the data. Chips without subsector
    /// erase use sectors instead.
    Subsectors,
    /// Erase the whole chip with a single command.
    Bulk,
}

impl Default for EraseStrategy {
    fn default() -> Self {
        EraseStrategy::Sectors
    }
}

/// Parameters of a [`Flash`](crate::flash::Flash) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(crate) poll_interval_ms: u32,
    pub(crate) max_polls: Option<u32>,
    pub(crate) read_chunk: usize,
    pub(crate) erase: EraseStrategy,
    pub(crate) trace_frames: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_polls: Some(DEFAULT_MAX_POLLS),
            read_chunk: DEFAULT_READ_CHUNK,
            erase: EraseStrategy::default(),
            trace_frames: false,
        }
    }
}

impl Config {
    /// Sets the delay between busy polls.
    pub fn poll_interval_ms(mut self, ms: u32) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Bounds the number of busy polls before giving up with
    /// [`Error::Unresponsive`](crate::Error::Unresponsive). `None` waits
    /// forever.
    pub fn max_polls(mut self, polls: Option<u32>) -> Self {
        self.max_polls = polls;
        self
    }

    /// Sets the largest number of data bytes read by a single command.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "read chunk size must not be 0");
        self.read_chunk = bytes;
        self
    }

    pub fn erase(mut self, strategy: EraseStrategy) -> Self {
        self.erase = strategy;
        self
    }

    /// Logs the first bytes of every frame sent and received at trace level.
    pub fn trace_frames(mut self, enable: bool) -> Self {
        self.trace_frames = enable;
        self
    }

    pub fn erase_strategy(&self) -> EraseStrategy {
        self.erase
    }
}
