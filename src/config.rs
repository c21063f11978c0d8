//! Store tuning knobs.

/// Default capacity of the append notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Default number of messages a subscription reads per catch-up page.
pub const DEFAULT_CATCH_UP_PAGE_SIZE: usize = 500;

/// Configuration of a [`StreamStore`](crate::store::StreamStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Capacity of the broadcast channel that wakes subscriptions. A subscriber that
    /// falls this far behind sees a lag, which it treats as one more wakeup.
    pub notification_capacity: usize,
    /// Page size used by subscriptions while catching up and after each wakeup.
    pub catch_up_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            catch_up_page_size: DEFAULT_CATCH_UP_PAGE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Zero values are raised to 1; a zero-capacity broadcast channel or a zero-sized
    /// page would never make progress.
    pub(crate) fn normalized(self) -> Self {
        Self {
            notification_capacity: self.notification_capacity.max(1),
            catch_up_page_size: self.catch_up_page_size.max(1),
        }
    }
}
