//! configurable constants for quorum

use std::time::Duration;

/// Default channel size for item state events
pub const EVENT_CHANNEL_SIZE: usize = 100_000;

/// Default oldest age of an item accepted for registration
pub const DEFAULT_MAX_ITEM_CREATION_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Extra retention of revoked records beyond [`DEFAULT_MAX_ITEM_CREATION_AGE`]
pub const DEFAULT_REVOKED_ITEM_EXTRA_EXPIRATION: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Default retention of declined records
pub const DEFAULT_DECLINED_ITEM_EXPIRATION: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Default item cache lifetime
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(20 * 60);

/// Default election timeout
pub const DEFAULT_MAX_ELECTIONS_TIME: Duration = Duration::from_secs(15 * 60);

/// Default interval between vote re-requests
pub const DEFAULT_POLL_TIME: Duration = Duration::from_millis(1000);

/// Default interval between result re-announcements
pub const DEFAULT_CONSENSUS_RECEIVED_CHECK_TIME: Duration = Duration::from_millis(1000);

/// Default window for result re-announcements
pub const DEFAULT_MAX_CONSENSUS_RECEIVED_CHECK_TIME: Duration = Duration::from_secs(15 * 60);

/// Default interval between state query re-sends
pub const DEFAULT_RESYNC_TIME: Duration = Duration::from_millis(1000);

/// Default resync timeout
pub const DEFAULT_MAX_RESYNC_TIME: Duration = Duration::from_secs(5 * 60);

/// Default interval at which waiters re-read the ledger
pub const DEFAULT_CHECK_ITEM_TIME: Duration = Duration::from_millis(200);
