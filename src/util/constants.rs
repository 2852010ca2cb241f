/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of heap bytes covered by one card table entry
pub const LOG_BYTES_IN_CARD: u8 = 9;
/// The number of heap bytes covered by one card table entry
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// The default region size (1MB) used when a binding does not override it.
pub const DEFAULT_LOG_BYTES_IN_REGION: u8 = LOG_BYTES_IN_MBYTE;

/// Largest buffer capacity (in entries) the options accept.
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

/// The "never" threshold. Comparing any card count against it is false.
pub const THRESHOLD_NEVER: usize = usize::MAX;

/// Pending-list length above which a release tries to move nodes to the free list.
pub const TRANSFER_PENDING_THRESHOLD: usize = 10;

#[cfg(target_pointer_width = "64")]
/// Upper bound of the yellow zone, in cards.
pub const MAX_YELLOW_ZONE: usize = 1 << 29;
#[cfg(target_pointer_width = "32")]
/// Upper bound of the yellow zone, in cards.
pub const MAX_YELLOW_ZONE: usize = 1 << 27;
/// Upper bound of the green zone, in cards.
pub const MAX_GREEN_ZONE: usize = MAX_YELLOW_ZONE / 2;
/// Upper bound of the red zone, in cards.
pub const MAX_RED_ZONE: usize = i32::MAX as usize;

const_assert!(MAX_GREEN_ZONE <= MAX_YELLOW_ZONE);
const_assert!(MAX_YELLOW_ZONE <= MAX_RED_ZONE);
const_assert!(DEFAULT_LOG_BYTES_IN_REGION > LOG_BYTES_IN_CARD);
