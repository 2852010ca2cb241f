/// Address and object reference types.
pub mod address;
/// Constants: card and region geometry, zone caps, thresholds.
pub mod constants;
/// Intrusive lock-free stacks of buffer ids, and the epoch-based grace period that makes
/// their pops ABA-safe.
pub mod lock_free_stack;
/// Logger initialization.
pub mod logger;
/// Runtime options.
pub mod options;
/// Small helpers that extend the standard library.
pub mod rust_util;
/// Safepoints and the suspendible thread set.
pub mod safepoint;
/// Test helpers and the mock VM binding.
#[cfg(any(test, feature = "mock_test"))]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
