//! Network module - Handles the link between host and device
//!
//! Provides:
//! - Transports (TCP, serial) that open byte channels to a device
//! - Request multiplexing over a single channel
//! - Connection management, teardown and reconnection

mod transport;
mod serial;
mod multiplexer;
mod connection;
mod retry;

pub use transport::*;
pub use serial::*;
pub use multiplexer::*;
pub use connection::*;
pub use retry::*;

use std::sync::{Mutex, MutexGuard};

/// Acquire a std mutex, ignoring poisoning.
///
/// None of the guarded sections can panic halfway through an update.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
