//! Lifecycle of the entry filters loaded from plugins.
//!
//! A plugin filter runs inside the isolation context it was loaded with.
//! [`EntryFilterWithIsolation`] pairs the two and makes sure the context is only
//! released by whoever owns it.

mod adapter;
mod errors;
mod filter;
mod isolation;

pub use adapter::EntryFilterWithIsolation;
pub use errors::{FilterError, Result};
pub use filter::{Entry, EntryFilter, FilterContext, FilterResult};
pub use isolation::{IsolationContext, IsolationGuard, IsolationHandle};
