use std::collections::BTreeMap;
use std::fmt;

use crate::errors::Result;

/// A message entry as seen by the filters, before it is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub properties: BTreeMap<String, String>,
}

/// Where the entry is about to be delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterContext {
    pub topic: String,
    pub subscription: String,
    pub consumer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// deliver the entry
    Accept,
    /// skip the entry, it is acknowledged without delivery
    Reject,
    /// deliver the entry later
    Reschedule,
}

impl fmt::Display for FilterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            FilterResult::Accept => "accept",
            FilterResult::Reject => "reject",
            FilterResult::Reschedule => "reschedule",
        };
        f.write_str(result)
    }
}

pub trait EntryFilter: Send + Sync {
    fn name(&self) -> &str;

    fn filter_entry(&self, entry: &Entry, context: &FilterContext) -> FilterResult;

    /// Releases the resources of the filter, called once.
    fn close(&mut self) -> Result<()>;
}
