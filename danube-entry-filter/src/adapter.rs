use tracing::{debug, info, trace, warn};

use crate::errors::Result;
use crate::filter::{Entry, EntryFilter, FilterContext, FilterResult};
use crate::isolation::IsolationHandle;

// Runs a plugin filter inside the isolation context it was loaded with.
//
// Closing releases the filter first, inside its context, then the context itself when the
// adapter owns it. A shared context outlives the adapter.
pub struct EntryFilterWithIsolation {
    name: String,
    filter: Option<Box<dyn EntryFilter>>,
    isolation: Option<IsolationHandle>,
}

impl EntryFilterWithIsolation {
    pub fn new(filter: Box<dyn EntryFilter>, isolation: IsolationHandle) -> Self {
        EntryFilterWithIsolation {
            name: filter.name().to_owned(),
            filter: Some(filter),
            isolation: Some(isolation),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.filter.is_none()
    }
}

impl EntryFilter for EntryFilterWithIsolation {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_entry(&self, entry: &Entry, context: &FilterContext) -> FilterResult {
        let (Some(filter), Some(isolation)) = (&self.filter, &self.isolation) else {
            warn!(filter = %self.name, topic = %context.topic, "entry filter closed, entry rejected");
            return FilterResult::Reject;
        };

        let _guard = isolation.enter();
        let result = filter.filter_entry(entry, context);
        trace!(
            filter = %self.name,
            topic = %context.topic,
            subscription = %context.subscription,
            %result,
            "entry filtered"
        );
        result
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut filter) = self.filter.take() else {
            return Ok(());
        };

        let closed = match &self.isolation {
            Some(isolation) => {
                let _guard = isolation.enter();
                filter.close()
            }
            None => filter.close(),
        };
        drop(filter);
        if let Err(err) = &closed {
            warn!(filter = %self.name, "{}", err);
        }

        let released = match self.isolation.take() {
            Some(IsolationHandle::Owned(context)) => context.release(),
            Some(IsolationHandle::Shared(context)) => {
                debug!(
                    filter = %self.name,
                    context = context.name(),
                    "shared isolation context left to its owner"
                );
                Ok(())
            }
            None => Ok(()),
        };

        info!(filter = %self.name, "entry filter closed");
        closed.and(released)
    }
}

impl Drop for EntryFilterWithIsolation {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(err) = self.close() {
                warn!(filter = %self.name, "entry filter dropped without a clean close: {}", err);
            }
        }
    }
}
