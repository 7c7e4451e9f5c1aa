use std::fmt;
use std::sync::Arc;

use crate::errors::Result;

/// The context a plugin was loaded in, entered around every call into the plugin.
pub trait IsolationContext: Send + Sync {
    fn name(&self) -> &str;

    fn enter(&self);

    fn exit(&self);

    /// Frees the context, no plugin call may run in it afterwards.
    fn release(&self) -> Result<()>;
}

// Who is responsible for releasing the context.
pub enum IsolationHandle {
    /// created for this filter alone, released with it
    Owned(Box<dyn IsolationContext>),
    /// supplied from outside and possibly shared by other filters, never released here
    Shared(Arc<dyn IsolationContext>),
}

impl IsolationHandle {
    pub fn context(&self) -> &dyn IsolationContext {
        match self {
            IsolationHandle::Owned(context) => context.as_ref(),
            IsolationHandle::Shared(context) => context.as_ref(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, IsolationHandle::Owned(_))
    }

    /// Enters the context until the guard is dropped.
    pub fn enter(&self) -> IsolationGuard<'_> {
        let context = self.context();
        context.enter();
        IsolationGuard { context }
    }
}

impl fmt::Debug for IsolationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_owned() { "Owned" } else { "Shared" };
        f.debug_tuple(kind).field(&self.context().name()).finish()
    }
}

/// Leaves the context on drop, also when the plugin call panics.
pub struct IsolationGuard<'a> {
    context: &'a dyn IsolationContext,
}

impl Drop for IsolationGuard<'_> {
    fn drop(&mut self) {
        self.context.exit();
    }
}
