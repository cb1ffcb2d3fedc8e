//! Scoped release list drained in reverse registration order.

use core::fmt;

use crate::undo::UndoEntry;
use crate::Result;

/// One cleanup step registered with a [`ShutdownRegistry`].
pub enum ShutdownAction {
    /// Release the enumeration context.
    ReleaseContext,
    /// Write a config register back to the value it had before this process changed it.
    RestoreConfig(UndoEntry),
    /// Caller-provided cleanup.
    Callback {
        name: &'static str,
        run: Box<dyn FnOnce() -> Result<()>>,
    },
}

impl fmt::Debug for ShutdownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleaseContext => f.write_str("ReleaseContext"),
            Self::RestoreConfig(entry) => f.debug_tuple("RestoreConfig").field(entry).finish(),
            Self::Callback { name, .. } => f.debug_struct("Callback").field("name", name).finish(),
        }
    }
}

/// Append-only list of cleanup actions.
///
/// Actions are handed back last-registered-first by [`ShutdownRegistry::pop`], so overlapping
/// register writes are peeled back in LIFO order and the enumeration context (registered first)
/// is released last.
#[derive(Debug, Default)]
pub struct ShutdownRegistry {
    actions: Vec<ShutdownAction>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: ShutdownAction) {
        tracing::trace!(?action, "registered shutdown action");
        self.actions.push(action);
    }

    pub fn register_callback(
        &mut self,
        name: &'static str,
        run: impl FnOnce() -> Result<()> + 'static,
    ) {
        self.register(ShutdownAction::Callback {
            name,
            run: Box::new(run),
        });
    }

    pub fn pop(&mut self) -> Option<ShutdownAction> {
        self.actions.pop()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Outcome of draining a [`ShutdownRegistry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub executed: usize,
    pub failed: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
