//! Shared framework context
//!
//! A [`Context`] is created once by the embedding framework and handed to
//! every session. The session core uses it for exactly one collaborator
//! hook: an external deadline provider (typically a USB transfer
//! subsystem) whose pending timeout is folded into each poll.

use std::cell::RefCell;
use std::rc::Rc;

use crate::session::SourceKey;
use crate::Result;

/// A subsystem with its own internal deadlines, piggy-backed onto the
/// session poll.
///
/// The provider registers a regular event source for its descriptors; the
/// iteration engine additionally asks it for the next pending timeout and
/// wakes that source when the deadline passes even if no descriptor is
/// ready.
pub trait DeadlineProvider {
    /// Key of the event source registered on behalf of this subsystem.
    fn source_key(&self) -> SourceKey;

    /// Relative time in microseconds until the subsystem next needs
    /// servicing, or `None` when it has no pending deadline.
    fn next_timeout_us(&self) -> Result<Option<i64>>;
}

/// Shared state of the embedding framework, opaque to the session apart
/// from the deadline-provider hook.
#[derive(Default)]
pub struct Context {
    deadline_provider: RefCell<Option<Rc<dyn DeadlineProvider>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the external deadline provider. Replaces any previous one.
    pub fn set_deadline_provider(&self, provider: Rc<dyn DeadlineProvider>) {
        *self.deadline_provider.borrow_mut() = Some(provider);
    }

    /// Deactivate the external deadline provider.
    pub fn clear_deadline_provider(&self) {
        *self.deadline_provider.borrow_mut() = None;
    }

    pub(crate) fn deadline_provider(&self) -> Option<Rc<dyn DeadlineProvider>> {
        self.deadline_provider.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(SourceKey);

    impl DeadlineProvider for Fixed {
        fn source_key(&self) -> SourceKey {
            self.0
        }
        fn next_timeout_us(&self) -> Result<Option<i64>> {
            Ok(Some(1_000))
        }
    }

    #[test]
    fn provider_install_and_clear() {
        let ctx = Context::new();
        assert!(ctx.deadline_provider().is_none());

        ctx.set_deadline_provider(Rc::new(Fixed(SourceKey::Fd(7))));
        let provider = ctx.deadline_provider().expect("provider installed");
        assert_eq!(provider.source_key(), SourceKey::Fd(7));

        ctx.clear_deadline_provider();
        assert!(ctx.deadline_provider().is_none());
    }
}
