//! Message dispatch: route decoded frames to handlers by service category and
//! message id.
//!
//! The [`DispatchRegistry`] is filled once during service bring-up and then
//! shared read-only (behind an `Arc`) by every connection's receive loop, so
//! the lookup path takes no lock.

use std::collections::HashMap;

use crate::service::ServiceCategory;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Trait for message handlers.
///
/// `bytes[offset..offset + len]` is the frame payload. The slice is the
/// receive loop's read buffer and is only valid for the duration of the call.
pub trait MessageHandler: Send + Sync {
    /// Process one payload.
    fn handle(&self, bytes: &[u8], offset: usize, len: usize);
}

/// Blanket implementation for closures.
impl<F> MessageHandler for F
where
    F: Fn(&[u8], usize, usize) + Send + Sync,
{
    fn handle(&self, bytes: &[u8], offset: usize, len: usize) {
        self(bytes, offset, len);
    }
}

/// Errors raised while registering handlers.
///
/// These are configuration mistakes; callers should fail startup on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// A handler already exists for this category and id.
    #[error("duplicate handler for message {message_id} in {category:?}")]
    DuplicateHandler {
        /// The category of the rejected registration.
        category: ServiceCategory,
        /// The message id of the rejected registration.
        message_id: u32,
    },

    /// Handlers must be registered against exactly one known category.
    #[error("handlers must be registered against a single category, got {0:?}")]
    InvalidCategory(ServiceCategory),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Routes `(category, message_id)` pairs to registered handlers.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<ServiceCategory, HashMap<u32, Box<dyn MessageHandler>>>,
}

impl DispatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `message_id` within `category`.
    ///
    /// An existing registration is never replaced.
    pub fn register<H: MessageHandler + 'static>(
        &mut self,
        category: ServiceCategory,
        message_id: u32,
        handler: H,
    ) -> Result<(), RegisterError> {
        if !category.is_single() {
            return Err(RegisterError::InvalidCategory(category));
        }

        let ids = self.handlers.entry(category).or_default();
        if ids.contains_key(&message_id) {
            return Err(RegisterError::DuplicateHandler {
                category,
                message_id,
            });
        }
        ids.insert(message_id, Box::new(handler));
        tracing::debug!("Registered handler for message {message_id} in {category:?}");
        Ok(())
    }

    /// Find the handler for `message_id`, checking the categories of
    /// `categories` in precedence order (Common, Game, Login, then Cheat when
    /// cheats are enabled).
    pub fn resolve(
        &self,
        categories: ServiceCategory,
        message_id: u32,
    ) -> Option<&dyn MessageHandler> {
        categories.precedence().find_map(|category| {
            self.handlers
                .get(&category)
                .and_then(|ids| ids.get(&message_id))
                .map(|handler| handler.as_ref())
        })
    }

    /// Resolve and invoke the handler for one payload.
    ///
    /// Message ids come off the network, so a miss is logged and the frame
    /// dropped. Returns `true` if a handler ran.
    pub fn dispatch(
        &self,
        categories: ServiceCategory,
        message_id: u32,
        bytes: &[u8],
        offset: usize,
        len: usize,
    ) -> bool {
        match self.resolve(categories, message_id) {
            Some(handler) => {
                handler.handle(bytes, offset, len);
                true
            }
            None => {
                tracing::warn!(
                    "No handler registered for message {message_id} in {categories:?}, dropping {len}-byte payload"
                );
                false
            }
        }
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.values().map(HashMap::len).sum()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Message ids registered in `category`, sorted (useful for startup logging).
    pub fn registered(&self, category: ServiceCategory) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .handlers
            .get(&category)
            .map(|ids| ids.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
