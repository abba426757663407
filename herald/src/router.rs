use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::HandlerConfigurationError;
use crate::handler::{CommandHandler, EventHandler, RequestHandler};
use crate::message::{Message, MessageCategory, MessageKind};

pub type CommandRegistry<M> = HandlerRegistry<<M as Message>::Kind, dyn CommandHandler<M>>;
pub type RequestRegistry<M> = HandlerRegistry<<M as Message>::Kind, dyn RequestHandler<M>>;
pub type EventRegistry<E> = HandlerRegistry<<E as Message>::Kind, dyn EventHandler<E>>;

/// Immutable mapping from message kind to handler(s).
///
/// Built once during bootstrap and shared read-only by the workers. For
/// Command, ParallelCommand and Request registries each kind maps to exactly
/// one handler; for Event registries each kind maps to an ordered list, and
/// registration order is invocation order.
pub struct HandlerRegistry<K, H: ?Sized> {
    category: MessageCategory,
    handlers: HashMap<K, Vec<Arc<H>>>,
}

impl<K: MessageKind, H: ?Sized> HandlerRegistry<K, H> {
    pub fn builder(category: MessageCategory) -> HandlerRegistryBuilder<K, H> {
        HandlerRegistryBuilder::new(category)
    }

    pub fn category(&self) -> MessageCategory {
        self.category
    }

    /// The single handler for `kind`.
    pub fn resolve_one(&self, kind: K) -> Result<&Arc<H>, HandlerConfigurationError> {
        self.handlers
            .get(&kind)
            .and_then(|handlers| handlers.first())
            .ok_or_else(|| HandlerConfigurationError::Unregistered {
                category: self.category,
                kind: kind.as_str().to_string(),
            })
    }

    /// Every handler for `kind`, in registration order. Empty if none.
    pub fn resolve_all(&self, kind: K) -> &[Arc<H>] {
        self.handlers
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn handler_count(&self, kind: K) -> usize {
        self.resolve_all(kind).len()
    }

    pub fn registered_kinds(&self) -> impl Iterator<Item = K> + '_ {
        self.handlers.keys().copied()
    }
}

impl<K: MessageKind, H: ?Sized> fmt::Debug for HandlerRegistry<K, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (kind.as_str(), handlers.len()))
            .collect();
        kinds.sort_unstable();

        f.debug_struct("HandlerRegistry")
            .field("category", &self.category)
            .field("handlers", &kinds)
            .finish()
    }
}

/// Collects registrations and validates them into a [`HandlerRegistry`].
pub struct HandlerRegistryBuilder<K, H: ?Sized> {
    category: MessageCategory,
    handlers: HashMap<K, Vec<Arc<H>>>,
    duplicates: Vec<K>,
}

impl<K: MessageKind, H: ?Sized> HandlerRegistryBuilder<K, H> {
    pub fn new(category: MessageCategory) -> Self {
        Self {
            category,
            handlers: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Register a handler for `kind`.
    ///
    /// For single-handler categories a second registration for the same
    /// kind is rejected when the registry is built.
    pub fn register(mut self, kind: K, handler: Arc<H>) -> Self {
        let entry = self.handlers.entry(kind).or_default();
        if self.category.requires_single_handler() && !entry.is_empty() {
            self.duplicates.push(kind);
        } else {
            entry.push(handler);
        }
        self
    }

    /// Build and prove every kind has a handler where one is required.
    pub fn build(self) -> Result<HandlerRegistry<K, H>, HandlerConfigurationError> {
        if self.category.requires_single_handler() {
            let missing: Vec<String> = K::all()
                .iter()
                .filter(|kind| !self.handlers.contains_key(*kind))
                .map(|kind| kind.as_str().to_string())
                .collect();
            if !missing.is_empty() {
                return Err(HandlerConfigurationError::Missing {
                    category: self.category,
                    kinds: missing,
                });
            }
        }
        self.build_partial()
    }

    /// Build without the exhaustiveness check.
    ///
    /// Dispatching a kind with no handler then fails with
    /// [`HandlerConfigurationError::Unregistered`].
    pub fn build_partial(self) -> Result<HandlerRegistry<K, H>, HandlerConfigurationError> {
        if let Some(kind) = self.duplicates.first() {
            return Err(HandlerConfigurationError::Duplicate {
                category: self.category,
                kind: kind.as_str().to_string(),
            });
        }

        let handler_total: usize = self.handlers.values().map(Vec::len).sum();
        tracing::info!(
            category = %self.category,
            kinds = self.handlers.len(),
            handlers = handler_total,
            "handler registry built"
        );

        Ok(HandlerRegistry {
            category: self.category,
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::HandlerContext;
    use async_trait::async_trait;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    enum ChatKind {
        AssignRole,
        Define,
    }

    impl MessageKind for ChatKind {
        fn all() -> &'static [Self] {
            &[ChatKind::AssignRole, ChatKind::Define]
        }

        fn as_str(&self) -> &'static str {
            match self {
                ChatKind::AssignRole => "assign_role",
                ChatKind::Define => "define",
            }
        }
    }

    impl fmt::Display for ChatKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    struct Chat(ChatKind);

    impl Message for Chat {
        type Kind = ChatKind;

        fn kind(&self) -> ChatKind {
            self.0
        }
    }

    struct Noop;

    #[async_trait]
    impl CommandHandler<Chat> for Noop {
        async fn handle(&self, _message: &Chat, _cx: &HandlerContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl EventHandler<Chat> for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: &Chat, _cx: &HandlerContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_build_rejects_missing_command_handlers() {
        let result = CommandRegistry::<Chat>::builder(MessageCategory::Command)
            .register(ChatKind::Define, Arc::new(Noop))
            .build();

        assert_eq!(
            result.unwrap_err(),
            HandlerConfigurationError::Missing {
                category: MessageCategory::Command,
                kinds: vec!["assign_role".to_string()],
            }
        );
    }

    #[test]
    fn test_build_rejects_duplicate_command_handlers() {
        let result = CommandRegistry::<Chat>::builder(MessageCategory::Command)
            .register(ChatKind::Define, Arc::new(Noop))
            .register(ChatKind::Define, Arc::new(Noop))
            .register(ChatKind::AssignRole, Arc::new(Noop))
            .build();

        assert!(matches!(
            result.unwrap_err(),
            HandlerConfigurationError::Duplicate { kind, .. } if kind == "define"
        ));
    }

    #[test]
    fn test_partial_registry_fails_at_resolution() {
        let registry = CommandRegistry::<Chat>::builder(MessageCategory::Command)
            .register(ChatKind::Define, Arc::new(Noop))
            .build_partial()
            .unwrap();

        assert!(registry.resolve_one(ChatKind::Define).is_ok());
        let err = registry.resolve_one(ChatKind::AssignRole).err().unwrap();
        assert_eq!(
            err,
            HandlerConfigurationError::Unregistered {
                category: MessageCategory::Command,
                kind: "assign_role".to_string(),
            }
        );
    }

    #[test]
    fn test_event_registry_allows_zero_and_many_in_order() {
        let registry = EventRegistry::<Chat>::builder(MessageCategory::Event)
            .register(ChatKind::Define, Arc::new(Named("first")))
            .register(ChatKind::Define, Arc::new(Named("second")))
            .register(ChatKind::Define, Arc::new(Named("third")))
            .build()
            .unwrap();

        let names: Vec<_> = registry
            .resolve_all(ChatKind::Define)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(registry.resolve_all(ChatKind::AssignRole).is_empty());
        assert_eq!(registry.handler_count(ChatKind::AssignRole), 0);
    }

    #[test]
    fn test_debug_lists_handler_counts() {
        let registry = EventRegistry::<Chat>::builder(MessageCategory::Event)
            .register(ChatKind::Define, Arc::new(Named("only")))
            .build()
            .unwrap();

        let debug = format!("{registry:?}");
        assert!(debug.contains("Event"));
        assert!(debug.contains("(\"define\", 1)"));
    }
}
