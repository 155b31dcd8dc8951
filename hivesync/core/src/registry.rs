use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt};

use crate::events::OperationEvent;

pub type OperationHandler = Arc<dyn Fn(OperationEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers per operation type (`transfer_operation`, `custom_json_operation`, ...), set up once
/// before streaming starts.
///
/// Operation types without a handler resolve to a handler that does nothing.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: HashMap<String, OperationHandler>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types = self.handlers.keys().collect::<Vec<_>>();
        types.sort();
        f.debug_struct("OperationRegistry")
            .field("handlers", &types)
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `op_type`, replacing any previous one.
    pub fn on<S, F, Fut>(mut self, op_type: S, handler: F) -> Self
    where
        S: Into<String>,
        F: Fn(OperationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(op_type, handler);
        self
    }

    pub fn register<S, F, Fut>(&mut self, op_type: S, handler: F)
    where
        S: Into<String>,
        F: Fn(OperationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            op_type.into(),
            Arc::new(move |event| handler(event).boxed()),
        );
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.handlers.contains_key(op_type)
    }

    pub fn resolve(&self, op_type: &str) -> OperationHandler {
        match self.handlers.get(op_type) {
            Some(handler) => Arc::clone(handler),
            None => Arc::new(|_| async {}.boxed()),
        }
    }

    pub async fn dispatch(&self, event: OperationEvent) {
        let handler = self.resolve(&event.op_type);
        handler(event).await
    }
}
