//! Name-based factories for handlers and resources.
//!
//! Configuration refers to handlers and resource kinds by name. A
//! [`Registry`] maps each name to a factory that deserializes the typed args
//! and builds a fresh instance. Handlers are rebuilt on every restart, so a
//! restarted bot never sees in-memory leftovers from the faulted run.

use std::collections::HashMap;
use std::sync::Arc;

use ibots_core::{
    BoxedHandler, BoxedResource, ConfigurableHandler, ConfigurableResource, HandlerError,
    HandlerResult, ResourceError, ResourceResult,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};

type HandlerFactory = Arc<dyn Fn(&Value) -> HandlerResult<BoxedHandler> + Send + Sync>;
type ResourceFactory = Arc<dyn Fn(&str, &Value) -> ResourceResult<BoxedResource> + Send + Sync>;

/// Handler and resource factories by name.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, HandlerFactory>>,
    resources: RwLock<HashMap<String, ResourceFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `H` under [`ConfigurableHandler::name`].
    pub fn register_handler<H: ConfigurableHandler>(&self) -> &Self {
        self.register_handler_fn(H::name(), |args| {
            let args: H::Args = decode_args(args).map_err(|e| {
                HandlerError::fatal(format!("invalid args for handler '{}': {e}", H::name()))
            })?;
            Ok(Box::new(H::from_args(args)?) as BoxedHandler)
        })
    }

    /// Registers a handler factory under an explicit name.
    pub fn register_handler_fn<F>(&self, name: &str, factory: F) -> &Self
    where
        F: Fn(&Value) -> HandlerResult<BoxedHandler> + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.to_string(), Arc::new(factory));
        debug!(handler = name, "Registered handler");
        self
    }

    /// Registers `R` under [`ConfigurableResource::kind`].
    pub fn register_resource<R: ConfigurableResource>(&self) -> &Self {
        self.register_resource_fn(R::kind(), |name, args| {
            let args: R::Args =
                decode_args(args).map_err(|e| ResourceError::failed(name, format!("invalid args: {e}")))?;
            Ok(Box::new(R::from_args(name, args)?) as BoxedResource)
        })
    }

    /// Registers a resource factory under an explicit kind.
    pub fn register_resource_fn<F>(&self, kind: &str, factory: F) -> &Self
    where
        F: Fn(&str, &Value) -> ResourceResult<BoxedResource> + Send + Sync + 'static,
    {
        self.resources.write().insert(kind.to_string(), Arc::new(factory));
        debug!(kind, "Registered resource kind");
        self
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn has_resource(&self, kind: &str) -> bool {
        self.resources.read().contains_key(kind)
    }

    /// Builds a new handler instance.
    pub fn build_handler(&self, name: &str, args: &Value) -> RuntimeResult<BoxedHandler> {
        let factory = self
            .handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownHandler(name.to_string()))?;
        Ok(factory(args)?)
    }

    /// Builds the resource `name` of the given kind.
    pub fn build_resource(&self, kind: &str, name: &str, args: &Value) -> RuntimeResult<BoxedResource> {
        let factory = self
            .resources
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownResourceKind(kind.to_string()))?;
        Ok(factory(name, args)?)
    }

    /// Returns statistics about the registry.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            handlers: self.handlers.read().len(),
            resources: self.resources.read().len(),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.read().keys().cloned().collect();
        let mut resources: Vec<_> = self.resources.read().keys().cloned().collect();
        handlers.sort();
        resources.sort();
        f.debug_struct("Registry")
            .field("handlers", &handlers)
            .field("resources", &resources)
            .finish()
    }
}

/// Missing args fall back to `Default`.
fn decode_args<T: DeserializeOwned + Default>(args: &Value) -> Result<T, serde_json::Error> {
    if args.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(args.clone())
    }
}

/// Statistics about the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub handlers: usize,
    pub resources: usize,
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} handler(s), {} resource kind(s)",
            self.handlers, self.resources
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ibots_core::{BotHandler, Resource};
    use serde::Deserialize;

    #[derive(Default, Deserialize)]
    struct GreeterArgs {
        #[serde(default)]
        greeting: String,
    }

    struct Greeter {
        greeting: String,
    }

    impl BotHandler for Greeter {}

    impl ConfigurableHandler for Greeter {
        type Args = GreeterArgs;

        fn name() -> &'static str {
            "greeter"
        }

        fn from_args(args: GreeterArgs) -> HandlerResult<Self> {
            if args.greeting.len() > 10 {
                return Err(HandlerError::fatal("greeting too long"));
            }
            Ok(Self {
                greeting: args.greeting,
            })
        }
    }

    struct Bank;

    #[async_trait]
    impl Resource for Bank {
        async fn invoke(&mut self, operation: &str, _args: Value) -> ResourceResult<Value> {
            Err(ResourceError::unsupported("bank", operation))
        }
    }

    impl ConfigurableResource for Bank {
        type Args = ();

        fn kind() -> &'static str {
            "bank"
        }

        fn from_args(_name: &str, _args: ()) -> ResourceResult<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn test_build_by_name() {
        let registry = Registry::new();
        registry.register_handler::<Greeter>().register_resource::<Bank>();

        assert!(registry.has_handler("greeter"));
        assert!(registry.has_resource("bank"));
        assert_eq!(registry.stats().to_string(), "1 handler(s), 1 resource kind(s)");

        assert!(registry.build_handler("greeter", &Value::Null).is_ok());
        assert!(
            registry
                .build_handler("greeter", &serde_json::json!({ "greeting": "hi" }))
                .is_ok()
        );
        assert!(registry.build_resource("bank", "central", &Value::Null).is_ok());
    }

    #[test]
    fn test_build_errors() {
        let registry = Registry::new();
        registry.register_handler::<Greeter>();

        assert!(matches!(
            registry.build_handler("missing", &Value::Null),
            Err(RuntimeError::UnknownHandler(_))
        ));
        assert!(matches!(
            registry.build_resource("missing", "x", &Value::Null),
            Err(RuntimeError::UnknownResourceKind(_))
        ));
        assert!(matches!(
            registry.build_handler("greeter", &serde_json::json!({ "greeting": 5 })),
            Err(RuntimeError::Handler(HandlerError::Fatal(_)))
        ));
        assert!(matches!(
            registry.build_handler("greeter", &serde_json::json!({ "greeting": "far too long" })),
            Err(RuntimeError::Handler(HandlerError::Fatal(_)))
        ));
    }
}
