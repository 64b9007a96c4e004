// apiflow — Custom step action host

use crate::variable::VariableContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Action handler trait
// ---------------------------------------------------------------------------

/// Host callback behind a `custom` step action.
///
/// Handlers may read and write the execution's variable context. Errors are
/// logged by the step executor and never change the step outcome.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    async fn run(&self, context: &mut VariableContext) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Action registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ActionRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, handler: Arc<dyn ActionHandler>) {
        let name = handler.name().to_string();
        self.handlers.write().await.insert(name, handler);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.handlers.write().await.remove(name).is_some()
    }

    pub async fn run(&self, name: &str, context: &mut VariableContext) -> anyhow::Result<()> {
        let handler = self.handlers.read().await.get(name).cloned();
        match handler {
            Some(handler) => {
                tracing::debug!(action = %name, "Running custom action");
                let start = std::time::Instant::now();
                let result = handler.run(context).await;
                tracing::debug!(
                    action = %name,
                    duration_ms = %start.elapsed().as_millis(),
                    ok = result.is_ok(),
                    "Custom action finished"
                );
                result
            }
            None => anyhow::bail!("custom action '{}' not registered", name),
        }
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stamp;

    #[async_trait]
    impl ActionHandler for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }
        async fn run(&self, context: &mut VariableContext) -> anyhow::Result<()> {
            context.set_resolved("stamped", "yes");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registered_action_mutates_context() {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(Stamp)).await;
        assert_eq!(registry.list().await, vec!["stamp".to_string()]);

        let mut ctx = VariableContext::new();
        registry.run("stamp", &mut ctx).await.unwrap();
        assert_eq!(ctx.resolved["stamped"], "yes");
    }

    #[tokio::test]
    async fn test_unknown_action_is_an_error() {
        let registry = ActionRegistry::new();
        let err = registry
            .run("missing", &mut VariableContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(!registry.unregister("missing").await);
    }
}
