use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Object-safe upcast to [`Any`], needed for typed lookups through
/// `Arc<dyn Component>`. Implemented for every component automatically.
pub trait AnyComponent {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AnyComponent for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A named, long-lived service object driven through the container's
/// lifecycle phases.
///
/// All hooks default to no-ops; a component overrides the ones it cares
/// about. Hooks run outside the container lock and may suspend freely.
#[async_trait]
pub trait Component: AnyComponent + Send + Sync + 'static {
    /// Called once every component has been constructed. Within a dependency
    /// chain, a component's dependencies receive this call before it does.
    async fn on_all_components_loaded(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the service begins shutting down, in reverse dependency
    /// order: a component hears about the stop before anything it depends on.
    async fn on_all_components_are_stopping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called at most once when the component load is cancelled while this
    /// component is already constructed.
    fn on_loading_cancelled(&self) {}
}

/// Boxed future returned by a component factory.
pub type ComponentFuture = BoxFuture<'static, anyhow::Result<Arc<dyn Component>>>;

impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Component")
    }
}

/// Opaque owner of the container.
///
/// The context stores a handle and passes it through to factories via
/// [`crate::ComponentContext::manager`]; it never interprets the owner
/// itself.
pub trait Manager: Send + Sync + 'static {
    /// Raw configuration for a single component, if the owner carries any.
    fn component_config(&self, _name: &str) -> Option<&serde_json::Value> {
        None
    }
}
