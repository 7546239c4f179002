//! Component container and lifecycle orchestrator for long-lived services.
//!
//! A service declares a fixed set of named components up front, then
//! constructs them concurrently: the owner spawns one task per component and
//! calls [`ComponentContext::add_component`] with that component's factory.
//! While a factory runs it may look up other components with
//! [`ComponentContext::find_component`]; each lookup records a dependency
//! edge and suspends until the target is constructed. The dependency graph
//! is therefore discovered at runtime, kept acyclic, and later used to drive
//! every component through the shared lifecycle phases in dependency (or
//! reverse-dependency) order.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use compkit::{Component, ComponentContext, Manager, TaskProcessorMap};
//! use futures::FutureExt;
//!
//! struct Owner;
//! impl Manager for Owner {}
//!
//! struct Database;
//! impl Component for Database {}
//!
//! struct Server;
//! impl Component for Server {}
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = ComponentContext::new(
//!     Arc::new(Owner),
//!     TaskProcessorMap::new(),
//!     ["database", "server"],
//! );
//!
//! let for_db = ctx.clone();
//! let db_task = tokio::spawn(async move {
//!     for_db
//!         .add_component("database", |_ctx| {
//!             async move { Ok(Arc::new(Database) as Arc<dyn Component>) }.boxed()
//!         })
//!         .await
//! });
//! let for_server = ctx.clone();
//! let server_task = tokio::spawn(async move {
//!     for_server
//!         .add_component("server", |ctx| {
//!             async move {
//!                 // records the edge server -> database and waits for it
//!                 let _db = ctx.find_component("database").await?;
//!                 Ok(Arc::new(Server) as Arc<dyn Component>)
//!             }
//!             .boxed()
//!         })
//!         .await
//! });
//! db_task.await??;
//! server_task.await??;
//!
//! ctx.on_all_components_loaded().await?;
//! // ... serve ...
//! ctx.on_all_components_are_stopping().await?;
//! ctx.clear_components().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Cancellation is cooperative and flag-based: a failed factory or an
//! explicit [`ComponentContext::cancel_components_load`] wakes every blocked
//! lookup with [`ContextError::StageSwitchingCancelled`], and the owner
//! decides what to tear down.

pub mod component;
pub mod context;
pub mod error;
mod info;
pub mod settings;
pub mod task_processor;

pub use component::{AnyComponent, Component, ComponentFuture, Manager};
pub use context::ComponentContext;
pub use error::ContextError;
pub use info::LifecycleStage;
pub use settings::ContextSettings;
pub use task_processor::{TaskProcessor, TaskProcessorMap};
