//! Component container and lifecycle phase driver.
//!
//! The [`ComponentContext`] constructs a declared set of named components,
//! records dependency edges as factories look each other up, and drives every
//! component through the shared lifecycle phases:
//!
//! - construction (factories run concurrently, each on its own task)
//! - [`ComponentContext::on_all_components_loaded`] (dependency order)
//! - [`ComponentContext::on_all_components_are_stopping`] (reverse order)
//! - [`ComponentContext::clear_components`] (reverse order)
//!
//! Dependencies are not declared ahead of time; they emerge at runtime as
//! each factory calls [`ComponentContext::find_component`]. The container
//! keeps the discovered graph acyclic, blocks lookups until their target is
//! constructed, and guarantees that every task it spawns is joined on all
//! exit paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::{Component, ComponentFuture, Manager};
use crate::error::ContextError;
use crate::info::{ComponentInfo, LifecycleStage};
use crate::settings::ContextSettings;
use crate::task_processor::{TaskProcessor, TaskProcessorMap};

/// Which neighbor set a phase waits on before switching a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DependencyType {
    /// Wait for the components this one depends on.
    Normal,
    /// Wait for the components that depend on this one.
    Inverted,
}

/// Which lifecycle transition a phase applies to each component.
#[derive(Debug, Clone, Copy)]
enum StageSwitchHandler {
    OnAllComponentsLoaded,
    OnAllComponentsAreStopping,
    ClearComponent,
}

/// Descriptor of one lifecycle phase.
struct StageSwitchingParams {
    next_stage: LifecycleStage,
    handler: StageSwitchHandler,
    handler_name: &'static str,
    dependency_type: DependencyType,
    allow_cancelling: bool,
    /// Set once by whichever task observes the first real failure.
    cancelled: AtomicBool,
}

impl StageSwitchingParams {
    fn new(
        next_stage: LifecycleStage,
        handler: StageSwitchHandler,
        handler_name: &'static str,
        dependency_type: DependencyType,
        allow_cancelling: bool,
    ) -> Self {
        Self {
            next_stage,
            handler,
            handler_name,
            dependency_type,
            allow_cancelling,
            cancelled: AtomicBool::new(false),
        }
    }
}

/// Container state guarded by the single context mutex. Critical sections
/// never await; waiters subscribe to a component's event channel under the
/// lock and await outside it.
struct ContextShared {
    /// Keys are fixed at construction and never change.
    components: HashMap<String, ComponentInfo>,
    /// Which task is currently constructing which component.
    task_to_component: HashMap<task::Id, String>,
}

impl ContextShared {
    fn new(component_names: impl IntoIterator<Item = String>) -> Self {
        let components = component_names
            .into_iter()
            .map(|name| (name.clone(), ComponentInfo::new(name)))
            .collect();
        Self {
            components,
            task_to_component: HashMap::new(),
        }
    }

    fn info(&self, name: &str) -> Result<&ComponentInfo, ContextError> {
        self.components
            .get(name)
            .ok_or_else(|| ContextError::UnknownComponent(name.to_owned()))
    }

    fn info_mut(&mut self, name: &str) -> Result<&mut ComponentInfo, ContextError> {
        self.components
            .get_mut(name)
            .ok_or_else(|| ContextError::UnknownComponent(name.to_owned()))
    }

    /// Name of the component being constructed on the current task.
    fn loading_component_name(&self) -> Result<String, ContextError> {
        task::try_id()
            .and_then(|id| self.task_to_component.get(&id).cloned())
            .ok_or(ContextError::LookupOutsideConstruction)
    }

    /// Registers the edge `from -> to`, rejecting it if it would close a
    /// cycle. Check and insert run in one critical section so two factories
    /// cannot race to close a cycle between them.
    fn add_dependency(&mut self, from: &str, to: &str) -> Result<(), ContextError> {
        self.info(to)?;
        if self.info(from)?.check_it_depends_on(to) {
            return Ok(());
        }

        info!("resolving dependency {} -> {}", from, to);
        self.check_for_dependency_cycle(from, to)?;

        self.info_mut(from)?.add_it_depends_on(to);
        self.info_mut(to)?.add_depends_on_it(from);
        Ok(())
    }

    /// The proposed edge `from -> to` closes a cycle iff `to` is reachable
    /// from `from` along reverse (`depends_on_it`) edges.
    fn check_for_dependency_cycle(&self, from: &str, to: &str) -> Result<(), ContextError> {
        let mut handled = BTreeSet::new();
        let mut chain = Vec::new();
        if !self.find_dependency_path_dfs(from, to, &mut handled, &mut chain) {
            return Ok(());
        }

        // `chain` is the reverse-edge walk from..=to; reorient it along
        // forward dependencies, starting and ending at `from`.
        let mut path = Vec::with_capacity(chain.len() + 1);
        path.push(from.to_owned());
        path.extend(chain.into_iter().skip(1).rev());
        path.push(from.to_owned());
        error!(
            "found circular dependency between components: {}",
            path.join(" -> ")
        );
        Err(ContextError::CircularDependency { path })
    }

    fn find_dependency_path_dfs(
        &self,
        current: &str,
        target: &str,
        handled: &mut BTreeSet<String>,
        chain: &mut Vec<String>,
    ) -> bool {
        handled.insert(current.to_owned());
        chain.push(current.to_owned());
        if current == target {
            return true;
        }
        if let Some(info) = self.components.get(current) {
            for next in info.depends_on_it() {
                if !handled.contains(next)
                    && self.find_dependency_path_dfs(next, target, handled, chain)
                {
                    return true;
                }
            }
        }
        chain.pop();
        false
    }
}

struct ContextInner {
    manager: Arc<dyn Manager>,
    /// Read-only after construction.
    task_processors: TaskProcessorMap,
    shared: Mutex<ContextShared>,
    components_load_cancelled: AtomicBool,
    reporter_token: CancellationToken,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl ContextInner {
    fn shared_lock(&self) -> MutexGuard<'_, ContextShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_stage(&self, name: &str, stage: LifecycleStage) -> Result<(), ContextError> {
        self.shared_lock().info_mut(name)?.set_stage(stage);
        Ok(())
    }

    fn component_of(&self, name: &str) -> Result<Option<Arc<dyn Component>>, ContextError> {
        Ok(self.shared_lock().info(name)?.component())
    }

    fn prepare_stage_switching(&self) {
        let mut shared = self.shared_lock();
        for info in shared.components.values_mut() {
            info.set_stage_switching_cancelled(false);
        }
    }

    /// Broadcasts cancellation to every component, waking all stage and
    /// readiness waiters.
    fn cancel_stage_switching(&self) {
        let mut shared = self.shared_lock();
        for info in shared.components.values_mut() {
            info.set_stage_switching_cancelled(true);
        }
    }

    /// Blocks until `name` is constructed or cancellation is observed. The
    /// caller has already checked the slot and subscribed under the lock.
    async fn wait_and_get_component(
        &self,
        name: &str,
        rx: &mut watch::Receiver<()>,
    ) -> Result<Arc<dyn Component>, ContextError> {
        loop {
            if rx.changed().await.is_err() {
                return Err(ContextError::StageSwitchingCancelled);
            }
            let shared = self.shared_lock();
            let info = shared.info(name)?;
            if let Some(component) = info.component() {
                return Ok(component);
            }
            if info.stage_switching_cancelled() {
                return Err(ContextError::StageSwitchingCancelled);
            }
        }
    }

    /// Blocks until `neighbor` reaches the phase's target stage or
    /// cancellation is observed.
    async fn wait_component_stage(
        &self,
        name: &str,
        neighbor: &str,
        params: &StageSwitchingParams,
    ) -> Result<(), ContextError> {
        let mut rx = {
            let shared = self.shared_lock();
            let info = shared.info(neighbor)?;
            if info.stage() == params.next_stage {
                return Ok(());
            }
            let (dependency_from, dependency_to) = match params.dependency_type {
                DependencyType::Normal => (name, neighbor),
                DependencyType::Inverted => (neighbor, name),
            };
            debug!(
                "cannot call {} for component {} yet ({} depends on {})",
                params.handler_name, name, dependency_from, dependency_to
            );
            info.subscribe()
        };
        loop {
            {
                let shared = self.shared_lock();
                let info = shared.info(neighbor)?;
                if info.stage() == params.next_stage {
                    return Ok(());
                }
                if info.stage_switching_cancelled() {
                    return Err(ContextError::StageSwitchingCancelled);
                }
            }
            if rx.changed().await.is_err() {
                return Err(ContextError::StageSwitchingCancelled);
            }
        }
    }

    /// Waits out this component's neighbor set, then applies the phase's
    /// transition. Stage bookkeeping is handled by the caller.
    async fn switch_single_component(
        &self,
        name: &str,
        params: &StageSwitchingParams,
    ) -> Result<(), ContextError> {
        let neighbors: Vec<String> = {
            let shared = self.shared_lock();
            let info = shared.info(name)?;
            match params.dependency_type {
                DependencyType::Normal => info.it_depends_on().map(str::to_owned).collect(),
                DependencyType::Inverted => info.depends_on_it().map(str::to_owned).collect(),
            }
        };

        for neighbor in &neighbors {
            self.wait_component_stage(name, neighbor, params).await?;
        }

        info!("call {} for component {}", params.handler_name, name);
        match params.handler {
            StageSwitchHandler::OnAllComponentsLoaded => {
                if let Some(component) = self.component_of(name)? {
                    component.on_all_components_loaded().await.map_err(|source| {
                        ContextError::StageSwitchFailed {
                            component: name.to_owned(),
                            handler: params.handler_name,
                            source,
                        }
                    })?;
                }
            }
            StageSwitchHandler::OnAllComponentsAreStopping => {
                if let Some(component) = self.component_of(name)? {
                    component
                        .on_all_components_are_stopping()
                        .await
                        .map_err(|source| ContextError::StageSwitchFailed {
                            component: name.to_owned(),
                            handler: params.handler_name,
                            source,
                        })?;
                }
            }
            StageSwitchHandler::ClearComponent => {
                let dropped = { self.shared_lock().info_mut(name)?.clear_component() };
                drop(dropped);
            }
        }
        Ok(())
    }

    async fn process_single_stage_switching(
        &self,
        name: &str,
        params: &StageSwitchingParams,
    ) -> Result<(), ContextError> {
        debug!(
            "preparing to call {} for component {}",
            params.handler_name, name
        );

        match self.switch_single_component(name, params).await {
            Ok(()) => {
                self.set_stage(name, params.next_stage)?;
                Ok(())
            }
            Err(err) if err.is_cancellation() => {
                warn!("{} cancelled for component {}", params.handler_name, name);
                self.set_stage(name, params.next_stage)?;
                Err(err)
            }
            Err(err) => {
                error!(component = name, error = %err, "{} failed", params.handler_name);
                if params.allow_cancelling {
                    {
                        let mut shared = self.shared_lock();
                        shared.info_mut(name)?.set_stage_switching_cancelled(true);
                    }
                    if !params.cancelled.swap(true, Ordering::SeqCst) {
                        self.cancel_stage_switching();
                    }
                    self.set_stage(name, params.next_stage)?;
                    Err(err)
                } else {
                    self.set_stage(name, params.next_stage)?;
                    Ok(())
                }
            }
        }
    }
}

/// Removes the task-to-component entry on every exit path of
/// [`ComponentContext::add_component`].
struct TaskToComponentScope<'a> {
    inner: &'a ContextInner,
    id: task::Id,
}

impl Drop for TaskToComponentScope<'_> {
    fn drop(&mut self) {
        self.inner.shared_lock().task_to_component.remove(&self.id);
    }
}

/// Component container and lifecycle orchestrator.
///
/// Cheap to clone; every clone shares the same container. Factories receive
/// a clone and may call [`ComponentContext::find_component`] on it while
/// they run.
#[derive(Clone)]
pub struct ComponentContext {
    inner: Arc<ContextInner>,
}

impl ComponentContext {
    /// Creates a container expecting exactly `component_names`, and spawns
    /// the progress reporter. Must be called from within a tokio runtime.
    pub fn new(
        manager: Arc<dyn Manager>,
        task_processors: TaskProcessorMap,
        component_names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::with_settings(
            manager,
            task_processors,
            component_names,
            ContextSettings::default(),
        )
    }

    pub fn with_settings(
        manager: Arc<dyn Manager>,
        task_processors: TaskProcessorMap,
        component_names: impl IntoIterator<Item = impl Into<String>>,
        settings: ContextSettings,
    ) -> Self {
        let shared = ContextShared::new(component_names.into_iter().map(Into::into));
        let inner = Arc::new(ContextInner {
            manager,
            task_processors,
            shared: Mutex::new(shared),
            components_load_cancelled: AtomicBool::new(false),
            reporter_token: CancellationToken::new(),
            reporter: Mutex::new(None),
        });

        let reporter = tokio::spawn(report_adding_components(
            Arc::downgrade(&inner),
            inner.reporter_token.clone(),
            settings.progress_report_period(),
        ));
        *inner
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reporter);

        Self { inner }
    }

    /// Constructs the component `name` by running `factory` on the current
    /// task. The factory receives a clone of this context and may call
    /// [`ComponentContext::find_component`]; each such call records a
    /// dependency edge and may suspend until the target is constructed.
    ///
    /// Must run inside a spawned task, one component per task.
    pub async fn add_component<F>(
        &self,
        name: &str,
        factory: F,
    ) -> Result<Arc<dyn Component>, ContextError>
    where
        F: FnOnce(ComponentContext) -> ComponentFuture + Send,
    {
        let id = task::try_id().ok_or(ContextError::OutsideTask)?;
        {
            let mut shared = self.inner.shared_lock();
            if let Some(constructing) = shared.task_to_component.get(&id) {
                return Err(ContextError::NestedComponentConstruction {
                    component: name.to_owned(),
                    constructing: constructing.clone(),
                });
            }
            let info = shared.info(name)?;
            if info.component().is_some() {
                return Err(ContextError::DuplicateComponent(name.to_owned()));
            }
            shared.task_to_component.insert(id, name.to_owned());
        }
        let _scope = TaskToComponentScope {
            inner: &self.inner,
            id,
        };

        let built = factory(self.clone()).await.map_err(|source| {
            match source.downcast::<ContextError>() {
                Ok(ContextError::StageSwitchingCancelled) => ContextError::StageSwitchingCancelled,
                Ok(err) => ContextError::ComponentConstructionFailed {
                    component: name.to_owned(),
                    source: err.into(),
                },
                Err(source) => ContextError::ComponentConstructionFailed {
                    component: name.to_owned(),
                    source,
                },
            }
        })?;

        self.inner
            .shared_lock()
            .info_mut(name)?
            .set_component(Arc::clone(&built))?;
        info!(component = name, "component constructed");
        Ok(built)
    }

    /// Looks up `name` on behalf of the component currently under
    /// construction on this task, recording the dependency edge. Legal only
    /// from inside a factory running on this context. Blocks until the
    /// target is constructed or the load is cancelled.
    pub async fn find_component(&self, name: &str) -> Result<Arc<dyn Component>, ContextError> {
        let mut rx = {
            let mut shared = self.inner.shared_lock();
            let from = shared.loading_component_name()?;
            shared.add_dependency(&from, name)?;

            let info = shared.info(name)?;
            if let Some(component) = info.component() {
                return Ok(component);
            }
            if info.stage_switching_cancelled() {
                return Err(ContextError::StageSwitchingCancelled);
            }
            info!(
                "component {} is not loaded yet, component {} is waiting for it to load",
                name, from
            );
            info.subscribe()
        };
        self.inner.wait_and_get_component(name, &mut rx).await
    }

    /// Typed lookup: [`ComponentContext::find_component`] plus a downcast to
    /// the concrete component type.
    pub async fn find_component_as<T: Component>(&self, name: &str) -> Result<Arc<T>, ContextError> {
        let component = self.find_component(name).await?;
        component
            .into_any_arc()
            .downcast::<T>()
            .map_err(|_| ContextError::WrongComponentType {
                name: name.to_owned(),
            })
    }

    /// Advances every component to `Running`, each one waiting for its
    /// dependencies first. A failing component cancels the whole phase.
    pub async fn on_all_components_loaded(&self) -> Result<(), ContextError> {
        self.stop_progress_reporter().await;
        info!("Phase: on_all_components_loaded");
        self.process_all_stage_switchings(StageSwitchingParams::new(
            LifecycleStage::Running,
            StageSwitchHandler::OnAllComponentsLoaded,
            "on_all_components_loaded()",
            DependencyType::Normal,
            true,
        ))
        .await
    }

    /// Advances every component to `ReadyForClearing`, each one waiting for
    /// its dependents first. Failures are logged; teardown is best-effort.
    pub async fn on_all_components_are_stopping(&self) -> Result<(), ContextError> {
        info!("Sending stopping notification to all components");
        self.process_all_stage_switchings(StageSwitchingParams::new(
            LifecycleStage::ReadyForClearing,
            StageSwitchHandler::OnAllComponentsAreStopping,
            "on_all_components_are_stopping()",
            DependencyType::Inverted,
            false,
        ))
        .await
    }

    /// Destroys component instances in reverse dependency order, returning
    /// every stage to `Null`. Joins every task the container spawned,
    /// including the progress reporter.
    pub async fn clear_components(&self) -> Result<(), ContextError> {
        self.stop_progress_reporter().await;
        info!("Stopping components");
        self.process_all_stage_switchings(StageSwitchingParams::new(
            LifecycleStage::Null,
            StageSwitchHandler::ClearComponent,
            "clear_component()",
            DependencyType::Inverted,
            false,
        ))
        .await?;
        info!("Stopped all components");
        Ok(())
    }

    /// Cancels an in-progress load: every blocked lookup and stage wait
    /// wakes with a cancellation error. Idempotent; the per-component
    /// `on_loading_cancelled` hooks fire at most once.
    pub fn cancel_components_load(&self) {
        self.inner.cancel_stage_switching();
        if self
            .inner
            .components_load_cancelled
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        let constructed: Vec<(String, Arc<dyn Component>)> = {
            let shared = self.inner.shared_lock();
            shared
                .components
                .values()
                .filter_map(|info| info.component().map(|c| (info.name().to_owned(), c)))
                .collect()
        };
        for (name, component) in constructed {
            debug!(component = %name, "notifying component about the cancelled load");
            component.on_loading_cancelled();
        }
    }

    #[must_use]
    pub fn manager(&self) -> &dyn Manager {
        self.inner.manager.as_ref()
    }

    pub fn task_processor(&self, name: &str) -> Result<&TaskProcessor, ContextError> {
        self.inner
            .task_processors
            .get(name)
            .ok_or_else(|| ContextError::UnknownTaskProcessor(name.to_owned()))
    }

    /// Snapshot of the task-processor registry.
    #[must_use]
    pub fn task_processors(&self) -> TaskProcessorMap {
        self.inner.task_processors.clone()
    }

    /// Current lifecycle stage of `name`. Diagnostic accessor.
    pub fn component_stage(&self, name: &str) -> Result<LifecycleStage, ContextError> {
        Ok(self.inner.shared_lock().info(name)?.stage())
    }

    /// Runs one lifecycle phase: one task per component, all of them joined
    /// before this returns, whether the phase succeeds, fails or is
    /// cancelled.
    async fn process_all_stage_switchings(
        &self,
        params: StageSwitchingParams,
    ) -> Result<(), ContextError> {
        let params = Arc::new(params);
        self.inner.prepare_stage_switching();

        let names: Vec<String> = {
            let shared = self.inner.shared_lock();
            shared.components.keys().cloned().collect()
        };

        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            let inner = Arc::clone(&self.inner);
            let task_params = Arc::clone(&params);
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                inner
                    .process_single_stage_switching(&task_name, &task_params)
                    .await
            });
            tasks.push((name, handle));
        }

        let mut first_error = None;
        for (name, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(ContextError::StageSwitchFailed {
                    component: name,
                    handler: params.handler_name,
                    source: anyhow::anyhow!("lifecycle task panicked: {join_error}"),
                }),
            };
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => {}
                Err(err) => {
                    if first_error.is_none() {
                        if !params.cancelled.swap(true, Ordering::SeqCst) {
                            self.inner.cancel_stage_switching();
                        }
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if params.cancelled.load(Ordering::SeqCst) {
            return Err(ContextError::ProtocolViolation {
                phase: params.handler_name,
            });
        }
        Ok(())
    }

    async fn stop_progress_reporter(&self) {
        debug!("stopping the adding-components progress reporter");
        self.inner.reporter_token.cancel();
        let handle = self
            .inner
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "progress reporter task failed");
            }
        }
    }
}

/// Periodically lists the components whose factories are still running, so a
/// slow or wedged load is visible in the logs.
async fn report_adding_components(
    inner: Weak<ContextInner>,
    token: CancellationToken,
    period: Duration,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(period) => {}
        }
        let Some(inner) = inner.upgrade() else { return };
        let adding: Vec<String> = {
            let shared = inner.shared_lock();
            let mut names: Vec<String> = shared.task_to_component.values().cloned().collect();
            names.sort_unstable();
            names
        };
        info!(components = ?adding, "still adding components");
    }
}
