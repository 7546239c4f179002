use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::component::Component;
use crate::error::ContextError;

/// A point in a component's lifecycle.
///
/// Within one phase every component moves to the same target stage, so
/// stage waits compare for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleStage {
    /// No instance. The initial state, and the final state after clearing.
    Null,
    /// The factory has run and the instance is stored.
    CreateComponentCalled,
    /// `on_all_components_loaded` has completed.
    Running,
    /// `on_all_components_are_stopping` has completed.
    ReadyForClearing,
}

/// Per-component record: instance slot, lifecycle stage, dependency edges,
/// cancellation flag and the event channel that stage/readiness waiters
/// subscribe to.
///
/// Every field is mutated only under the container mutex, and every mutation
/// that can unblock a waiter signals the event channel under that same lock.
/// Waiters subscribe under the lock and await outside it; `watch` versioning
/// guarantees a wake for any change made after the subscription.
pub(crate) struct ComponentInfo {
    name: String,
    component: Option<Arc<dyn Component>>,
    stage: LifecycleStage,
    it_depends_on: BTreeSet<String>,
    depends_on_it: BTreeSet<String>,
    stage_switching_cancelled: bool,
    event: watch::Sender<()>,
}

impl ComponentInfo {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (event, _) = watch::channel(());
        Self {
            name: name.into(),
            component: None,
            stage: LifecycleStage::Null,
            it_depends_on: BTreeSet::new(),
            depends_on_it: BTreeSet::new(),
            stage_switching_cancelled: false,
            event,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Stores the constructed instance and advances the stage to
    /// `CreateComponentCalled`. The slot is write-once.
    pub(crate) fn set_component(
        &mut self,
        component: Arc<dyn Component>,
    ) -> Result<(), ContextError> {
        if self.component.is_some() {
            return Err(ContextError::DuplicateComponent(self.name.clone()));
        }
        self.component = Some(component);
        self.stage = LifecycleStage::CreateComponentCalled;
        self.notify();
        Ok(())
    }

    /// Non-blocking peek at the instance slot.
    pub(crate) fn component(&self) -> Option<Arc<dyn Component>> {
        self.component.clone()
    }

    /// Empties the instance slot and signals waiters. Returns the instance so
    /// the caller can drop it outside the container lock.
    pub(crate) fn clear_component(&mut self) -> Option<Arc<dyn Component>> {
        let component = self.component.take();
        self.notify();
        component
    }

    pub(crate) fn stage(&self) -> LifecycleStage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: LifecycleStage) {
        self.stage = stage;
        self.notify();
    }

    pub(crate) fn stage_switching_cancelled(&self) -> bool {
        self.stage_switching_cancelled
    }

    pub(crate) fn set_stage_switching_cancelled(&mut self, cancelled: bool) {
        self.stage_switching_cancelled = cancelled;
        self.notify();
    }

    pub(crate) fn add_it_depends_on(&mut self, name: impl Into<String>) {
        self.it_depends_on.insert(name.into());
    }

    pub(crate) fn add_depends_on_it(&mut self, name: impl Into<String>) {
        self.depends_on_it.insert(name.into());
    }

    pub(crate) fn check_it_depends_on(&self, name: &str) -> bool {
        self.it_depends_on.contains(name)
    }

    pub(crate) fn it_depends_on(&self) -> impl Iterator<Item = &str> {
        self.it_depends_on.iter().map(String::as_str)
    }

    pub(crate) fn depends_on_it(&self) -> impl Iterator<Item = &str> {
        self.depends_on_it.iter().map(String::as_str)
    }

    /// Event channel for stage/readiness/cancellation changes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<()> {
        self.event.subscribe()
    }

    fn notify(&self) {
        self.event.send_replace(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl Component for Dummy {}

    #[test]
    fn slot_is_write_once() {
        let mut info = ComponentInfo::new("db");
        assert!(info.component().is_none());
        assert_eq!(info.stage(), LifecycleStage::Null);

        info.set_component(Arc::new(Dummy)).unwrap();
        assert!(info.component().is_some());
        assert_eq!(info.stage(), LifecycleStage::CreateComponentCalled);

        let err = info.set_component(Arc::new(Dummy)).unwrap_err();
        assert!(matches!(err, ContextError::DuplicateComponent(name) if name == "db"));
    }

    #[test]
    fn mutations_signal_subscribers() {
        let mut info = ComponentInfo::new("db");
        let rx = info.subscribe();
        assert!(!rx.has_changed().unwrap());

        info.set_stage(LifecycleStage::Running);
        assert!(rx.has_changed().unwrap());

        let rx = info.subscribe();
        info.set_stage_switching_cancelled(true);
        assert!(rx.has_changed().unwrap());
        assert!(info.stage_switching_cancelled());

        let rx = info.subscribe();
        info.set_component(Arc::new(Dummy)).unwrap();
        assert!(rx.has_changed().unwrap());

        let rx = info.subscribe();
        assert!(info.clear_component().is_some());
        assert!(info.component().is_none());
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn edge_bookkeeping() {
        let mut info = ComponentInfo::new("server");
        info.add_it_depends_on("db");
        info.add_it_depends_on("cache");
        info.add_depends_on_it("monitor");

        assert!(info.check_it_depends_on("db"));
        assert!(!info.check_it_depends_on("monitor"));
        assert_eq!(info.it_depends_on().collect::<Vec<_>>(), ["cache", "db"]);
        assert_eq!(info.depends_on_it().collect::<Vec<_>>(), ["monitor"]);
        assert_eq!(info.name(), "server");
    }
}
