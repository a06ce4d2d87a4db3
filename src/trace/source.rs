//! Event-source contract and the connection between a source and the registry
//!
//! A source delivers raw events to a handler from its own threads. Sources
//! that trace per network namespace are attached to every container the
//! selector matches, and follow the registry as containers come and go.

use crate::trace::registry::{RegistryHandle, SubscriptionId};
use crate::{NodescopeError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nodescope_common::{ContainerEvent, ContainerRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives raw events, with the container they were observed in when known
pub type EventHandler<E> = Arc<dyn Fn(Option<&ContainerRecord>, E) + Send + Sync>;

pub trait EventSource: Send {
    type Event: Send + 'static;

    fn name(&self) -> &str;

    /// Begin delivering events to `handler`
    fn start(&mut self, handler: EventHandler<Self::Event>) -> Result<()>;

    /// Begin tracing `container`. Node-wide sources ignore this.
    fn attach(&mut self, _container: &ContainerRecord) -> Result<()> {
        Ok(())
    }

    fn detach(&mut self, _container: &ContainerRecord) -> Result<()> {
        Ok(())
    }

    /// Stop delivering events. The handler is not called once this returns.
    fn stop(&mut self);
}

pub type BoxedSource<E> = Box<dyn EventSource<Event = E>>;
pub type SharedSource<E> = Arc<Mutex<BoxedSource<E>>>;

/// Which containers a source is attached to. The default matches everything.
#[derive(Debug, Clone, Default)]
pub struct ContainerSelector {
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub container: Option<String>,
}

impl ContainerSelector {
    pub fn matches(&self, c: &ContainerRecord) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        field(&self.namespace, &c.namespace)
            && field(&self.pod, &c.pod)
            && field(&self.container, &c.name)
    }
}

type Attached = Arc<DashMap<u32, ContainerRecord>>;

/// Live attachment of a source to the registry's containers
pub struct ProbeConnection<E> {
    source: SharedSource<E>,
    subscription: SubscriptionId,
    attached: Attached,
}

/// Attach `source` to every selected container now and in the future.
///
/// Attaching may start probe threads and wait for them, so async callers
/// run this on a blocking thread.
pub fn connect<E: Send + 'static>(
    registry: &RegistryHandle,
    source: SharedSource<E>,
    selector: ContainerSelector,
) -> Result<ProbeConnection<E>> {
    let attached: Attached = Arc::new(DashMap::new());

    let subscription = registry.subscribe({
        let source = source.clone();
        let attached = attached.clone();
        let selector = selector.clone();
        Arc::new(move |event: ContainerEvent| match event {
            ContainerEvent::Added(c) if selector.matches(&c) => {
                attach_one(&source, &attached, &c);
            }
            ContainerEvent::Removed(c) => detach_one(&source, &attached, &c),
            ContainerEvent::Added(_) => {}
        })
    });

    let mut attempted = 0;
    let mut succeeded = 0;
    for c in registry.snapshot() {
        if !selector.matches(&c) {
            continue;
        }
        attempted += 1;
        if attach_one(&source, &attached, &c) {
            succeeded += 1;
        }
    }

    if attempted > 0 && succeeded == 0 {
        registry.unsubscribe(subscription);
        let name = source.lock().name().to_string();
        return Err(NodescopeError::resource_init(
            name,
            format!("could not attach to any of {} containers", attempted),
        ));
    }

    debug!("Probe connected to {} of {} containers", succeeded, attempted);

    Ok(ProbeConnection {
        source,
        subscription,
        attached,
    })
}

/// Returns true when the container is attached after the call
fn attach_one<E: Send + 'static>(source: &SharedSource<E>, attached: &Attached, c: &ContainerRecord) -> bool {
    match attached.entry(c.pid) {
        Entry::Occupied(_) => true,
        Entry::Vacant(slot) => match source.lock().attach(c) {
            Ok(()) => {
                slot.insert(c.clone());
                true
            }
            Err(e) => {
                warn!("Failed to attach to container {} pid {}: {}", c.name, c.pid, e);
                false
            }
        },
    }
}

fn detach_one<E: Send + 'static>(source: &SharedSource<E>, attached: &Attached, c: &ContainerRecord) {
    if let Some((_, record)) = attached.remove(&c.pid) {
        if let Err(e) = source.lock().detach(&record) {
            warn!("Failed to detach from container {} pid {}: {}", c.name, c.pid, e);
        }
    }
}

impl<E: Send + 'static> ProbeConnection<E> {
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    /// Stop following the registry and detach every container. Blocks while
    /// the source joins its per-container workers.
    pub fn close(self, registry: &RegistryHandle) {
        registry.unsubscribe(self.subscription);

        let records: Vec<ContainerRecord> =
            self.attached.iter().map(|r| r.value().clone()).collect();
        for record in records {
            detach_one(&self.source, &self.attached, &record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::registry::tests::record;

    #[test]
    fn test_default_selector_matches_everything() {
        let selector = ContainerSelector::default();
        assert!(selector.matches(&record(1, "a", false)));
        assert!(selector.matches(&record(2, "b", true)));
    }

    #[test]
    fn test_selector_filters_by_fields() {
        let selector = ContainerSelector {
            namespace: Some("default".to_string()),
            container: Some("api".to_string()),
            ..Default::default()
        };
        assert!(selector.matches(&record(1, "api", false)));
        assert!(!selector.matches(&record(2, "web", false)));
    }
}
