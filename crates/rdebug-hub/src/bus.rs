use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// An event that can be routed by kind.
pub trait BusEvent: Clone + Send + 'static {
    type Kind: Copy + Eq + Hash + Send + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Per-kind dispatch table plus an observe-all list.
///
/// Subscribers get an unbounded receiver; a dropped receiver is pruned on the
/// next emit.
pub struct EventBus<E: BusEvent> {
    table: Mutex<Subscribers<E>>,
}

struct Subscribers<E: BusEvent> {
    by_kind: HashMap<E::Kind, Vec<mpsc::UnboundedSender<E>>>,
    all: Vec<mpsc::UnboundedSender<E>>,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Subscribers {
                by_kind: HashMap::new(),
                all: Vec::new(),
            }),
        }
    }

    pub fn on(&self, kind: E::Kind) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().by_kind.entry(kind).or_default().push(tx);
        rx
    }

    pub fn on_any(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().all.push(tx);
        rx
    }

    /// Delivers to kind subscribers first, then to observe-all subscribers.
    /// Returns the number of receivers reached.
    pub fn emit(&self, event: E) -> usize {
        let mut table = self.lock();
        let mut delivered = 0;
        if let Some(senders) = table.by_kind.get_mut(&event.kind()) {
            senders.retain(|sender| {
                let ok = sender.send(event.clone()).is_ok();
                delivered += usize::from(ok);
                ok
            });
        }
        table.all.retain(|sender| {
            let ok = sender.send(event.clone()).is_ok();
            delivered += usize::from(ok);
            ok
        });
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers<E>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
