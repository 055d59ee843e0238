//! Bus de notification des changements.
//!
//! Un signal ne transporte aucune donnée: il dit seulement aux abonnés
//! « relisez la collection ». Les abonnements sont des gardes: les relâcher
//! désabonne le gestionnaire.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use log::{debug, warn};
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// Les signaux, avec leur nom d'événement historique
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, AsRefStr, strum_macros::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Signal {
    StaffUpdated,
    PatientsUpdated,
    PatientUpdated,
    AppointmentUpdated,
    InvoiceUpdated,
    RolesUpdated,
    /// Changement du stockage durable fait par un autre processus
    Storage,
}

type Handler = Rc<RefCell<dyn FnMut(Signal)>>;

struct Entry {
    id: u64,
    signal: Signal,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: Cell<u64>,
    entries: RefCell<Vec<Entry>>,
}

impl Registry {
    fn remove(&self, ids: &[u64]) {
        self.entries
            .borrow_mut()
            .retain(|entry| !ids.contains(&entry.id));
    }
}

/// Publication/abonnement synchrone, dans l'ordre d'abonnement
#[derive(Clone, Default)]
pub struct SignalBus {
    registry: Rc<Registry>,
}

/// Garde d'abonnement. Le gestionnaire est retiré quand la garde est relâchée.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Registry>,
    ids: Vec<u64>,
}

impl Subscription {
    /// Désabonne explicitement (équivalent à relâcher la garde)
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.ids);
        }
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, signal: Signal, handler: F) -> Subscription
    where
        F: FnMut(Signal) + 'static,
    {
        self.subscribe_all(&[signal], handler)
    }

    /// Un seul gestionnaire pour plusieurs signaux
    pub fn subscribe_all<F>(&self, signals: &[Signal], handler: F) -> Subscription
    where
        F: FnMut(Signal) + 'static,
    {
        let handler: Handler = Rc::new(RefCell::new(handler));
        let mut entries = self.registry.entries.borrow_mut();
        let mut ids = Vec::with_capacity(signals.len());

        for &signal in signals {
            let id = self.registry.next_id.get();
            self.registry.next_id.set(id + 1);
            entries.push(Entry {
                id,
                signal,
                handler: Rc::clone(&handler),
            });
            ids.push(id);
        }

        Subscription {
            registry: Rc::downgrade(&self.registry),
            ids,
        }
    }

    /// Appelle chaque abonné présent au début de la publication
    pub fn publish(&self, signal: Signal) {
        let handlers: Vec<Handler> = self
            .registry
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.signal == signal)
            .map(|entry| Rc::clone(&entry.handler))
            .collect();

        debug!("Publishing {signal} to {} subscriber(s)", handlers.len());

        for handler in handlers {
            match handler.try_borrow_mut() {
                Ok(mut handler) => handler(signal),
                // Le gestionnaire est déjà en cours d'exécution plus haut dans la pile
                Err(_) => warn!("Skipping re-entrant delivery of {signal}"),
            }
        }
    }

    pub fn subscriber_count(&self, signal: Signal) -> usize {
        self.registry
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.signal == signal)
            .count()
    }
}
