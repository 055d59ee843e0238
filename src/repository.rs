//! Dépôts d'entités: lecture, remplacement complet et ajout sur une clé de stockage
//!
//! Chaque mutation relit la collection entière, la modifie en mémoire puis la
//! réécrit en entier. Il n'y a pas de verrou: le dernier qui écrit gagne.

use std::{collections::BTreeMap, marker::PhantomData, rc::Rc};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rand_core::{OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{
    bus::{Signal, SignalBus},
    clock::{Clock, IdGenerator},
    consts::{
        APPOINTMENTS_FIELD, APPOINTMENT_ID_PREFIX, DATA_KEY, INVOICES_FIELD, INVOICE_ID_PREFIX,
        INVOICE_NUMBER_PREFIX, PATIENTS_KEY, PATIENT_ID_PREFIX, ROLES_KEY, STAFF_FIELD,
        STAFF_ID_DIGITS, STAFF_ID_PREFIX, USERS_KEY,
    },
    models::{
        default_role_permissions, Appointment, AppointmentDraft, AppointmentStatus, Draft,
        Generated, Invoice, InvoiceDraft, Patient, PatientDraft, Permission, Role, Staff,
        StaffDraft,
    },
    store::{DataStore, Lifetime, StoreError},
    utils::input_validation::{require_text, ValidationError},
};

#[derive(Debug, Error, PartialEq)]
pub enum RepositoryError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("No record with id {0}")]
    NotFound(String),

    #[error("Appointment {id} is {from}, it cannot become {to}")]
    InvalidTransition {
        id: String,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Role {0} already exists")]
    RoleExists(String),
}

/// Emplacement d'une collection: une clé, et éventuellement un champ
/// d'un objet JSON partagé avec d'autres collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub lifetime: Lifetime,
    pub key: &'static str,
    pub field: Option<&'static str>,
}

fn same_shape(value: &Value, empty: &Value) -> bool {
    value.is_array() && empty.is_array() || value.is_object() && empty.is_object()
}

impl Slot {
    pub const fn key(lifetime: Lifetime, key: &'static str) -> Self {
        Self {
            lifetime,
            key,
            field: None,
        }
    }

    pub const fn field(lifetime: Lifetime, key: &'static str, field: &'static str) -> Self {
        Self {
            lifetime,
            key,
            field: Some(field),
        }
    }

    /// Lit la collection brute. Une forme inattendue (objet au lieu de tableau,
    /// ou l'inverse) est remplacée par `empty` dans le stockage.
    pub fn read(&self, store: &DataStore, empty: Value) -> Value {
        let Some(field) = self.field else {
            let value = store.read(self.lifetime, self.key, empty.clone());
            if same_shape(&value, &empty) {
                return value;
            }
            warn!("Unexpected shape under {:?}, resetting to {empty}", self.key);
            self.heal(store, empty.clone());
            return empty;
        };

        let blob = store.read(self.lifetime, self.key, json!({}));
        let Value::Object(map) = blob else {
            warn!("Blob {:?} is not an object, resetting it", self.key);
            self.heal(store, empty.clone());
            return empty;
        };

        match map.get(field) {
            None => empty,
            Some(value) if same_shape(value, &empty) => value.clone(),
            Some(_) => {
                warn!(
                    "Unexpected shape for {:?}.{field}, resetting to {empty}",
                    self.key
                );
                self.heal(store, empty.clone());
                empty
            }
        }
    }

    /// Écrit la collection; les autres champs d'un blob partagé sont conservés
    pub fn write(&self, store: &DataStore, value: Value) -> Result<(), StoreError> {
        let Some(field) = self.field else {
            return store.write(self.lifetime, self.key, &value);
        };

        let mut map = match store.read(self.lifetime, self.key, json!({})) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert(field.to_owned(), value);
        store.write(self.lifetime, self.key, &Value::Object(map))
    }

    fn heal(&self, store: &DataStore, empty: Value) {
        if let Err(e) = self.write(store, empty) {
            error!("Could not repair {:?}: {e}", self.key);
        }
    }

    fn label(&self) -> String {
        match self.field {
            Some(field) => format!("{}.{field}", self.key),
            None => self.key.to_owned(),
        }
    }
}

/// État partagé par les dépôts: stockage, bus, horloge, générateur d'ids
pub struct Context {
    pub store: DataStore,
    pub bus: SignalBus,
    clock: Box<dyn Clock>,
    ids: IdGenerator,
}

impl Context {
    pub fn new(store: DataStore, clock: Box<dyn Clock>) -> Self {
        Self {
            store,
            bus: SignalBus::new(),
            clock,
            ids: IdGenerator::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn generated<F>(&self, prefix: &str, digits: Option<usize>, taken: F) -> Generated
    where
        F: Fn(&str) -> bool,
    {
        Generated {
            id: self
                .ids
                .generate(self.now().timestamp_millis(), prefix, digits, taken),
            today: self.clock.today(),
            timestamp: self.clock.timestamp(),
        }
    }
}

/// Une entité stockée en tableau
pub trait Entity: Serialize + DeserializeOwned + Clone {
    type Draft: Draft<Record = Self>;

    const SLOT: Slot;
    const ID_PREFIX: &'static str;
    const ID_DIGITS: Option<usize> = None;
    /// Publiés après chaque sauvegarde réussie
    const SIGNALS: &'static [Signal];
    /// Publié en plus après la modification d'un seul enregistrement
    const RECORD_SIGNAL: Option<Signal> = None;

    fn id(&self) -> &str;

    /// Dernière occasion de compléter un brouillon avant sa validation
    fn complete_draft(_draft: &mut Self::Draft, _now: DateTime<Utc>) {}
}

impl Entity for Patient {
    type Draft = PatientDraft;

    const SLOT: Slot = Slot::key(Lifetime::Durable, PATIENTS_KEY);
    const ID_PREFIX: &'static str = PATIENT_ID_PREFIX;
    const SIGNALS: &'static [Signal] = &[Signal::Storage, Signal::PatientsUpdated];
    const RECORD_SIGNAL: Option<Signal> = Some(Signal::PatientUpdated);

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Staff {
    type Draft = StaffDraft;

    const SLOT: Slot = Slot::field(Lifetime::Durable, USERS_KEY, STAFF_FIELD);
    const ID_PREFIX: &'static str = STAFF_ID_PREFIX;
    const ID_DIGITS: Option<usize> = Some(STAFF_ID_DIGITS);
    const SIGNALS: &'static [Signal] = &[Signal::StaffUpdated, Signal::Storage];

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Appointment {
    type Draft = AppointmentDraft;

    const SLOT: Slot = Slot::field(Lifetime::Durable, DATA_KEY, APPOINTMENTS_FIELD);
    const ID_PREFIX: &'static str = APPOINTMENT_ID_PREFIX;
    const SIGNALS: &'static [Signal] = &[Signal::AppointmentUpdated];

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Invoice {
    type Draft = InvoiceDraft;

    const SLOT: Slot = Slot::field(Lifetime::Durable, DATA_KEY, INVOICES_FIELD);
    const ID_PREFIX: &'static str = INVOICE_ID_PREFIX;
    const SIGNALS: &'static [Signal] = &[Signal::InvoiceUpdated];

    fn id(&self) -> &str {
        &self.id
    }

    fn complete_draft(draft: &mut InvoiceDraft, now: DateTime<Utc>) {
        if draft.invoice_id.is_none() {
            draft.invoice_id = Some(invoice_number(now));
        }
    }
}

/// Numéro de facture lisible: `INV-<yyyymmddHHMMSSmmm>-<100..999>`
pub fn invoice_number(now: DateTime<Utc>) -> String {
    let suffix = 100 + OsRng.next_u32() % 900;
    format!(
        "{INVOICE_NUMBER_PREFIX}{}-{suffix}",
        now.format("%Y%m%d%H%M%S%3f")
    )
}

/// Décode un enregistrement; un membre `null` prend sa valeur par défaut.
/// Un enregistrement illisible est ignoré sans toucher au stockage.
fn decode_record<T: DeserializeOwned>(mut record: Value, label: &str) -> Option<T> {
    if let Value::Object(members) = &mut record {
        members.retain(|_, value| !value.is_null());
    }
    serde_json::from_value(record)
        .map_err(|e| warn!("Skipping unreadable record in {label}: {e}"))
        .ok()
}

/// Le dépôt d'une entité
pub struct Repository<T: Entity> {
    ctx: Rc<Context>,
    _entity: PhantomData<T>,
}

impl<T: Entity> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.ctx))
    }
}

impl<T: Entity> Repository<T> {
    pub fn new(ctx: Rc<Context>) -> Self {
        Self {
            ctx,
            _entity: PhantomData,
        }
    }

    /// Toute la collection, dans l'ordre du stockage.
    /// Un texte corrompu ou une forme inattendue est remplacé par `[]`;
    /// un enregistrement illisible est seulement ignoré.
    pub fn get_all(&self) -> Vec<T> {
        let Value::Array(records) = T::SLOT.read(&self.ctx.store, json!([])) else {
            return Vec::new();
        };
        let label = T::SLOT.label();
        records
            .into_iter()
            .filter_map(|record| decode_record(record, &label))
            .collect()
    }

    /// Remplace la collection, puis publie les signaux de l'entité.
    /// Renvoie `false` si l'écriture a échoué (rien n'est publié).
    pub fn save_all(&self, items: &[T]) -> bool {
        let persisted = serde_json::to_value(items)
            .map_err(|e| StoreError::Serialize {
                key: T::SLOT.label(),
                source: e,
            })
            .and_then(|value| T::SLOT.write(&self.ctx.store, value));

        match persisted {
            Ok(()) => {
                for &signal in T::SIGNALS {
                    self.ctx.bus.publish(signal);
                }
                true
            }
            Err(e) => {
                error!("Failed to save {}: {e}", T::SLOT.label());
                false
            }
        }
    }

    /// Crée un enregistrement à partir d'un brouillon et l'ajoute en fin de collection.
    ///
    /// Un échec d'écriture est journalisé mais l'enregistrement est tout de
    /// même renvoyé.
    pub fn add(&self, mut draft: T::Draft) -> Result<T, RepositoryError> {
        T::complete_draft(&mut draft, self.ctx.now());
        draft.validate()?;

        let mut items = self.get_all();
        let generated = self.ctx.generated(T::ID_PREFIX, T::ID_DIGITS, |candidate| {
            items.iter().any(|item| item.id() == candidate)
        });
        let record = draft.into_record(generated);

        if items.iter().any(|item| item.id() == record.id()) {
            return Err(ValidationError::DuplicateId(record.id().to_owned()).into());
        }

        items.push(record.clone());
        if self.save_all(&items) {
            info!("Added {} to {}", record.id(), T::SLOT.label());
        }
        Ok(record)
    }

    pub fn find(&self, id: &str) -> Option<T> {
        self.get_all().into_iter().find(|item| item.id() == id)
    }

    /// Modifie l'enregistrement `id` et réécrit la collection.
    /// `change` ne doit pas modifier l'identifiant.
    pub fn update<F>(&self, id: &str, change: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut T),
    {
        let mut items = self.get_all();
        let item = items
            .iter_mut()
            .find(|item| item.id() == id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_owned()))?;

        change(item);
        let updated = item.clone();

        if self.save_all(&items) {
            if let Some(signal) = T::RECORD_SIGNAL {
                self.ctx.bus.publish(signal);
            }
        }
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<T, RepositoryError> {
        let mut items = self.get_all();
        let index = items
            .iter()
            .position(|item| item.id() == id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_owned()))?;

        let removed = items.remove(index);
        if self.save_all(&items) {
            info!("Removed {id} from {}", T::SLOT.label());
        }
        Ok(removed)
    }
}

impl Repository<Invoice> {
    /// Bascule `paid` (payée <-> impayée). Aucun autre champ n'est modifié.
    pub fn toggle_paid(&self, id: &str) -> Result<Invoice, RepositoryError> {
        self.update(id, |invoice| invoice.paid = !invoice.paid)
    }

    pub fn set_confirmed(&self, id: &str, confirmed: bool) -> Result<Invoice, RepositoryError> {
        self.update(id, |invoice| invoice.confirmed = confirmed)
    }
}

impl Repository<Appointment> {
    fn transition(
        &self,
        id: &str,
        next: AppointmentStatus,
    ) -> Result<Appointment, RepositoryError> {
        let current = self
            .find(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_owned()))?;

        if !current.status.can_become(next) {
            return Err(RepositoryError::InvalidTransition {
                id: id.to_owned(),
                from: current.status,
                to: next,
            });
        }
        self.update(id, |appointment| appointment.status = next)
    }

    pub fn cancel(&self, id: &str) -> Result<Appointment, RepositoryError> {
        self.transition(id, AppointmentStatus::Cancelled)
    }

    pub fn complete(&self, id: &str) -> Result<Appointment, RepositoryError> {
        self.transition(id, AppointmentStatus::Completed)
    }
}

/// Les rôles, stockés en map `nom -> rôle`
#[derive(Clone)]
pub struct RoleRepository {
    ctx: Rc<Context>,
}

impl RoleRepository {
    pub const SLOT: Slot = Slot::key(Lifetime::Durable, ROLES_KEY);

    pub fn new(ctx: Rc<Context>) -> Self {
        Self { ctx }
    }

    pub fn get_all(&self) -> BTreeMap<String, Role> {
        let Value::Object(roles) = Self::SLOT.read(&self.ctx.store, json!({})) else {
            return BTreeMap::new();
        };
        roles
            .into_iter()
            .filter_map(|(name, role)| decode_record(role, ROLES_KEY).map(|role| (name, role)))
            .collect()
    }

    pub fn save_all(&self, roles: &BTreeMap<String, Role>) -> bool {
        let persisted = serde_json::to_value(roles)
            .map_err(|e| StoreError::Serialize {
                key: ROLES_KEY.to_owned(),
                source: e,
            })
            .and_then(|value| Self::SLOT.write(&self.ctx.store, value));

        match persisted {
            Ok(()) => {
                self.ctx.bus.publish(Signal::RolesUpdated);
                true
            }
            Err(e) => {
                error!("Failed to save roles: {e}");
                false
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Role> {
        self.get_all().remove(name)
    }

    pub fn add<I>(&self, name: &str, permissions: I) -> Result<Role, RepositoryError>
    where
        I: IntoIterator<Item = Permission>,
    {
        let name = name.trim();
        require_text(name, "Role name")?;

        let mut roles = self.get_all();
        if roles.contains_key(name) {
            return Err(RepositoryError::RoleExists(name.to_owned()));
        }

        let role = Role {
            permissions: permissions.into_iter().collect(),
            unknown_permissions: Vec::new(),
            created_at: self.ctx.clock().today(),
            extra: Map::new(),
        };
        roles.insert(name.to_owned(), role.clone());
        if self.save_all(&roles) {
            info!("Role {name} created");
        }
        Ok(role)
    }

    pub fn update_permissions<I>(&self, name: &str, permissions: I) -> Result<Role, RepositoryError>
    where
        I: IntoIterator<Item = Permission>,
    {
        let mut roles = self.get_all();
        let role = roles
            .get_mut(name)
            .ok_or_else(|| RepositoryError::NotFound(name.to_owned()))?;

        role.permissions = permissions.into_iter().collect();
        let updated = role.clone();
        self.save_all(&roles);
        Ok(updated)
    }

    pub fn remove(&self, name: &str) -> Result<Role, RepositoryError> {
        let mut roles = self.get_all();
        let removed = roles
            .remove(name)
            .ok_or_else(|| RepositoryError::NotFound(name.to_owned()))?;
        self.save_all(&roles);
        Ok(removed)
    }

    /// Installe les rôles par défaut si aucun rôle n'existe.
    /// Renvoie `true` si des rôles ont été créés.
    pub fn seed_defaults(&self) -> bool {
        if !self.get_all().is_empty() {
            return false;
        }

        let today = self.ctx.clock().today();
        let roles = default_role_permissions()
            .into_iter()
            .map(|(name, permissions)| {
                let role = Role {
                    permissions,
                    unknown_permissions: Vec::new(),
                    created_at: today.clone(),
                    extra: Map::new(),
                };
                (name.to_owned(), role)
            })
            .collect();

        info!("Seeding default roles");
        self.save_all(&roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::ActivityStatus;
    use crate::store::MemoryStorage;
    use std::cell::RefCell;

    const NOW: i64 = 1_700_000_000_000;

    fn context() -> Rc<Context> {
        Rc::new(Context::new(
            DataStore::in_memory(),
            Box::new(ManualClock::at_millis(NOW)),
        ))
    }

    fn patient_draft(name: &str) -> PatientDraft {
        PatientDraft {
            name: name.into(),
            email: "j@x.com".into(),
            phone: "555".into(),
            ..Default::default()
        }
    }

    fn invoice_draft(id: &str) -> InvoiceDraft {
        InvoiceDraft {
            id: Some(id.into()),
            patient_name: "Ada".into(),
            email: "ada@x.com".into(),
            amount: 5000.0,
            ..Default::default()
        }
    }

    /// Compte les publications d'un signal
    fn counter(ctx: &Context, signal: Signal) -> (Rc<RefCell<usize>>, crate::bus::Subscription) {
        let count = Rc::new(RefCell::new(0));
        let shared = Rc::clone(&count);
        let sub = ctx.bus.subscribe(signal, move |_| *shared.borrow_mut() += 1);
        (count, sub)
    }

    mod patient_tests {
        use super::*;

        #[test]
        fn test_add_on_empty_repository() {
            let patients = Repository::<Patient>::new(context());
            let added = patients.add(patient_draft("J Doe")).unwrap();

            let all = patients.get_all();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0], added);
            assert_eq!(added.id, format!("PAT{NOW}"));
            assert_eq!(added.name, "J Doe");
            assert_eq!(added.email, "j@x.com");
            assert_eq!(added.phone, "555");
            assert_eq!(added.status, ActivityStatus::Active);
            assert_eq!(added.registered_date, "2023-11-14");
        }

        #[test]
        fn test_added_records_are_appended_with_unique_ids() {
            let patients = Repository::<Patient>::new(context());
            let first = patients.add(patient_draft("First")).unwrap();
            let second = patients.add(patient_draft("Second")).unwrap();

            let all = patients.get_all();
            assert_ne!(first.id, second.id);
            assert_eq!(all.iter().filter(|p| p.id == second.id).count(), 1);
            assert_eq!(all[1].name, "Second", "add must append");
        }

        #[test]
        fn test_save_all_of_get_all_is_idempotent() {
            let ctx = context();
            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            patients.add(patient_draft("First")).unwrap();
            patients.add(patient_draft("Second")).unwrap();

            let before = patients.get_all();
            let text_before = ctx.store.read_text(Lifetime::Durable, PATIENTS_KEY);
            assert!(patients.save_all(&patients.get_all()));

            assert_eq!(patients.get_all(), before);
            assert_eq!(ctx.store.read_text(Lifetime::Durable, PATIENTS_KEY), text_before);
        }

        #[test]
        fn test_corrupted_text_is_repaired() {
            let ctx = context();
            ctx.store
                .write_text(Lifetime::Durable, PATIENTS_KEY, "{{{ nope".into())
                .unwrap();

            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            assert!(patients.get_all().is_empty());
            assert_eq!(
                ctx.store.read_text(Lifetime::Durable, PATIENTS_KEY).as_deref(),
                Some("[]")
            );
        }

        #[test]
        fn test_object_instead_of_array_is_repaired() {
            let ctx = context();
            ctx.store
                .write(Lifetime::Durable, PATIENTS_KEY, &json!({"PAT1": {"name": "x"}}))
                .unwrap();

            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            assert!(patients.get_all().is_empty());
            assert_eq!(
                ctx.store.read_text(Lifetime::Durable, PATIENTS_KEY).as_deref(),
                Some("[]")
            );
        }

        #[test]
        fn test_signal_fires_once_after_write_is_visible() {
            let ctx = context();
            let patients = Repository::<Patient>::new(Rc::clone(&ctx));

            let seen = Rc::new(RefCell::new(Vec::new()));
            let (reader, log) = (patients.clone(), Rc::clone(&seen));
            let _sub = ctx.bus.subscribe(Signal::PatientsUpdated, move |_| {
                log.borrow_mut().push(reader.get_all().len());
            });

            patients.add(patient_draft("J Doe")).unwrap();
            assert_eq!(
                *seen.borrow(),
                vec![1],
                "Handler must run exactly once and see the new record"
            );
        }

        #[test]
        fn test_invalid_draft_writes_nothing() {
            let ctx = context();
            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            let (count, _sub) = counter(&ctx, Signal::PatientsUpdated);

            let result = patients.add(PatientDraft {
                name: "J Doe".into(),
                ..Default::default()
            });

            assert!(matches!(result, Err(RepositoryError::Invalid(_))));
            assert!(!ctx.store.contains(Lifetime::Durable, PATIENTS_KEY));
            assert_eq!(*count.borrow(), 0);
        }

        #[test]
        fn test_duplicate_caller_id_is_rejected() {
            let patients = Repository::<Patient>::new(context());
            let mut draft = patient_draft("First");
            draft.id = Some("PAT1".into());
            patients.add(draft.clone()).unwrap();

            assert_eq!(
                patients.add(draft),
                Err(RepositoryError::Invalid(ValidationError::DuplicateId(
                    "PAT1".into()
                )))
            );
        }

        #[test]
        fn test_update_publishes_record_signal() {
            let ctx = context();
            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            let added = patients.add(patient_draft("J Doe")).unwrap();
            let (count, _sub) = counter(&ctx, Signal::PatientUpdated);

            let updated = patients
                .update(&added.id, |p| p.status = ActivityStatus::Inactive)
                .unwrap();

            assert_eq!(updated.status, ActivityStatus::Inactive);
            assert_eq!(patients.find(&added.id), Some(updated));
            assert_eq!(*count.borrow(), 1);
            assert_eq!(
                patients.update("PAT0", |_| {}),
                Err(RepositoryError::NotFound("PAT0".into()))
            );
        }

        #[test]
        fn test_unreadable_record_does_not_erase_the_others() {
            let ctx = context();
            let stored = json!([
                {"id": "PAT1", "name": "Ada", "email": "ada@x.com"},
                {"id": "PAT2", "name": "Bola", "email": null},
                {"id": "PAT3", "name": "Chidi", "status": "Unknown"},
                {"id": "PAT4", "name": "Dayo"}
            ]);
            ctx.store
                .write(Lifetime::Durable, PATIENTS_KEY, &stored)
                .unwrap();
            let text_before = ctx.store.read_text(Lifetime::Durable, PATIENTS_KEY);

            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            let ids: Vec<String> = patients.get_all().into_iter().map(|p| p.id).collect();

            assert_eq!(ids, vec!["PAT1", "PAT2", "PAT4"], "Only PAT3 is unreadable");
            assert_eq!(patients.find("PAT2").unwrap().email, "", "null means default");
            assert_eq!(
                ctx.store.read_text(Lifetime::Durable, PATIENTS_KEY),
                text_before,
                "Reading must not rewrite a collection with one bad record"
            );
        }

        #[test]
        fn test_remove() {
            let patients = Repository::<Patient>::new(context());
            let added = patients.add(patient_draft("J Doe")).unwrap();

            assert_eq!(patients.remove(&added.id), Ok(added));
            assert!(patients.get_all().is_empty());
        }

        #[test]
        fn test_write_failure_is_silent() {
            let ctx = Rc::new(Context::new(
                DataStore::new(
                    Box::new(MemoryStorage::with_quota(8)),
                    Box::new(MemoryStorage::new()),
                ),
                Box::new(ManualClock::at_millis(NOW)),
            ));
            let patients = Repository::<Patient>::new(Rc::clone(&ctx));
            let (count, _sub) = counter(&ctx, Signal::PatientsUpdated);

            let added = patients.add(patient_draft("J Doe"));

            assert!(added.is_ok(), "A failed write must not surface to the caller");
            assert!(patients.get_all().is_empty());
            assert_eq!(*count.borrow(), 0, "Nothing is published when the write fails");
        }
    }

    mod staff_tests {
        use super::*;

        fn staff_draft(name: &str) -> StaffDraft {
            StaffDraft {
                name: name.into(),
                role: "Nurse".into(),
                email: "joy@hospital.com".into(),
                ..Default::default()
            }
        }

        #[test]
        fn test_same_tick_ids_are_distinct() {
            let staff = Repository::<Staff>::new(context());
            let first = staff.add(staff_draft("Joy")).unwrap();
            let second = staff.add(staff_draft("Ann")).unwrap();

            assert_eq!(first.id, "STF000000");
            assert_eq!(second.id, "STF000001");
            assert_eq!(first.joined_date, "2023-11-14");
        }

        #[test]
        fn test_staff_live_inside_users_blob() {
            let ctx = context();
            ctx.store
                .write(Lifetime::Durable, USERS_KEY, &json!({"admins": ["root"]}))
                .unwrap();

            let staff = Repository::<Staff>::new(Rc::clone(&ctx));
            staff.add(staff_draft("Joy")).unwrap();

            let blob: Value = ctx.store.read(Lifetime::Durable, USERS_KEY, Value::Null);
            assert_eq!(blob["admins"], json!(["root"]), "Other members are preserved");
            assert_eq!(blob["staff"][0]["name"], "Joy");
        }

        #[test]
        fn test_wrong_field_shape_is_repaired() {
            let ctx = context();
            ctx.store
                .write(
                    Lifetime::Durable,
                    USERS_KEY,
                    &json!({"staff": {"STF1": {}}, "admins": []}),
                )
                .unwrap();

            let staff = Repository::<Staff>::new(Rc::clone(&ctx));
            assert!(staff.get_all().is_empty());

            let blob: Value = ctx.store.read(Lifetime::Durable, USERS_KEY, Value::Null);
            assert_eq!(blob, json!({"staff": [], "admins": []}));
        }

        #[test]
        fn test_publishes_staff_and_storage() {
            let ctx = context();
            let staff = Repository::<Staff>::new(Rc::clone(&ctx));
            let (staff_count, _a) = counter(&ctx, Signal::StaffUpdated);
            let (storage_count, _b) = counter(&ctx, Signal::Storage);

            staff.add(staff_draft("Joy")).unwrap();

            assert_eq!(*staff_count.borrow(), 1);
            assert_eq!(*storage_count.borrow(), 1);
        }
    }

    mod invoice_tests {
        use super::*;

        #[test]
        fn test_defaults_and_invoice_number() {
            let invoices = Repository::<Invoice>::new(context());
            let invoice = invoices
                .add(InvoiceDraft {
                    patient_name: "Ada".into(),
                    email: "ada@x.com".into(),
                    amount: 2000.0,
                    ..Default::default()
                })
                .unwrap();

            assert_eq!(invoice.id, format!("inv-{NOW}"));
            assert!(!invoice.paid);
            assert!(!invoice.confirmed);
            assert_eq!(invoice.date, "2023-11-14");
            assert_eq!(invoice.created_at, "2023-11-14T22:13:20.000Z");
            assert!(
                invoice.invoice_id.starts_with("INV-20231114221320000-"),
                "Unexpected invoice number {}",
                invoice.invoice_id
            );
            let suffix: u32 = invoice.invoice_id.rsplit('-').next().unwrap().parse().unwrap();
            assert!((100..1000).contains(&suffix));
        }

        #[test]
        fn test_toggle_paid_twice_restores_original() {
            let ctx = context();
            let invoices = Repository::<Invoice>::new(Rc::clone(&ctx));
            let original = invoices.add(invoice_draft("inv-1")).unwrap();
            let (count, _sub) = counter(&ctx, Signal::InvoiceUpdated);

            let paid = invoices.toggle_paid("inv-1").unwrap();
            assert!(paid.paid);
            assert_eq!(Invoice { paid: false, ..paid }, original);

            invoices.toggle_paid("inv-1").unwrap();
            assert_eq!(invoices.get_all(), vec![original]);
            assert_eq!(*count.borrow(), 2);
        }

        #[test]
        fn test_invoices_share_the_blob_with_appointments() {
            let ctx = context();
            let invoices = Repository::<Invoice>::new(Rc::clone(&ctx));
            let appointments = Repository::<Appointment>::new(Rc::clone(&ctx));

            invoices.add(invoice_draft("inv-1")).unwrap();
            appointments
                .add(AppointmentDraft {
                    patient_name: "Ada".into(),
                    date: "2025-02-06".into(),
                    time: "09:00".into(),
                    ..Default::default()
                })
                .unwrap();

            assert_eq!(invoices.get_all().len(), 1);
            assert_eq!(appointments.get_all().len(), 1);
        }

        #[test]
        fn test_set_confirmed_and_unknown_id() {
            let invoices = Repository::<Invoice>::new(context());
            invoices.add(invoice_draft("inv-1")).unwrap();

            assert!(invoices.set_confirmed("inv-1", true).unwrap().confirmed);
            assert_eq!(
                invoices.toggle_paid("inv-404"),
                Err(RepositoryError::NotFound("inv-404".into()))
            );
        }
    }

    mod appointment_tests {
        use super::*;

        fn booked(repo: &Repository<Appointment>) -> Appointment {
            repo.add(AppointmentDraft {
                patient_name: "Ada".into(),
                kind: "Clinic Visit".into(),
                date: "2025-02-06".into(),
                time: "09:00".into(),
                notes: "Eye check".into(),
                ..Default::default()
            })
            .unwrap()
        }

        #[test]
        fn test_new_appointments_are_scheduled() {
            let appointments = Repository::<Appointment>::new(context());
            let appointment = booked(&appointments);

            assert_eq!(appointment.id, format!("app-{NOW}"));
            assert_eq!(appointment.status, AppointmentStatus::Scheduled);
            assert_eq!(appointment.created_at, "2023-11-14T22:13:20.000Z");
        }

        #[test]
        fn test_cancel_is_final() {
            let appointments = Repository::<Appointment>::new(context());
            let appointment = booked(&appointments);

            let cancelled = appointments.cancel(&appointment.id).unwrap();
            assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

            assert_eq!(
                appointments.complete(&appointment.id),
                Err(RepositoryError::InvalidTransition {
                    id: appointment.id.clone(),
                    from: AppointmentStatus::Cancelled,
                    to: AppointmentStatus::Completed,
                })
            );
        }

        #[test]
        fn test_complete() {
            let appointments = Repository::<Appointment>::new(context());
            let appointment = booked(&appointments);

            let done = appointments.complete(&appointment.id).unwrap();
            assert_eq!(done.status, AppointmentStatus::Completed);
            assert!(appointments.cancel(&appointment.id).is_err());
        }
    }

    mod role_tests {
        use super::*;

        #[test]
        fn test_add_and_update_role() {
            let ctx = context();
            let roles = RoleRepository::new(Rc::clone(&ctx));
            let (count, _sub) = counter(&ctx, Signal::RolesUpdated);

            let role = roles
                .add(" Midwife ", [Permission::ViewPatients])
                .unwrap();
            assert_eq!(role.created_at, "2023-11-14");
            assert!(role.allows(Permission::ViewPatients));

            let updated = roles
                .update_permissions("Midwife", [Permission::ViewPatients, Permission::EditPatients])
                .unwrap();
            assert!(updated.allows(Permission::EditPatients));
            assert_eq!(roles.get("Midwife"), Some(updated));
            assert_eq!(*count.borrow(), 2);
        }

        #[test]
        fn test_role_errors() {
            let roles = RoleRepository::new(context());
            roles.add("Doctor", []).unwrap();

            assert_eq!(
                roles.add("Doctor", []),
                Err(RepositoryError::RoleExists("Doctor".into()))
            );
            assert_eq!(
                roles.add("  ", []),
                Err(RepositoryError::Invalid(ValidationError::Required(
                    "Role name"
                )))
            );
            assert_eq!(
                roles.update_permissions("Ghost", []),
                Err(RepositoryError::NotFound("Ghost".into()))
            );
        }

        #[test]
        fn test_roles_are_stored_as_a_map() {
            let ctx = context();
            let roles = RoleRepository::new(Rc::clone(&ctx));
            roles.add("Cleaner", [Permission::ViewAppointments]).unwrap();

            let raw: Value = ctx.store.read(Lifetime::Durable, ROLES_KEY, Value::Null);
            assert_eq!(
                raw,
                json!({"Cleaner": {"permissions": ["view_appointments"], "createdAt": "2023-11-14"}})
            );
        }

        #[test]
        fn test_unknown_permission_keeps_the_role() {
            let ctx = context();
            ctx.store
                .write(
                    Lifetime::Durable,
                    ROLES_KEY,
                    &json!({
                        "Midwife": {"permissions": ["view_patients"], "createdAt": "2024-01-01"},
                        "Ops": {"permissions": ["manage_users"], "createdAt": "2024-01-01"},
                        "Broken": {"permissions": {"view_patients": true}}
                    }),
                )
                .unwrap();
            let text_before = ctx.store.read_text(Lifetime::Durable, ROLES_KEY);

            let roles = RoleRepository::new(Rc::clone(&ctx));
            let all = roles.get_all();

            assert_eq!(all.keys().collect::<Vec<_>>(), vec!["Midwife", "Ops"]);
            assert_eq!(all["Ops"].unknown_permissions, vec!["manage_users".to_string()]);
            assert!(!roles.seed_defaults(), "Existing roles must not be replaced");
            assert_eq!(ctx.store.read_text(Lifetime::Durable, ROLES_KEY), text_before);

            roles
                .update_permissions("Ops", [Permission::ManageStaff])
                .unwrap();
            let raw: Value = ctx.store.read(Lifetime::Durable, ROLES_KEY, Value::Null);
            assert_eq!(raw["Ops"]["permissions"], json!(["manage_staff", "manage_users"]));
        }

        #[test]
        fn test_array_instead_of_map_is_repaired() {
            let ctx = context();
            ctx.store
                .write(Lifetime::Durable, ROLES_KEY, &json!([]))
                .unwrap();

            let roles = RoleRepository::new(Rc::clone(&ctx));
            assert!(roles.get_all().is_empty());
            assert_eq!(
                ctx.store.read_text(Lifetime::Durable, ROLES_KEY).as_deref(),
                Some("{}")
            );
        }

        #[test]
        fn test_seed_defaults_only_when_empty() {
            let roles = RoleRepository::new(context());
            assert!(roles.seed_defaults());
            assert_eq!(roles.get_all().len(), 8);
            assert!(!roles.seed_defaults(), "Existing roles must not be reseeded");

            roles.remove("Cleaner").unwrap();
            assert_eq!(roles.get_all().len(), 7);
        }
    }
}
