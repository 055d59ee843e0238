//! Regroupement des anciennes clés de stockage vers une clé canonique par entité.
//!
//! Plusieurs versions des écrans ont écrit les mêmes données sous des clés
//! différentes. Au démarrage, tout est replié dans l'emplacement canonique:
//! en cas de doublon d'identifiant, l'enregistrement canonique l'emporte.
//!
//! Les anciennes clés de session (`clinic_staff`, `clinic_roles`,
//! `clinic_appointments`) ne sont trouvées que si le stockage de session est
//! partagé avec l'application qui les a écrites (`DataStore::new`). Avec
//! `DataStore::open`, la session démarre vide et seules les clés durables
//! sont reprises.

use derive_more::Display;
use log::{info, warn};
use serde_json::{Map, Value};

use crate::{
    consts::{
        DATA_KEY, LEGACY_APPOINTMENTS_KEY, LEGACY_PATIENTS_KEY, LEGACY_STAFF_KEY, PATIENTS_FIELD, PATIENTS_KEY,
        ROLES_KEY, USERS_KEY,
    },
    models::{Appointment, Patient, Staff},
    repository::{Entity, RoleRepository},
    store::{DataStore, Lifetime, StoreError},
};

/// Ce qui a été repris des anciennes clés
#[derive(Debug, Default, Clone, PartialEq, Eq, Display)]
#[display(
    "{patients} patient(s), {staff} staff, {roles} role(s), {appointments} appointment(s) migrated"
)]
pub struct MigrationReport {
    pub patients: usize,
    pub staff: usize,
    pub roles: usize,
    pub appointments: usize,
    /// Clés (ou champs `clé.champ`) supprimées après reprise
    pub removed: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

fn id_of(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

/// Les enregistrements d'une ancienne collection: un tableau, ou une map
/// dont les valeurs sont les enregistrements (profils indexés par email).
/// Les entrées qui ne sont pas des objets sont ignorées.
fn records_of(value: Value) -> Vec<Value> {
    let records: Vec<Value> = match value {
        Value::Array(records) => records,
        Value::Object(map) => map.into_iter().map(|(_, record)| record).collect(),
        _ => Vec::new(),
    };
    records.into_iter().filter(Value::is_object).collect()
}

// Noms de champs des anciens formulaires patient, et leur équivalent actuel
const PATIENT_ALIASES: [(&str, &str); 3] =
    [("patientName", "name"), ("contact", "phone"), ("patientId", "id")];

/// Renseigne les champs actuels à partir des anciens noms, sans écraser
/// une valeur déjà présente. Les anciens champs restent en place.
fn normalize_patient(mut record: Value) -> Value {
    if let Value::Object(members) = &mut record {
        for (old, new) in PATIENT_ALIASES {
            let missing = match members.get(new) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            let Some(value) = members.get(old).filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            if missing {
                members.insert(new.to_owned(), value);
            }
        }
    }
    record
}

/// Ajoute à `target` les enregistrements dont l'id est inconnu
fn merge_by_id(target: &mut Vec<Value>, records: Vec<Value>) -> usize {
    let mut added = 0;
    for record in records {
        let known = match id_of(&record) {
            Some(id) => target.iter().any(|r| id_of(r) == Some(id)),
            None => target.contains(&record),
        };
        if !known {
            target.push(record);
            added += 1;
        }
    }
    added
}

/// Lit le tableau canonique d'une entité sans passer par le dépôt,
/// pour ne pas réparer (et donc effacer) un ancien format.
fn canonical_array<T: Entity>(store: &DataStore) -> Vec<Value> {
    let slot = T::SLOT;
    let value = match slot.field {
        Some(field) => store
            .read_value(slot.lifetime, slot.key)
            .and_then(|blob| blob.get(field).cloned()),
        None => store.read_value(slot.lifetime, slot.key),
    };
    match value {
        Some(records @ Value::Array(_)) => records_of(records),
        _ => Vec::new(),
    }
}

/// Retire un champ d'un blob objet et renvoie sa valeur
fn take_field(
    store: &DataStore,
    lifetime: Lifetime,
    key: &str,
    field: &str,
) -> Result<Option<Value>, StoreError> {
    let Some(Value::Object(mut blob)) = store.read_value(lifetime, key) else {
        return Ok(None);
    };
    let taken = blob.remove(field);
    if taken.is_some() {
        store.write(lifetime, key, &Value::Object(blob))?;
    }
    Ok(taken)
}

struct Migrator<'a> {
    store: &'a DataStore,
    report: MigrationReport,
}

impl Migrator<'_> {
    fn drop_key(&mut self, lifetime: Lifetime, key: &str) -> Result<(), StoreError> {
        self.store.remove(lifetime, key)?;
        self.report.removed.push(key.to_owned());
        Ok(())
    }

    fn patients(&mut self) -> Result<(), StoreError> {
        let canonical = self.store.read_value(Lifetime::Durable, PATIENTS_KEY);
        let keyed_by_email = matches!(canonical, Some(Value::Object(_)));
        let old_key = self.store.contains(Lifetime::Durable, LEGACY_PATIENTS_KEY);
        let from_old_key = self.store.read_value(Lifetime::Durable, LEGACY_PATIENTS_KEY);
        let from_blob = self
            .store
            .read_value(Lifetime::Durable, DATA_KEY)
            .and_then(|blob| blob.get(PATIENTS_FIELD).cloned());
        if !keyed_by_email && !old_key && from_blob.is_none() {
            return Ok(());
        }

        let mut records = Vec::new();
        let mut added = 0;
        let sources = [canonical, from_old_key, from_blob];
        for (i, source) in sources.into_iter().enumerate() {
            let legacy: Vec<Value> = source
                .map(records_of)
                .unwrap_or_default()
                .into_iter()
                .map(normalize_patient)
                .collect();
            let merged = merge_by_id(&mut records, legacy);
            // Les profils d'un tableau canonique ne sont pas une reprise
            if i > 0 || keyed_by_email {
                added += merged;
            }
        }
        Patient::SLOT.write(self.store, Value::Array(records))?;

        if keyed_by_email {
            // L'ancienne map `email -> profil` est remplacée par un tableau
            self.report.removed.push(format!("{PATIENTS_KEY}{{}}"));
        }
        if old_key {
            self.drop_key(Lifetime::Durable, LEGACY_PATIENTS_KEY)?;
        }
        if take_field(self.store, Lifetime::Durable, DATA_KEY, PATIENTS_FIELD)?.is_some() {
            self.report
                .removed
                .push(format!("{DATA_KEY}.{PATIENTS_FIELD}"));
        }
        self.report.patients = added;
        Ok(())
    }

    fn staff(&mut self) -> Result<(), StoreError> {
        let bare = match self.store.read_value(Lifetime::Durable, USERS_KEY) {
            Some(array @ Value::Array(_)) => Some(array),
            _ => None,
        };
        let session_key = self.store.contains(Lifetime::Session, LEGACY_STAFF_KEY);
        if bare.is_none() && !session_key {
            return Ok(());
        }

        let mut records = canonical_array::<Staff>(self.store);
        let mut added = 0;

        if let Some(bare) = bare {
            added += merge_by_id(&mut records, records_of(bare));
            // L'ancien tableau est remplacé par `{ staff: [...] }` ci-dessous
            self.report.removed.push(format!("{USERS_KEY}[]"));
        }
        if let Some(session) = self.store.read_value(Lifetime::Session, LEGACY_STAFF_KEY) {
            added += merge_by_id(&mut records, records_of(session));
        }

        Staff::SLOT.write(self.store, Value::Array(records))?;
        if session_key {
            self.drop_key(Lifetime::Session, LEGACY_STAFF_KEY)?;
        }
        self.report.staff = added;
        Ok(())
    }

    fn roles(&mut self) -> Result<(), StoreError> {
        if !self.store.contains(Lifetime::Session, ROLES_KEY) {
            return Ok(());
        }

        let legacy = match self.store.read_value(Lifetime::Session, ROLES_KEY) {
            Some(Value::Object(map)) => map,
            _ => {
                warn!("Session roles are not a map, dropping them");
                Map::new()
            }
        };
        let slot = RoleRepository::SLOT;
        let mut roles = match self.store.read_value(slot.lifetime, slot.key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let mut added = 0;
        for (name, role) in legacy {
            if role.is_object() && !roles.contains_key(&name) {
                roles.insert(name, role);
                added += 1;
            }
        }

        slot.write(self.store, Value::Object(roles))?;
        self.drop_key(Lifetime::Session, ROLES_KEY)?;
        self.report.roles = added;
        Ok(())
    }

    fn appointments(&mut self) -> Result<(), StoreError> {
        let Some(legacy) = self
            .store
            .read_value(Lifetime::Session, LEGACY_APPOINTMENTS_KEY)
        else {
            if self.store.contains(Lifetime::Session, LEGACY_APPOINTMENTS_KEY) {
                self.drop_key(Lifetime::Session, LEGACY_APPOINTMENTS_KEY)?;
            }
            return Ok(());
        };

        let mut records = canonical_array::<Appointment>(self.store);
        let added = merge_by_id(&mut records, records_of(legacy));

        Appointment::SLOT.write(self.store, Value::Array(records))?;
        self.drop_key(Lifetime::Session, LEGACY_APPOINTMENTS_KEY)?;
        self.report.appointments = added;
        Ok(())
    }
}

/// Replie les anciennes clés dans les emplacements canoniques.
///
/// À appeler avant toute lecture par les dépôts: un dépôt réparerait un
/// ancien format (par exemple `users` en tableau nu) en l'effaçant.
pub fn migrate_legacy(store: &DataStore) -> Result<MigrationReport, StoreError> {
    let mut migrator = Migrator {
        store,
        report: MigrationReport::default(),
    };

    migrator.patients()?;
    migrator.staff()?;
    migrator.roles()?;
    migrator.appointments()?;

    let report = migrator.report;
    if report.is_empty() {
        info!("No legacy storage keys found");
    } else {
        info!("{report} (removed: {})", report.removed.join(", "));
    }
    Ok(report)
}
