//! Point d'entrée unique: stockage, bus et dépôts partagés par tous les écrans.

use std::rc::Rc;

use log::info;
use thiserror::Error;

use crate::{
    bus::{Signal, SignalBus},
    clock::{Clock, SystemClock},
    config::Config,
    dashboard::Overview,
    migration::{migrate_legacy, MigrationReport},
    models::{Appointment, Invoice, Patient, Staff},
    repository::{Context, Repository, RepositoryError, RoleRepository},
    store::{DataStore, StoreError},
};

#[derive(Debug, Error)]
pub enum ClinicError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct Clinic {
    ctx: Rc<Context>,
    patients: Repository<Patient>,
    staff: Repository<Staff>,
    appointments: Repository<Appointment>,
    invoices: Repository<Invoice>,
    roles: RoleRepository,
    migration: MigrationReport,
}

impl Clinic {
    /// Ouvre le stockage durable décrit par la configuration
    pub fn open(config: &Config) -> Result<Self, ClinicError> {
        info!("Opening clinic data at {}", config.data_file.display());
        let store = DataStore::open(config.data_file.clone())?;
        Self::new(store, Box::new(SystemClock))
    }

    /// Reprend les anciennes clés, puis installe les rôles par défaut si besoin
    pub fn new(store: DataStore, clock: Box<dyn Clock>) -> Result<Self, ClinicError> {
        let migration = migrate_legacy(&store)?;
        let ctx = Rc::new(Context::new(store, clock));

        let clinic = Self {
            patients: Repository::new(Rc::clone(&ctx)),
            staff: Repository::new(Rc::clone(&ctx)),
            appointments: Repository::new(Rc::clone(&ctx)),
            invoices: Repository::new(Rc::clone(&ctx)),
            roles: RoleRepository::new(Rc::clone(&ctx)),
            ctx,
            migration,
        };
        clinic.roles.seed_defaults();
        Ok(clinic)
    }

    pub fn in_memory(clock: Box<dyn Clock>) -> Result<Self, ClinicError> {
        Self::new(DataStore::in_memory(), clock)
    }

    pub fn bus(&self) -> &SignalBus {
        &self.ctx.bus
    }

    pub fn store(&self) -> &DataStore {
        &self.ctx.store
    }

    pub fn patients(&self) -> &Repository<Patient> {
        &self.patients
    }

    pub fn staff(&self) -> &Repository<Staff> {
        &self.staff
    }

    pub fn appointments(&self) -> &Repository<Appointment> {
        &self.appointments
    }

    pub fn invoices(&self) -> &Repository<Invoice> {
        &self.invoices
    }

    pub fn roles(&self) -> &RoleRepository {
        &self.roles
    }

    /// Résultat de la reprise des anciennes clés à l'ouverture
    pub fn migration(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn overview(&self) -> Overview {
        Overview {
            patients: self.patients.get_all().len(),
            staff: self.staff.get_all().len(),
            appointments: self.appointments.get_all().len(),
            invoices: self.invoices.get_all().len(),
        }
    }

    /// Relit le stockage durable. Si un autre processus l'a modifié,
    /// publie `storage` une seule fois et renvoie les clés modifiées.
    pub fn poll_storage(&self) -> Vec<String> {
        let changed = self.ctx.store.refresh();
        if !changed.is_empty() {
            info!("Storage changed externally: {}", changed.join(", "));
            self.ctx.bus.publish(Signal::Storage);
        }
        changed
    }
}
