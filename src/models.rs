//! Modèle de données
//!
//! Les enregistrements gardent les noms de champs du stockage (camelCase).
//! Les champs inconnus sont conservés dans `extra`, pour qu'une relecture
//! suivie d'une sauvegarde ne perde rien de ce qu'un autre écran a écrit.

use std::collections::BTreeSet;

use derive_more::Display;
use log::warn;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, EnumIter};

use crate::utils::input_validation::{
    optional_email, require_email, require_positive, require_text, ValidationError,
};

/// Statut d'un patient ou d'un membre du personnel
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default, EnumIter, Display,
)]
pub enum ActivityStatus {
    #[default]
    Active,
    Inactive,
}

/// Statut d'un rendez-vous.
///
/// Seul `Scheduled` peut changer: vers `Cancelled` ou `Completed`,
/// et ces deux états sont définitifs.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default, EnumIter, Display,
)]
pub enum AppointmentStatus {
    #[default]
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn can_become(self, next: AppointmentStatus) -> bool {
        self == AppointmentStatus::Scheduled && next != AppointmentStatus::Scheduled
    }
}

/// Les types de rendez-vous proposés, avec leur tarif
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
pub enum AppointmentType {
    #[display("Clinic Visit")]
    ClinicVisit,
    #[display("Home Visit")]
    HomeVisit,
    #[display("Virtual Meet")]
    VirtualMeet,
    #[display("Ambulance Request")]
    AmbulanceRequest,
}

impl AppointmentType {
    pub fn price(self) -> f64 {
        match self {
            AppointmentType::ClinicVisit => 5000.0,
            AppointmentType::HomeVisit => 12000.0,
            AppointmentType::VirtualMeet => 2000.0,
            AppointmentType::AmbulanceRequest => 30000.0,
        }
    }
}

/// Le catalogue fixe des permissions
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Permission {
    #[display("View Patient Profiles")]
    ViewPatients,
    #[display("Edit Patient Profiles")]
    EditPatients,
    #[display("View Appointments")]
    ViewAppointments,
    #[display("Create Appointments")]
    CreateAppointments,
    #[display("Cancel Appointments")]
    CancelAppointments,
    #[display("View Billings")]
    ViewBillings,
    #[display("Edit Billings")]
    EditBillings,
    #[display("Process Payments")]
    ProcessPayments,
    #[display("Generate Reports")]
    GenerateReports,
    #[display("View Communications")]
    ViewCommunications,
    #[display("Send Messages")]
    SendMessages,
    #[display("Manage Inventory")]
    ManageInventory,
    #[display("View Lab Results")]
    ViewLabResults,
    #[display("Create Prescriptions")]
    CreatePrescriptions,
    #[display("Manage Staff")]
    ManageStaff,
    #[display("System Settings")]
    SystemSettings,
}

impl Permission {
    /// Le module de l'application concerné par la permission
    pub fn module(self) -> &'static str {
        use Permission::*;
        match self {
            ViewPatients | EditPatients => "Patients",
            ViewAppointments | CreateAppointments | CancelAppointments => "Appointments",
            ViewBillings | EditBillings | ProcessPayments => "Billing",
            GenerateReports => "Reports",
            ViewCommunications | SendMessages => "Communications",
            ManageInventory => "Inventory",
            ViewLabResults => "Lab",
            CreatePrescriptions => "Pharmacy",
            ManageStaff | SystemSettings => "Admin",
        }
    }
}

/// Les rôles installés quand aucun rôle n'existe encore
pub fn default_role_permissions() -> Vec<(&'static str, BTreeSet<Permission>)> {
    use strum::IntoEnumIterator;
    use Permission::*;

    vec![
        (
            "Doctor",
            BTreeSet::from([
                ViewPatients,
                EditPatients,
                ViewAppointments,
                CreateAppointments,
                CancelAppointments,
                ViewLabResults,
                CreatePrescriptions,
                GenerateReports,
            ]),
        ),
        (
            "Nurse",
            BTreeSet::from([
                ViewPatients,
                EditPatients,
                ViewAppointments,
                CreateAppointments,
                ViewBillings,
            ]),
        ),
        (
            "Receptionist",
            BTreeSet::from([
                ViewAppointments,
                CreateAppointments,
                CancelAppointments,
                ViewCommunications,
                SendMessages,
            ]),
        ),
        (
            "Accountant",
            BTreeSet::from([ViewBillings, EditBillings, ProcessPayments, GenerateReports]),
        ),
        ("Cleaner", BTreeSet::from([ViewAppointments])),
        (
            "Pharmacist",
            BTreeSet::from([ViewPatients, CreatePrescriptions, ManageInventory]),
        ),
        (
            "LabTechnician",
            BTreeSet::from([ViewPatients, ViewLabResults, ManageInventory]),
        ),
        ("Admin", Permission::iter().collect()),
    ]
}

// Des écrans différents écrivent parfois un nombre là où un autre écrit du texte
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!("expected text, found {other}"))),
    }
}

fn lenient_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom("amount out of range")),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid amount {s:?}"))),
        Value::Null => Ok(0.0),
        other => Err(D::Error::custom(format!("expected amount, found {other}"))),
    }
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        Value::String(s) => Ok(s == "true"),
        other => Err(D::Error::custom(format!("expected boolean, found {other}"))),
    }
}

/// Un patient
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, Display)]
#[serde(rename_all = "camelCase", default)]
#[display("{id} - {name}")]
pub struct Patient {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(deserialize_with = "lenient_text")]
    pub phone: String,
    #[serde(deserialize_with = "lenient_text")]
    pub age: String,
    pub gender: String,
    pub blood_group: String,
    pub address: String,
    pub medical_history: String,
    pub allergies: String,
    pub status: ActivityStatus,
    pub registered_date: String,
    pub last_visit: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Un membre du personnel. `role` est le nom d'un rôle (les rôles
/// personnalisés sont permis).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, Display)]
#[serde(rename_all = "camelCase", default)]
#[display("{id} - {name} ({role})")]
pub struct Staff {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(deserialize_with = "lenient_text")]
    pub phone: String,
    pub email: String,
    pub department: String,
    pub qualifications: String,
    pub joined_date: String,
    pub status: ActivityStatus,
    pub manager_name: String,
    pub manager_email: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Un rôle, stocké dans une map indexée par son nom.
///
/// Les identifiants de permission hors catalogue (écrits par d'anciennes
/// versions) sont gardés dans `unknown_permissions` et réécrits tels quels.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(from = "StoredRole", into = "StoredRole")]
pub struct Role {
    pub permissions: BTreeSet<Permission>,
    pub unknown_permissions: Vec<String>,
    pub created_at: String,
    pub extra: Map<String, Value>,
}

/// Forme stockée d'un rôle: un seul tableau de chaînes pour les permissions
#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct StoredRole {
    permissions: Vec<Value>,
    #[serde(deserialize_with = "lenient_text")]
    created_at: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<StoredRole> for Role {
    fn from(stored: StoredRole) -> Self {
        let mut permissions = BTreeSet::new();
        let mut unknown_permissions = Vec::new();

        for raw in stored.permissions {
            match serde_json::from_value::<Permission>(raw.clone()) {
                Ok(permission) => {
                    permissions.insert(permission);
                }
                Err(_) => match raw {
                    Value::String(id) => unknown_permissions.push(id),
                    other => warn!("Ignoring invalid permission entry {other}"),
                },
            }
        }

        Role {
            permissions,
            unknown_permissions,
            created_at: stored.created_at,
            extra: stored.extra,
        }
    }
}

impl From<Role> for StoredRole {
    fn from(role: Role) -> Self {
        let permissions = role
            .permissions
            .iter()
            .map(|p| Value::String(p.as_ref().to_owned()))
            .chain(role.unknown_permissions.into_iter().map(Value::String))
            .collect();

        StoredRole {
            permissions,
            created_at: role.created_at,
            extra: role.extra,
        }
    }
}

impl Role {
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, Display)]
#[serde(rename_all = "camelCase", default)]
#[display("{id} - {patient_name}, {kind} on {date} at {time} [{status}]")]
pub struct Appointment {
    pub id: String,
    pub patient_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub date: String,
    pub time: String,
    pub notes: String,
    pub status: AppointmentStatus,
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, Display)]
#[serde(rename_all = "camelCase", default)]
#[display("{invoice_id} - {patient_name}: {amount}")]
pub struct Invoice {
    pub id: String,
    pub invoice_id: String,
    pub patient_name: String,
    pub email: String,
    #[serde(deserialize_with = "lenient_text")]
    pub contact: String,
    pub date: String,
    #[serde(deserialize_with = "lenient_amount")]
    pub amount: f64,
    pub notes: String,
    pub staff_email: String,
    #[serde(deserialize_with = "lenient_flag")]
    pub paid: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub confirmed: bool,
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Valeurs générées par le système au moment de la création
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub id: String,
    /// `YYYY-MM-DD`
    pub today: String,
    /// RFC 3339
    pub timestamp: String,
}

/// Les champs saisis par l'utilisateur pour créer un enregistrement.
/// Un champ optionnel renseigné l'emporte sur la valeur générée.
pub trait Draft {
    type Record;

    fn validate(&self) -> Result<(), ValidationError>;

    fn into_record(self, generated: Generated) -> Self::Record;
}

#[derive(Debug, Clone, Default)]
pub struct PatientDraft {
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub age: String,
    pub gender: String,
    pub blood_group: String,
    pub address: String,
    pub medical_history: String,
    pub allergies: String,
    pub status: Option<ActivityStatus>,
    pub registered_date: Option<String>,
    pub last_visit: Option<String>,
}

impl Draft for PatientDraft {
    type Record = Patient;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.name, "Name")?;
        require_email(&self.email, "Email")?;
        require_text(&self.phone, "Phone")
    }

    fn into_record(self, generated: Generated) -> Patient {
        Patient {
            id: self.id.unwrap_or(generated.id),
            name: self.name,
            email: self.email,
            phone: self.phone,
            age: self.age,
            gender: self.gender,
            blood_group: self.blood_group,
            address: self.address,
            medical_history: self.medical_history,
            allergies: self.allergies,
            status: self.status.unwrap_or_default(),
            registered_date: self.registered_date.unwrap_or(generated.today),
            last_visit: self.last_visit.unwrap_or_default(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaffDraft {
    pub id: Option<String>,
    pub name: String,
    pub role: String,
    pub phone: String,
    pub email: String,
    pub department: String,
    pub qualifications: String,
    pub manager_name: String,
    pub manager_email: String,
    pub joined_date: Option<String>,
    pub status: Option<ActivityStatus>,
}

impl Draft for StaffDraft {
    type Record = Staff;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.name, "Name")?;
        require_email(&self.email, "Email")?;
        require_text(&self.role, "Role")?;
        optional_email(&self.manager_email, "Manager email")
    }

    fn into_record(self, generated: Generated) -> Staff {
        Staff {
            id: self.id.unwrap_or(generated.id),
            name: self.name.trim().to_owned(),
            role: self.role.trim().to_owned(),
            phone: self.phone,
            email: self.email,
            department: self.department,
            qualifications: self.qualifications,
            joined_date: self.joined_date.unwrap_or(generated.today),
            status: self.status.unwrap_or_default(),
            manager_name: self.manager_name,
            manager_email: self.manager_email,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppointmentDraft {
    pub id: Option<String>,
    pub patient_name: String,
    pub kind: String,
    pub date: String,
    pub time: String,
    pub notes: String,
    pub status: Option<AppointmentStatus>,
    pub created_at: Option<String>,
}

impl Draft for AppointmentDraft {
    type Record = Appointment;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.patient_name, "Name")?;
        require_text(&self.date, "Date")?;
        require_text(&self.time, "Time")
    }

    fn into_record(self, generated: Generated) -> Appointment {
        Appointment {
            id: self.id.unwrap_or(generated.id),
            patient_name: self.patient_name,
            kind: self.kind,
            date: self.date,
            time: self.time,
            notes: self.notes,
            status: self.status.unwrap_or_default(),
            created_at: self.created_at.unwrap_or(generated.timestamp),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceDraft {
    pub id: Option<String>,
    /// Numéro lisible; généré s'il est absent
    pub invoice_id: Option<String>,
    pub patient_name: String,
    pub email: String,
    pub contact: String,
    /// Date de la facture; aujourd'hui si absente
    pub date: Option<String>,
    pub amount: f64,
    pub notes: String,
    pub staff_email: String,
    pub paid: Option<bool>,
    pub confirmed: Option<bool>,
    pub created_at: Option<String>,
}

impl Draft for InvoiceDraft {
    type Record = Invoice;

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.patient_name, "Patient Name")?;
        require_email(&self.email, "Email")?;
        require_positive(self.amount, "Amount")
    }

    /// Le numéro lisible est fourni par le dépôt des factures; à défaut,
    /// l'identifiant système est repris.
    fn into_record(self, generated: Generated) -> Invoice {
        Invoice {
            invoice_id: self.invoice_id.unwrap_or_else(|| generated.id.clone()),
            id: self.id.unwrap_or(generated.id),
            patient_name: self.patient_name,
            email: self.email,
            contact: self.contact,
            date: self.date.unwrap_or(generated.today),
            amount: self.amount,
            notes: self.notes,
            staff_email: self.staff_email,
            paid: self.paid.unwrap_or(false),
            confirmed: self.confirmed.unwrap_or(false),
            created_at: self.created_at.unwrap_or(generated.timestamp),
            extra: Map::new(),
        }
    }
}
