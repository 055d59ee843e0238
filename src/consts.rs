//! Définition des constantes globales: clés de stockage, préfixes d'identifiants, chemins.

// Clés canoniques
pub const PATIENTS_KEY: &str = "patient_profiles"; // Tableau de patients.
pub const USERS_KEY: &str = "users"; // Objet `{ staff: [...] }`.
pub const ROLES_KEY: &str = "clinic_roles"; // Map nom de rôle -> rôle.
pub const DATA_KEY: &str = "econsult_data_v1"; // Blob partagé rendez-vous + factures.

// Champs des blobs partagés
pub const STAFF_FIELD: &str = "staff";
pub const PATIENTS_FIELD: &str = "patients";
pub const APPOINTMENTS_FIELD: &str = "appointments";
pub const INVOICES_FIELD: &str = "invoices";

// Anciennes clés, encore présentes dans des stockages existants
pub const LEGACY_PATIENTS_KEY: &str = "patients_profile";
pub const LEGACY_STAFF_KEY: &str = "clinic_staff";
pub const LEGACY_APPOINTMENTS_KEY: &str = "clinic_appointments";

// Préfixes d'identifiants
pub const PATIENT_ID_PREFIX: &str = "PAT";
pub const STAFF_ID_PREFIX: &str = "STF";
pub const APPOINTMENT_ID_PREFIX: &str = "app-";
pub const INVOICE_ID_PREFIX: &str = "inv-";
pub const INVOICE_NUMBER_PREFIX: &str = "INV-";

/// Nombre de chiffres du timestamp conservés dans un identifiant de personnel.
pub const STAFF_ID_DIGITS: usize = 6;

// Configuration par défaut
pub const DEFAULT_DATA_FILE: &str = "./data/econsult.json"; // Stockage durable.
pub const DEFAULT_LOG_FILE: &str = "./econsult.log";
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Variables d'environnement
pub const ENV_DATA_FILE: &str = "ECONSULT_DATA_FILE";
pub const ENV_LOG_FILE: &str = "ECONSULT_LOG_FILE";
pub const ENV_LOG_LEVEL: &str = "ECONSULT_LOG_LEVEL";
