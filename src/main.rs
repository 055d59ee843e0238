use std::{cell::Cell, rc::Rc};

use anyhow::{anyhow, Result};
use derive_more::Display;
use econsult::bus::{Signal, SignalBus, Subscription};
use econsult::config::Config;
use econsult::dashboard::*;
use econsult::models::*;
use econsult::services::Clinic;
use inquire::{Confirm, CustomType, MultiSelect, Select, Text};
use log::info;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

type MenuExit = Option<()>;
const MENU_EXIT: MenuExit = None;
const MENU_LOOP: MenuExit = Some(());

/// Représente un menu texte
trait Menu {
    /// Implémente le contenu du menu. La valeur de retour
    /// doit être None si le menu souhaite terminer,
    /// ou Some(()) s'il faut le relancer.
    fn enter(&mut self) -> Result<MenuExit>;

    /// Lance le menu en boucle, en interceptant les erreurs,
    /// sauf si le menu souhaite quitter.
    fn enter_loop(&mut self) {
        while let Some(result) = self.enter().transpose() {
            if let Err(error) = result {
                eprintln!("Erreur: {error}");
            }
        }
    }
}

/// Abonnement d'un écran ouvert: marque ses données comme périmées à chaque signal.
/// L'abonnement prend fin quand l'écran est fermé.
struct Watcher {
    stale: Rc<Cell<bool>>,
    _subscription: Subscription,
}

impl Watcher {
    fn new(bus: &SignalBus, signals: &[Signal]) -> Self {
        let stale = Rc::new(Cell::new(true));
        let flag = Rc::clone(&stale);
        let subscription = bus.subscribe_all(signals, move |_| flag.set(true));
        Self {
            stale,
            _subscription: subscription,
        }
    }

    /// `true` une seule fois après chaque notification
    fn take(&self) -> bool {
        self.stale.replace(false)
    }
}

fn optional(text: String) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

pub struct App {
    clinic: Clinic,
}

impl App {
    pub fn new(clinic: Clinic) -> Self {
        App { clinic }
    }

    pub fn start(&mut self) -> Result<()> {
        println!("Bienvenue sur e-Consult, la gestion de la clinique.");
        let migration = self.clinic.migration();
        if !migration.is_empty() {
            println!("[*] Anciennes données reprises: {migration}");
        }
        self.enter_loop();
        Ok(())
    }
}

impl Menu for App {
    fn enter(&mut self) -> Result<MenuExit> {
        #[derive(EnumIter, Display)]
        enum Choice {
            #[display("Patients")]
            Patients,
            #[display("Personnel")]
            Staff,
            #[display("Rôles et permissions")]
            Roles,
            #[display("Rendez-vous")]
            Appointments,
            #[display("Facturation")]
            Billing,
            #[display("Tableau de bord")]
            Dashboard,
            #[display("Quitter")]
            Exit,
        }

        let choice = Select::new("Que voulez-vous faire ?", Choice::iter().collect()).prompt()?;
        let clinic = &self.clinic;

        match choice {
            Choice::Patients => PatientsMenu::open(clinic).enter_loop(),
            Choice::Staff => StaffMenu::open(clinic).enter_loop(),
            Choice::Roles => RolesMenu::open(clinic).enter_loop(),
            Choice::Appointments => AppointmentsMenu::open(clinic).enter_loop(),
            Choice::Billing => BillingMenu::open(clinic).enter_loop(),
            Choice::Dashboard => show_dashboard(clinic),
            Choice::Exit => return Ok(MENU_EXIT),
        }
        Ok(MENU_LOOP)
    }
}

struct PatientsMenu<'c> {
    clinic: &'c Clinic,
    watcher: Watcher,
    patients: Vec<Patient>,
}

impl<'c> PatientsMenu<'c> {
    fn open(clinic: &'c Clinic) -> Self {
        let watcher = Watcher::new(
            clinic.bus(),
            &[Signal::PatientsUpdated, Signal::PatientUpdated, Signal::Storage],
        );
        Self {
            clinic,
            watcher,
            patients: Vec::new(),
        }
    }

    fn refresh(&mut self) {
        self.clinic.poll_storage();
        if self.watcher.take() {
            self.patients = self.clinic.patients().get_all();
        }
    }

    fn pick(&self) -> Result<Option<Patient>> {
        if self.patients.is_empty() {
            println!("[*] Aucun patient enregistré");
            return Ok(None);
        }
        Ok(Select::new("Choisissez un patient:", self.patients.clone()).prompt_skippable()?)
    }
}

impl Menu for PatientsMenu<'_> {
    fn enter(&mut self) -> Result<MenuExit> {
        #[derive(EnumIter, Display)]
        enum Choice {
            #[display("Lister les patients")]
            List,
            #[display("Rechercher")]
            Search,
            #[display("Enregistrer un patient")]
            Add,
            #[display("Changer le statut d'un patient")]
            ToggleStatus,
            #[display("Supprimer un patient")]
            Remove,
            #[display("Retour")]
            Back,
        }

        self.refresh();
        let choice = Select::new("Patients", Choice::iter().collect()).prompt()?;

        match choice {
            Choice::List => {
                for patient in &self.patients {
                    println!("{patient} <{}> [{}]", patient.email, patient.status);
                }
                println!("{} patient(s)", self.patients.len());
            }

            Choice::Search => {
                let query = Text::new("Nom, identifiant ou email:").prompt()?;
                for patient in search_patients(&self.patients, &query) {
                    println!("{patient} <{}>", patient.email);
                }
            }

            Choice::Add => {
                let draft = PatientDraft {
                    name: Text::new("Nom complet:").prompt()?,
                    email: Text::new("Email:").prompt()?,
                    phone: Text::new("Téléphone:").prompt()?,
                    age: Text::new("Âge:").prompt()?,
                    gender: Text::new("Sexe:").prompt()?,
                    blood_group: Text::new("Groupe sanguin:").prompt()?,
                    address: Text::new("Adresse:").prompt()?,
                    medical_history: Text::new("Antécédents médicaux:").prompt()?,
                    allergies: Text::new("Allergies:").prompt()?,
                    ..Default::default()
                };
                let patient = self.clinic.patients().add(draft)?;
                println!("[*] Patient enregistré: {patient}");
            }

            Choice::ToggleStatus => {
                if let Some(patient) = self.pick()? {
                    let status = Select::new("Nouveau statut:", ActivityStatus::iter().collect())
                        .prompt()?;
                    self.clinic
                        .patients()
                        .update(&patient.id, |p| p.status = status)?;
                }
            }

            Choice::Remove => {
                if let Some(patient) = self.pick()? {
                    if Confirm::new(&format!("Supprimer {patient} ?"))
                        .with_default(false)
                        .prompt()?
                    {
                        self.clinic.patients().remove(&patient.id)?;
                    }
                }
            }

            Choice::Back => return Ok(MENU_EXIT),
        }
        Ok(MENU_LOOP)
    }
}

struct StaffMenu<'c> {
    clinic: &'c Clinic,
    watcher: Watcher,
    staff: Vec<Staff>,
}

impl<'c> StaffMenu<'c> {
    fn open(clinic: &'c Clinic) -> Self {
        let watcher = Watcher::new(
            clinic.bus(),
            &[Signal::StaffUpdated, Signal::RolesUpdated, Signal::Storage],
        );
        Self {
            clinic,
            watcher,
            staff: Vec::new(),
        }
    }
}

impl Menu for StaffMenu<'_> {
    fn enter(&mut self) -> Result<MenuExit> {
        #[derive(EnumIter, Display)]
        enum Choice {
            #[display("Lister le personnel")]
            List,
            #[display("Rechercher")]
            Search,
            #[display("Ajouter un membre du personnel")]
            Add,
            #[display("Retour")]
            Back,
        }

        self.clinic.poll_storage();
        if self.watcher.take() {
            self.staff = self.clinic.staff().get_all();
        }

        let choice = Select::new("Personnel", Choice::iter().collect()).prompt()?;
        match choice {
            Choice::List => {
                for member in &self.staff {
                    println!("{member} - {} [{}]", member.department, member.status);
                }
                println!("{} membre(s)", self.staff.len());
            }

            Choice::Search => {
                let query = Text::new("Nom, identifiant, rôle ou département:").prompt()?;
                for member in search_staff(&self.staff, &query) {
                    println!("{member} - {}", member.department);
                }
            }

            Choice::Add => {
                let roles: Vec<String> = self.clinic.roles().get_all().into_keys().collect();
                if roles.is_empty() {
                    return Err(anyhow!("Aucun rôle défini, créez d'abord un rôle"));
                }

                let draft = StaffDraft {
                    name: Text::new("Nom complet:").prompt()?,
                    role: Select::new("Rôle:", roles).prompt()?,
                    email: Text::new("Email:").prompt()?,
                    phone: Text::new("Téléphone:").prompt()?,
                    department: Text::new("Département:").prompt()?,
                    qualifications: Text::new("Qualifications:").prompt()?,
                    manager_name: Text::new("Responsable (nom):").prompt()?,
                    manager_email: Text::new("Responsable (email):").prompt()?,
                    ..Default::default()
                };
                let member = self.clinic.staff().add(draft)?;
                println!("[*] Membre ajouté: {member}");
            }

            Choice::Back => return Ok(MENU_EXIT),
        }
        Ok(MENU_LOOP)
    }
}

struct RolesMenu<'c> {
    clinic: &'c Clinic,
    _watcher: Watcher,
}

impl<'c> RolesMenu<'c> {
    fn open(clinic: &'c Clinic) -> Self {
        Self {
            clinic,
            _watcher: Watcher::new(clinic.bus(), &[Signal::RolesUpdated, Signal::Storage]),
        }
    }

    fn pick_role(&self) -> Result<Option<String>> {
        let names: Vec<String> = self.clinic.roles().get_all().into_keys().collect();
        Ok(Select::new("Choisissez un rôle:", names).prompt_skippable()?)
    }
}

fn select_permissions(current: &[Permission]) -> Result<Vec<Permission>> {
    let all: Vec<Permission> = Permission::iter().collect();
    let defaults: Vec<usize> = all
        .iter()
        .enumerate()
        .filter(|(_, p)| current.contains(p))
        .map(|(i, _)| i)
        .collect();

    Ok(MultiSelect::new("Permissions:", all)
        .with_default(&defaults)
        .prompt()?)
}

impl Menu for RolesMenu<'_> {
    fn enter(&mut self) -> Result<MenuExit> {
        #[derive(EnumIter, Display)]
        enum Choice {
            #[display("Lister les rôles")]
            List,
            #[display("Créer un rôle")]
            Add,
            #[display("Modifier les permissions d'un rôle")]
            Edit,
            #[display("Supprimer un rôle")]
            Remove,
            #[display("Retour")]
            Back,
        }

        self.clinic.poll_storage();
        let choice = Select::new("Rôles", Choice::iter().collect()).prompt()?;

        match choice {
            Choice::List => {
                for (name, role) in self.clinic.roles().get_all() {
                    let labels: Vec<String> =
                        role.permissions.iter().map(|p| p.to_string()).collect();
                    println!("{name} (créé le {}): {}", role.created_at, labels.join(", "));
                }
            }

            Choice::Add => {
                let name = Text::new("Nom du rôle:").prompt()?;
                let permissions = select_permissions(&[])?;
                self.clinic.roles().add(&name, permissions)?;
            }

            Choice::Edit => {
                if let Some(name) = self.pick_role()? {
                    let current: Vec<Permission> = self
                        .clinic
                        .roles()
                        .get(&name)
                        .map(|role| role.permissions.into_iter().collect())
                        .unwrap_or_default();
                    let permissions = select_permissions(&current)?;
                    self.clinic.roles().update_permissions(&name, permissions)?;
                }
            }

            Choice::Remove => {
                if let Some(name) = self.pick_role()? {
                    self.clinic.roles().remove(&name)?;
                }
            }

            Choice::Back => return Ok(MENU_EXIT),
        }
        Ok(MENU_LOOP)
    }
}

struct AppointmentsMenu<'c> {
    clinic: &'c Clinic,
    watcher: Watcher,
    appointments: Vec<Appointment>,
}

impl<'c> AppointmentsMenu<'c> {
    fn open(clinic: &'c Clinic) -> Self {
        let watcher = Watcher::new(
            clinic.bus(),
            &[Signal::AppointmentUpdated, Signal::Storage],
        );
        Self {
            clinic,
            watcher,
            appointments: Vec::new(),
        }
    }

    fn pick_scheduled(&self) -> Result<Option<Appointment>> {
        let scheduled: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|a| a.status == AppointmentStatus::Scheduled)
            .cloned()
            .collect();
        if scheduled.is_empty() {
            println!("[*] Aucun rendez-vous planifié");
            return Ok(None);
        }
        Ok(Select::new("Choisissez un rendez-vous:", scheduled).prompt_skippable()?)
    }
}

impl Menu for AppointmentsMenu<'_> {
    fn enter(&mut self) -> Result<MenuExit> {
        #[derive(EnumIter, Display)]
        enum Choice {
            #[display("Lister les rendez-vous")]
            List,
            #[display("Prendre un rendez-vous")]
            Book,
            #[display("Annuler un rendez-vous")]
            Cancel,
            #[display("Marquer un rendez-vous comme terminé")]
            Complete,
            #[display("Retour")]
            Back,
        }

        self.clinic.poll_storage();
        if self.watcher.take() {
            self.appointments = self.clinic.appointments().get_all();
        }

        let choice = Select::new("Rendez-vous", Choice::iter().collect()).prompt()?;
        match choice {
            Choice::List => {
                for appointment in &self.appointments {
                    println!("{appointment}");
                }
            }

            Choice::Book => {
                let kind = Select::new("Type:", AppointmentType::iter().collect()).prompt()?;
                let draft = AppointmentDraft {
                    patient_name: Text::new("Nom du patient:").prompt()?,
                    kind: kind.to_string(),
                    date: Text::new("Date (AAAA-MM-JJ):").prompt()?,
                    time: Text::new("Heure (HH:MM):").prompt()?,
                    notes: Text::new("Notes:").prompt()?,
                    ..Default::default()
                };
                let appointment = self.clinic.appointments().add(draft)?;
                println!("[*] Rendez-vous pris: {appointment} ({} NGN)", kind.price());
            }

            Choice::Cancel => {
                if let Some(appointment) = self.pick_scheduled()? {
                    self.clinic.appointments().cancel(&appointment.id)?;
                }
            }

            Choice::Complete => {
                if let Some(appointment) = self.pick_scheduled()? {
                    self.clinic.appointments().complete(&appointment.id)?;
                }
            }

            Choice::Back => return Ok(MENU_EXIT),
        }
        Ok(MENU_LOOP)
    }
}

struct BillingMenu<'c> {
    clinic: &'c Clinic,
    watcher: Watcher,
    invoices: Vec<Invoice>,
}

impl<'c> BillingMenu<'c> {
    fn open(clinic: &'c Clinic) -> Self {
        let watcher = Watcher::new(clinic.bus(), &[Signal::InvoiceUpdated, Signal::Storage]);
        Self {
            clinic,
            watcher,
            invoices: Vec::new(),
        }
    }

    fn pick(&self) -> Result<Option<Invoice>> {
        if self.invoices.is_empty() {
            println!("[*] Aucune facture");
            return Ok(None);
        }
        Ok(Select::new("Choisissez une facture:", self.invoices.clone()).prompt_skippable()?)
    }
}

impl Menu for BillingMenu<'_> {
    fn enter(&mut self) -> Result<MenuExit> {
        #[derive(EnumIter, Display)]
        enum Choice {
            #[display("Lister les factures")]
            List,
            #[display("Créer une facture")]
            Add,
            #[display("Marquer payée / impayée")]
            TogglePaid,
            #[display("Confirmer une facture")]
            Confirm,
            #[display("Retour")]
            Back,
        }

        self.clinic.poll_storage();
        if self.watcher.take() {
            self.invoices = self.clinic.invoices().get_all();
        }

        let choice = Select::new("Facturation", Choice::iter().collect()).prompt()?;
        match choice {
            Choice::List => {
                for invoice in &self.invoices {
                    let paid = if invoice.paid { "payée" } else { "impayée" };
                    println!("{invoice} ({}, {paid})", invoice.date);
                }
                println!("Total: {} NGN", revenue_total(&self.invoices));
            }

            Choice::Add => {
                let service =
                    Select::new("Prestation:", AppointmentType::iter().collect()).prompt()?;
                let draft = InvoiceDraft {
                    patient_name: Text::new("Nom du patient:").prompt()?,
                    email: Text::new("Email:").prompt()?,
                    contact: Text::new("Contact:").prompt()?,
                    date: optional(Text::new("Date (vide pour aujourd'hui):").prompt()?),
                    amount: CustomType::<f64>::new("Montant:")
                        .with_default(service.price())
                        .with_error_message("Veuillez entrer un nombre")
                        .prompt()?,
                    notes: Text::new("Notes:").with_default(&service.to_string()).prompt()?,
                    staff_email: Text::new("Email du membre du personnel:").prompt()?,
                    ..Default::default()
                };
                let invoice = self.clinic.invoices().add(draft)?;
                info!("Invoice {} created", invoice.invoice_id);
                println!("[*] Facture créée: {invoice}");
            }

            Choice::TogglePaid => {
                if let Some(invoice) = self.pick()? {
                    self.clinic.invoices().toggle_paid(&invoice.id)?;
                }
            }

            Choice::Confirm => {
                if let Some(invoice) = self.pick()? {
                    self.clinic.invoices().set_confirmed(&invoice.id, true)?;
                }
            }

            Choice::Back => return Ok(MENU_EXIT),
        }
        Ok(MENU_LOOP)
    }
}

fn show_dashboard(clinic: &Clinic) {
    clinic.poll_storage();
    let invoices = clinic.invoices().get_all();
    let appointments = clinic.appointments().get_all();

    println!("\n{}", clinic.overview());
    println!(
        "Chiffre d'affaires: {} NGN, dont impayé: {} NGN",
        revenue_total(&invoices),
        outstanding_total(&invoices)
    );
    println!("Factures: {}", invoice_status_counts(&invoices));

    println!("Rendez-vous par statut:");
    for (status, count) in appointment_status_counts(&appointments) {
        println!("  {status}: {count}");
    }
    println!("Rendez-vous par type:");
    for (kind, count) in appointment_type_counts(&appointments) {
        println!("  {kind}: {count}");
    }
    println!("===============");
}

fn main() -> Result<()> {
    let config = Config::load();
    simple_logging::log_to_file(&config.log_file, config.log_level)?;

    let clinic = Clinic::open(&config)?;
    App::new(clinic).start()
}
