//! Résumés affichés par les tableaux de bord. Fonctions pures sur les collections.

use std::collections::BTreeMap;

use derive_more::Display;
use strum::IntoEnumIterator;

use crate::models::{Appointment, AppointmentStatus, AppointmentType, Invoice, Patient, Staff};

/// Nombre d'enregistrements par collection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[display("{patients} patient(s), {staff} staff, {appointments} appointment(s), {invoices} invoice(s)")]
pub struct Overview {
    pub patients: usize,
    pub staff: usize,
    pub appointments: usize,
    pub invoices: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[display("Paid: {paid}, Pending: {pending}, Confirmed: {confirmed}")]
pub struct InvoiceStatusCounts {
    pub paid: usize,
    pub pending: usize,
    /// Indépendant de `paid`: une facture peut être payée et confirmée
    pub confirmed: usize,
}

/// Somme des montants de toutes les factures, payées ou non
pub fn revenue_total(invoices: &[Invoice]) -> f64 {
    invoices.iter().map(|invoice| invoice.amount).sum()
}

/// Somme des montants encore impayés
pub fn outstanding_total(invoices: &[Invoice]) -> f64 {
    invoices
        .iter()
        .filter(|invoice| !invoice.paid)
        .map(|invoice| invoice.amount)
        .sum()
}

pub fn invoice_status_counts(invoices: &[Invoice]) -> InvoiceStatusCounts {
    invoices
        .iter()
        .fold(InvoiceStatusCounts::default(), |mut counts, invoice| {
            if invoice.paid {
                counts.paid += 1;
            } else {
                counts.pending += 1;
            }
            if invoice.confirmed {
                counts.confirmed += 1;
            }
            counts
        })
}

/// Nombre de rendez-vous par statut; chaque statut est présent, même à zéro
pub fn appointment_status_counts(appointments: &[Appointment]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = AppointmentStatus::iter()
        .map(|status| (status.to_string(), 0))
        .collect();
    for appointment in appointments {
        *counts.entry(appointment.status.to_string()).or_default() += 1;
    }
    counts
}

/// Nombre de rendez-vous par type. Les types connus sont toujours présents;
/// un type inconnu écrit par un autre écran a sa propre entrée.
pub fn appointment_type_counts(appointments: &[Appointment]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = AppointmentType::iter()
        .map(|kind| (kind.to_string(), 0))
        .collect();
    for appointment in appointments.iter().filter(|a| !a.kind.is_empty()) {
        *counts.entry(appointment.kind.clone()).or_default() += 1;
    }
    counts
}

fn matches(query: &str, fields: &[&str]) -> bool {
    let query = query.trim().to_lowercase();
    query.is_empty()
        || fields
            .iter()
            .any(|field| field.to_lowercase().contains(&query))
}

/// Recherche insensible à la casse sur le nom, l'id et l'email.
/// Une requête vide renvoie tout.
pub fn search_patients<'a>(patients: &'a [Patient], query: &str) -> Vec<&'a Patient> {
    patients
        .iter()
        .filter(|p| matches(query, &[&p.name, &p.id, &p.email]))
        .collect()
}

/// Recherche sur le nom, l'id, le rôle et le département
pub fn search_staff<'a>(staff: &'a [Staff], query: &str) -> Vec<&'a Staff> {
    staff
        .iter()
        .filter(|s| matches(query, &[&s.name, &s.id, &s.role, &s.department]))
        .collect()
}
