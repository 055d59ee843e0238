//! Horloge injectable et génération d'identifiants `préfixe + millisecondes`

use std::cell::Cell;

use chrono::{DateTime, SecondsFormat, Utc};

/// Source de l'heure courante
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Date du jour au format `YYYY-MM-DD`
    fn today(&self) -> String {
        self.now().format("%Y-%m-%d").to_string()
    }

    /// Horodatage RFC 3339 en millisecondes, suffixe `Z`
    fn timestamp(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// L'horloge système
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Une horloge arrêtée, avancée à la main. Utilisée par les tests.
#[derive(Debug)]
pub struct ManualClock(Cell<DateTime<Utc>>);

impl ManualClock {
    pub fn at_millis(millis: i64) -> Self {
        Self(Cell::new(
            DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        ))
    }

    pub fn advance_millis(&self, millis: i64) {
        let next = self.0.get() + chrono::Duration::milliseconds(millis);
        self.0.set(next);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.get()
    }
}

/// Génère des identifiants `préfixe + millisecondes`.
///
/// Deux appels dans la même milliseconde ne produisent jamais la même valeur:
/// le compteur est monotone et avance d'une milliseconde en cas d'égalité.
/// Un candidat déjà présent dans la collection est sauté.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Cell<i64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_millis(&self, now: i64) -> i64 {
        let next = now.max(self.last.get() + 1);
        self.last.set(next);
        next
    }

    /// `digits` limite le nombre de chiffres conservés (les derniers),
    /// comme pour les identifiants `STF123456`.
    pub fn generate<F>(&self, now: i64, prefix: &str, digits: Option<usize>, taken: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        loop {
            let millis = self.next_millis(now).to_string();
            let tail = match digits {
                Some(n) if millis.len() > n => &millis[millis.len() - n..],
                _ => millis.as_str(),
            };
            let candidate = format!("{prefix}{tail}");
            if !taken(&candidate) {
                return candidate;
            }
        }
    }
}
