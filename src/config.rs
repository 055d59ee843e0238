//! Configuration d'exécution, lue depuis l'environnement (et un éventuel fichier `.env`)

use std::{env, path::PathBuf, str::FromStr};

use log::{warn, LevelFilter};

use crate::consts::{
    DEFAULT_DATA_FILE, DEFAULT_LOG_FILE, DEFAULT_LOG_LEVEL, ENV_DATA_FILE, ENV_LOG_FILE,
    ENV_LOG_LEVEL,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_file: PathBuf,
    pub log_file: PathBuf,
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: DEFAULT_DATA_FILE.into(),
            log_file: DEFAULT_LOG_FILE.into(),
            log_level: LevelFilter::Info,
        }
    }
}

impl Config {
    /// Charge le fichier `.env` s'il existe, puis lit les variables `ECONSULT_*`.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Construit la configuration à partir d'une fonction de recherche de variables.
    /// Une valeur absente ou vide garde la valeur par défaut.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let log_level = match get(ENV_LOG_LEVEL) {
            Some(raw) => LevelFilter::from_str(raw.trim()).unwrap_or_else(|_| {
                warn!("Unknown log level {raw:?}, falling back to {DEFAULT_LOG_LEVEL}");
                defaults.log_level
            }),
            None => defaults.log_level,
        };

        Self {
            data_file: get(ENV_DATA_FILE).map(PathBuf::from).unwrap_or(defaults.data_file),
            log_file: get(ENV_LOG_FILE).map(PathBuf::from).unwrap_or(defaults.log_file),
            log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_DATA_FILE, "/tmp/clinic.json"),
            (ENV_LOG_FILE, "/tmp/clinic.log"),
            (ENV_LOG_LEVEL, "debug"),
        ]));

        assert_eq!(config.data_file, PathBuf::from("/tmp/clinic.json"));
        assert_eq!(config.log_file, PathBuf::from("/tmp/clinic.log"));
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_or_blank_values_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_DATA_FILE, "   "),
            (ENV_LOG_LEVEL, "loud"),
        ]));

        assert_eq!(config.data_file, PathBuf::from(DEFAULT_DATA_FILE));
        assert_eq!(config.log_level, LevelFilter::Info);
    }
}
