//! Stockage clé-valeur local, avec sérialisation JSON et deux durées de vie
//!
//! Les valeurs sont conservées sous forme de texte brut, exactement comme le
//! stockage d'un navigateur: un texte corrompu peut donc exister, et il est
//! réparé à la lecture.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fs::{create_dir_all, File},
    io::{self, ErrorKind::NotFound},
    path::{Path, PathBuf},
};

use derive_more::Display;
use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not serialize value for key {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Quota exceeded while writing {key}: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },
}

/// Durée de vie d'une entrée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Lifetime {
    /// Survit au redémarrage
    Durable,
    /// Vit le temps de la session (du processus)
    Session,
}

/// Un stockage de textes indexés par clé
pub trait StorageBackend {
    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&mut self, key: &str, value: String) -> Result<(), StoreError>;

    fn remove_item(&mut self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Vec<String>;

    /// Relit l'état partagé avec d'autres processus et renvoie les clés
    /// modifiées depuis la dernière observation.
    fn refresh(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

/// Stockage en mémoire, avec un quota optionnel en octets
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            quota: Some(quota),
        }
    }

    fn used_without(&self, key: &str) -> usize {
        self.items
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        if let Some(quota) = self.quota {
            let needed = self.used_without(key) + key.len() + value.len();
            if needed > quota {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_owned(),
                    needed,
                    quota,
                });
            }
        }
        self.items.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StoreError> {
        self.items.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }
}

/// Stockage durable dans un fichier JSON `{ clé: texte }`.
///
/// Chaque écriture relit d'abord le fichier et ne modifie que sa propre clé:
/// deux processus partageant le fichier se comportent comme deux onglets,
/// le dernier qui écrit une clé gagne.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: BTreeMap<String, String>,
    /// Clés changées par un autre processus et reprises lors d'une écriture,
    /// pas encore signalées par `refresh`
    unseen: BTreeSet<String>,
}

/// Les clés dont le texte diffère entre deux contenus, ajoutées ou supprimées comprises
fn diff_keys(before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    changed.extend(before.keys().filter(|k| !after.contains_key(*k)).cloned());
    changed
}

impl FileStorage {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        match Self::load(&path)? {
            Some(items) => Ok(Self {
                path,
                items,
                unseen: BTreeSet::new(),
            }),

            // Fichier absent ou illisible, on repart d'un stockage vide
            None => {
                let storage = Self {
                    path,
                    items: BTreeMap::new(),
                    unseen: BTreeSet::new(),
                };
                // On vérifie la sauvegarde immédiatement
                storage.save()?;
                Ok(storage)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_owned(),
            source,
        }
    }

    /// `None` si le fichier n'existe pas ou ne contient pas un objet JSON valide
    fn load(path: &Path) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        match File::open(path) {
            Ok(f) => match serde_json::from_reader(io::BufReader::new(f)) {
                Ok(items) => Ok(Some(items)),
                Err(e) => {
                    warn!(
                        "Corrupted storage file {}, resetting to empty: {e}",
                        path.display()
                    );
                    Ok(None)
                }
            },
            Err(not_found) if not_found.kind() == NotFound => {
                info!("Storage file {} not found, creating it", path.display());
                Ok(None)
            }
            Err(other) => Err(Self::io_error(path, other)),
        }
    }

    fn save(&self) -> Result<(), StoreError> {
        // Crée le dossier parent s'il n'existe pas
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
            }
        }

        let file = File::create(&self.path).map_err(|e| Self::io_error(&self.path, e))?;
        serde_json::to_writer_pretty(file, &self.items).map_err(|e| StoreError::Serialize {
            key: self.path.display().to_string(),
            source: e,
        })
    }

    /// Reprend le contenu du disque avant une écriture
    fn reload(&mut self) -> Result<(), StoreError> {
        if let Some(items) = Self::load(&self.path)? {
            self.unseen.extend(diff_keys(&self.items, &items));
            self.items = items;
        }
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.reload()?;
        self.items.insert(key.to_owned(), value);
        self.save()
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StoreError> {
        self.reload()?;
        if self.items.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    fn refresh(&mut self) -> Result<Vec<String>, StoreError> {
        let on_disk = Self::load(&self.path)?.unwrap_or_default();

        let mut changed = std::mem::take(&mut self.unseen);
        changed.extend(diff_keys(&self.items, &on_disk));

        self.items = on_disk;
        Ok(changed.into_iter().collect())
    }
}

/// Le stockage local: un backend durable et un backend de session.
///
/// Les lectures ne lèvent jamais d'erreur: un texte qui ne se désérialise pas
/// est remplacé par la valeur par défaut fournie.
pub struct DataStore {
    durable: RefCell<Box<dyn StorageBackend>>,
    session: RefCell<Box<dyn StorageBackend>>,
}

impl DataStore {
    pub fn new(durable: Box<dyn StorageBackend>, session: Box<dyn StorageBackend>) -> Self {
        Self {
            durable: RefCell::new(durable),
            session: RefCell::new(session),
        }
    }

    /// Deux backends en mémoire
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()), Box::new(MemoryStorage::new()))
    }

    /// Stockage durable dans `path`, session en mémoire
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        Ok(Self::new(
            Box::new(FileStorage::open(path)?),
            Box::new(MemoryStorage::new()),
        ))
    }

    fn backend(&self, lifetime: Lifetime) -> &RefCell<Box<dyn StorageBackend>> {
        match lifetime {
            Lifetime::Durable => &self.durable,
            Lifetime::Session => &self.session,
        }
    }

    pub fn read_text(&self, lifetime: Lifetime, key: &str) -> Option<String> {
        self.backend(lifetime).borrow().get_item(key)
    }

    /// Lit et désérialise la valeur sous `key`.
    /// Si la clé est absente, renvoie `default`; si le texte est corrompu,
    /// le remplace par `default` et renvoie `default`.
    pub fn read<T>(&self, lifetime: Lifetime, key: &str, default: T) -> T
    where
        T: DeserializeOwned + Serialize,
    {
        let Some(text) = self.read_text(lifetime, key) else {
            return default;
        };

        match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Corrupted {lifetime} entry {key:?}, resetting to default: {e}");
                if let Err(e) = self.write(lifetime, key, &default) {
                    error!("Could not repair {lifetime} entry {key:?}: {e}");
                }
                default
            }
        }
    }

    /// Valeur JSON brute, sans réparation. `None` si absente ou illisible.
    pub fn read_value(&self, lifetime: Lifetime, key: &str) -> Option<Value> {
        let text = self.read_text(lifetime, key)?;
        serde_json::from_str(&text)
            .map_err(|e| debug!("Entry {key:?} is not valid JSON: {e}"))
            .ok()
    }

    pub fn write<T>(&self, lifetime: Lifetime, key: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        let text = serde_json::to_string(value).map_err(|e| StoreError::Serialize {
            key: key.to_owned(),
            source: e,
        })?;
        self.write_text(lifetime, key, text)
    }

    /// Écrit un texte brut, sans vérification
    pub fn write_text(
        &self,
        lifetime: Lifetime,
        key: &str,
        text: String,
    ) -> Result<(), StoreError> {
        debug!("Writing {} bytes to {lifetime} entry {key:?}", text.len());
        self.backend(lifetime).borrow_mut().set_item(key, text)
    }

    pub fn remove(&self, lifetime: Lifetime, key: &str) -> Result<(), StoreError> {
        self.backend(lifetime).borrow_mut().remove_item(key)
    }

    pub fn contains(&self, lifetime: Lifetime, key: &str) -> bool {
        self.read_text(lifetime, key).is_some()
    }

    pub fn keys(&self, lifetime: Lifetime) -> Vec<String> {
        self.backend(lifetime).borrow().keys()
    }

    /// Clés durables modifiées par un autre processus depuis la dernière fois
    pub fn refresh(&self) -> Vec<String> {
        match self.durable.borrow_mut().refresh() {
            Ok(changed) => changed,
            Err(e) => {
                error!("Could not refresh durable storage: {e}");
                Vec::new()
            }
        }
    }
}
