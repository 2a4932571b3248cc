//! Versioned profile storage.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::schema::Profile;
use crate::adapters::AdapterRegistry;
use crate::context::ContextExtractor;
use crate::errors::{DatError, Result};
use crate::extract::extract_table;
use crate::ids::sanitize_component;

/// One stored version of a profile.
#[derive(Debug, Clone)]
pub struct PublishedProfile {
    /// The profile, with its version set.
    pub profile: Arc<Profile>,
    /// Content hash of the profile.
    pub profile_id: String,
    /// System profiles are read-only.
    pub system: bool,
}

/// Column comparison of one table against a sample file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMatch {
    /// Table id.
    pub table_id: String,
    /// Expected columns present in the sample.
    pub matched: Vec<String>,
    /// Expected columns absent from the sample.
    pub missing: Vec<String>,
    /// Sample columns not expected.
    pub extra: Vec<String>,
    /// Extraction error, if the table could not be extracted.
    pub error: Option<String>,
}

impl TableMatch {
    /// Returns true if the sample produced exactly the expected columns.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.error.is_none() && self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Result of [`ProfileStore::validate_against_sample`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMatch {
    /// Per-table comparison, in profile order.
    pub tables: Vec<TableMatch>,
}

impl SampleMatch {
    /// Returns true if every table matched exactly.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.tables.iter().all(TableMatch::is_exact)
    }
}

/// Profile store keeping every version of every profile.
///
/// With a directory configured, each version is persisted as
/// `<dir>/<name>/v<version>.json` and reloaded by [`ProfileStore::open`].
#[derive(Debug, Default)]
pub struct ProfileStore {
    versions: RwLock<BTreeMap<String, Vec<PublishedProfile>>>,
    dir: Option<PathBuf>,
}

impl ProfileStore {
    /// Creates an in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a directory-backed store, loading existing versions.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a stored profile
    /// is malformed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| DatError::io(&dir, e))?;
        let mut versions: BTreeMap<String, Vec<PublishedProfile>> = BTreeMap::new();

        for entry in std::fs::read_dir(&dir).map_err(|e| DatError::io(&dir, e))? {
            let entry = entry.map_err(|e| DatError::io(&dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let mut loaded = Vec::new();
            for file in std::fs::read_dir(entry.path()).map_err(|e| DatError::io(entry.path(), e))? {
                let path = file.map_err(|e| DatError::io(entry.path(), e))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let text = std::fs::read_to_string(&path).map_err(|e| DatError::io(&path, e))?;
                let profile = Profile::from_json(&text)?;
                loaded.push(published(profile, false));
            }
            loaded.sort_by_key(|p| p.profile.version);
            if let Some(first) = loaded.first() {
                versions.insert(first.profile.name.clone(), loaded);
            }
        }

        info!(dir = %dir.display(), profiles = versions.len(), "Profile store opened");
        Ok(Self {
            versions: RwLock::new(versions),
            dir: Some(dir),
        })
    }

    /// Lists the latest version of every profile, by name.
    #[must_use]
    pub fn list(&self) -> Vec<PublishedProfile> {
        self.versions
            .read()
            .values()
            .filter_map(|v| v.last().cloned())
            .collect()
    }

    /// Returns the latest version of a profile.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::ProfileNotFound`] for an unknown name.
    pub fn get(&self, name: &str) -> Result<PublishedProfile> {
        self.versions
            .read()
            .get(name)
            .and_then(|v| v.last().cloned())
            .ok_or_else(|| DatError::ProfileNotFound(name.to_string()))
    }

    /// Returns a specific version of a profile.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::ProfileNotFound`] if the version does not exist.
    pub fn get_version(&self, name: &str, version: u32) -> Result<PublishedProfile> {
        self.versions
            .read()
            .get(name)
            .and_then(|v| v.iter().find(|p| p.profile.version == version).cloned())
            .ok_or_else(|| DatError::ProfileNotFound(format!("{name}@v{version}")))
    }

    /// Returns every stored version of a profile, oldest first.
    #[must_use]
    pub fn history(&self, name: &str) -> Vec<PublishedProfile> {
        self.versions.read().get(name).cloned().unwrap_or_default()
    }

    /// Finds a stored version by profile id.
    #[must_use]
    pub fn find_by_id(&self, profile_id: &str) -> Option<PublishedProfile> {
        self.versions
            .read()
            .values()
            .flat_map(|v| v.iter())
            .find(|p| p.profile_id == profile_id)
            .cloned()
    }

    /// Stores a new profile as version 1.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Profile`] if the profile is invalid or the name is
    /// taken.
    pub fn create(&self, profile: Profile) -> Result<PublishedProfile> {
        self.insert_new(profile, false)
    }

    /// Registers a read-only system profile.
    ///
    /// # Errors
    ///
    /// Same as [`ProfileStore::create`].
    pub fn register_system(&self, profile: Profile) -> Result<PublishedProfile> {
        self.insert_new(profile, true)
    }

    fn insert_new(&self, mut profile: Profile, system: bool) -> Result<PublishedProfile> {
        profile.validate()?;
        profile.version = 1;
        let mut versions = self.versions.write();
        if versions.contains_key(&profile.name) {
            return Err(DatError::Profile {
                profile: profile.name.clone(),
                errors: vec!["a profile with this name already exists".to_string()],
            });
        }
        let entry = published(profile, system);
        self.persist(&entry)?;
        info!(profile = %entry.profile.name, profile_id = %entry.profile_id, system, "Profile created");
        versions.insert(entry.profile.name.clone(), vec![entry.clone()]);
        Ok(entry)
    }

    /// Stores a changed profile as a new version.
    ///
    /// An update whose content hash equals the latest version's returns the
    /// latest version unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::ProfileNotFound`], [`DatError::ProfilePermission`]
    /// for system profiles, or [`DatError::Profile`] if invalid.
    pub fn update(&self, mut profile: Profile) -> Result<PublishedProfile> {
        profile.validate()?;
        let mut versions = self.versions.write();
        let history = versions
            .get_mut(&profile.name)
            .ok_or_else(|| DatError::ProfileNotFound(profile.name.clone()))?;
        let Some(latest) = history.last() else {
            return Err(DatError::ProfileNotFound(profile.name.clone()));
        };
        if latest.system {
            return Err(DatError::ProfilePermission {
                profile: profile.name.clone(),
                action: "updated".to_string(),
            });
        }
        if latest.profile_id == profile.profile_id() {
            debug!(profile = %profile.name, "Profile unchanged; keeping version");
            return Ok(latest.clone());
        }

        profile.version = latest.profile.version + 1;
        let entry = published(profile, false);
        self.persist(&entry)?;
        info!(
            profile = %entry.profile.name,
            version = entry.profile.version,
            profile_id = %entry.profile_id,
            "Profile updated"
        );
        history.push(entry.clone());
        Ok(entry)
    }

    /// Removes a profile and all its versions.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::ProfileNotFound`] or
    /// [`DatError::ProfilePermission`] for system profiles.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut versions = self.versions.write();
        let system = versions
            .get(name)
            .ok_or_else(|| DatError::ProfileNotFound(name.to_string()))?
            .iter()
            .any(|p| p.system);
        if system {
            return Err(DatError::ProfilePermission {
                profile: name.to_string(),
                action: "deleted".to_string(),
            });
        }
        versions.remove(name);
        if let Some(dir) = &self.dir {
            let path = dir.join(sanitize_component(name));
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(|e| DatError::io(&path, e))?;
            }
        }
        info!(profile = name, "Profile deleted");
        Ok(())
    }

    /// Extracts every table of `profile` from a sample file and compares the
    /// columns produced with the columns the table declares.
    ///
    /// Context values are the profile defaults. Tables without declared
    /// columns report every extracted column as matched.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter handles the file or it cannot be read.
    pub fn validate_against_sample(
        &self,
        profile: &Profile,
        path: &Path,
        adapters: &AdapterRegistry,
    ) -> Result<SampleMatch> {
        let adapter = adapters.get_adapter_for_file(path)?;
        let document = adapter.read_document(path)?;
        let context = ContextExtractor::new(&profile.name, &profile.context)?
            .defaults(&path.to_string_lossy());

        let tables = profile
            .tables
            .iter()
            .map(|table| {
                let mut result = TableMatch {
                    table_id: table.id.clone(),
                    ..TableMatch::default()
                };
                // Compare raw strategy output; stable columns would reindex it.
                let mut raw = table.clone();
                raw.stable_columns = None;
                match extract_table(&raw, &document, &context) {
                    Ok(extracted) => {
                        let actual = extracted.column_set;
                        let expected = table.known_columns().unwrap_or_else(|| actual.clone());
                        for column in &expected {
                            if actual.contains(column) {
                                result.matched.push(column.clone());
                            } else {
                                result.missing.push(column.clone());
                            }
                        }
                        result.extra = actual.into_iter().filter(|c| !expected.contains(c)).collect();
                    }
                    Err(e) => result.error = Some(e.to_string()),
                }
                result
            })
            .collect();
        Ok(SampleMatch { tables })
    }

    fn persist(&self, entry: &PublishedProfile) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let folder = dir.join(sanitize_component(&entry.profile.name));
        std::fs::create_dir_all(&folder).map_err(|e| DatError::io(&folder, e))?;
        let path = folder.join(format!("v{}.json", entry.profile.version));
        let text = serde_json::to_string_pretty(entry.profile.as_ref())?;
        std::fs::write(&path, text).map_err(|e| DatError::io(&path, e))
    }
}

fn published(profile: Profile, system: bool) -> PublishedProfile {
    PublishedProfile {
        profile_id: profile.profile_id(),
        profile: Arc::new(profile),
        system,
    }
}
