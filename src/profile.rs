//! Named tuning profiles and the hidden initial-default snapshot.
//!
//! Everything here is pure state manipulation; persistence and locking live
//! in [`crate::state`].

use crate::catalog::{self, MAX_PERFORMANCE, POWER_SAVING};
use crate::error::{Error, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved name of the hidden snapshot captured from untouched hardware.
pub const INITIAL_DEFAULT: &str = "Initial Default";

/// Target value for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileValue {
    pub value: u32,
    /// Only enabled values are sent to ryzenadj.
    pub enabled: bool,
}

impl ProfileValue {
    pub fn enabled(value: u32) -> Self {
        Self {
            value,
            enabled: true,
        }
    }

    pub fn disabled(value: u32) -> Self {
        Self {
            value,
            enabled: false,
        }
    }
}

/// Parameter id -> target value.
pub type ProfileValues = BTreeMap<String, ProfileValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub created_at: String,
    pub values: ProfileValues,
}

impl Profile {
    pub fn new(values: ProfileValues) -> Self {
        Self {
            created_at: chrono::Utc::now().to_rfc3339(),
            values,
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.values.values().filter(|v| v.enabled).count()
    }

    /// Ids this profile carries that the current catalog no longer knows.
    pub fn stale_parameters(&self) -> Vec<String> {
        self.values
            .keys()
            .filter(|id| catalog::find(id).is_none())
            .cloned()
            .collect()
    }
}

/// All profiles plus the hidden default and the active selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileStore {
    pub profiles: BTreeMap<String, Profile>,
    pub initial_default: Option<Profile>,
    pub active_profile: Option<String>,
}

/// Trim and check a user-supplied profile name.
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_name(name, "name must not be empty"));
    }
    if trimmed == INITIAL_DEFAULT {
        return Err(Error::invalid_name(
            name,
            "reserved for the captured initial default",
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(Error::invalid_name(name, "control characters are not allowed"));
    }
    Ok(trimmed)
}

/// Check every value against the catalog. Unknown ids are rejected here;
/// they only survive when they come from an older state file.
pub fn validate_values(values: &ProfileValues) -> Result<()> {
    for (id, pv) in values {
        let spec = catalog::find(id).ok_or_else(|| Error::InvalidValue {
            parameter: id.clone(),
            detail: "unknown parameter".to_string(),
        })?;
        spec.validate(pv.value)?;
    }

    let mode_on = |id: &str| {
        values
            .get(id)
            .zip(catalog::find(id))
            .is_some_and(|(v, spec)| v.enabled && spec.is_sent(v.value))
    };
    if mode_on(POWER_SAVING) && mode_on(MAX_PERFORMANCE) {
        return Err(Error::InvalidValue {
            parameter: format!("{}/{}", POWER_SAVING, MAX_PERFORMANCE),
            detail: "power-saving and max-performance are mutually exclusive".to_string(),
        });
    }
    Ok(())
}

impl ProfileStore {
    /// Insert or (with `overwrite`) replace a profile. An overwritten profile
    /// keeps its first creation time.
    pub fn save(&mut self, name: &str, values: ProfileValues, overwrite: bool) -> Result<()> {
        let name = validate_name(name)?;
        validate_values(&values)?;

        match self.profiles.get_mut(name) {
            Some(_) if !overwrite => Err(Error::invalid_name(name, "a profile with this name exists")),
            Some(existing) => {
                existing.values = values;
                Ok(())
            }
            None => {
                self.profiles.insert(name.to_string(), Profile::new(values));
                Ok(())
            }
        }
    }

    pub fn load(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name.trim())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Remove a profile, clearing the active selection if it pointed here.
    /// Integration hooks are handled by the caller.
    pub fn delete(&mut self, name: &str) -> Result<Profile> {
        let name = name.trim();
        let removed = self
            .profiles
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if self.active_profile.as_deref() == Some(name) {
            self.active_profile = None;
        }
        Ok(removed)
    }

    /// Visible profile names in sorted order; never includes the default.
    pub fn list(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        self.active_profile = Some(name.to_string());
        Ok(())
    }

    pub fn clear_active(&mut self) {
        self.active_profile = None;
    }

    pub fn has_initial_default(&self) -> bool {
        self.initial_default.is_some()
    }

    pub fn capture_initial_default(&mut self, values: ProfileValues, force: bool) -> Result<()> {
        if self.initial_default.is_some() && !force {
            return Err(Error::AlreadyCaptured);
        }
        self.initial_default = Some(Profile::new(values));
        Ok(())
    }

    pub fn reset_to_default(&self) -> Result<&Profile> {
        self.initial_default.as_ref().ok_or(Error::NoDefaultCaptured)
    }

    /// Merge imported profiles. Entries with a reserved or invalid name, or
    /// values the catalog rejects, are skipped. Names that trim to the same
    /// profile count once; the last one wins. Returns the number merged.
    pub fn merge(&mut self, imported: BTreeMap<String, Profile>) -> Result<usize> {
        let mut accepted: BTreeMap<String, Profile> = BTreeMap::new();
        for (name, profile) in imported {
            let clean = match validate_name(&name) {
                Ok(clean) => clean.to_string(),
                Err(e) => {
                    warn!("skipping imported profile: {}", e);
                    continue;
                }
            };
            if let Err(e) = validate_values(&profile.values) {
                warn!("skipping imported profile '{}': {}", clean, e);
                continue;
            }
            if accepted.insert(clean.clone(), profile).is_some() {
                warn!("imported profile '{}' appears more than once, keeping the last", clean);
            }
        }

        if accepted.is_empty() {
            return Err(Error::InvalidImport(
                "no valid profiles were found".to_string(),
            ));
        }

        let count = accepted.len();
        self.profiles.extend(accepted);
        Ok(count)
    }

    /// Repair a store read from disk: move a legacy default stored as a
    /// regular profile into the hidden slot and drop a dangling selection.
    pub fn normalize(&mut self) {
        if let Some(legacy) = self.profiles.remove(INITIAL_DEFAULT) {
            if self.initial_default.is_none() {
                self.initial_default = Some(legacy);
            } else {
                warn!("dropping duplicate '{}' profile", INITIAL_DEFAULT);
            }
        }
        if let Some(active) = &self.active_profile
            && !self.profiles.contains_key(active)
        {
            warn!("active profile '{}' no longer exists, clearing it", active);
            self.active_profile = None;
        }
    }
}
