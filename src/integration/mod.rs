//! Boot, resume and login hooks that re-apply a profile without a user.
//!
//! [`IntegrationState`] is what the state file records; [`HookBackend`] is
//! what is actually installed on the machine. The two are compared, never
//! silently merged: [`discrepancies`] reports drift for the caller to fix.

pub mod hooks;

use crate::error::{Error, Result};
use crate::profile::ProfileStore;
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub use hooks::{HookCommand, HookPaths, SystemHooks};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Apply once at boot (systemd oneshot unit).
    Boot,
    /// Re-apply after suspend (systemd system-sleep hook).
    Resume,
    /// Apply at graphical login (XDG autostart entry).
    Autostart,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [HookKind::Boot, HookKind::Resume, HookKind::Autostart];
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookKind::Boot => write!(f, "boot"),
            HookKind::Resume => write!(f, "resume"),
            HookKind::Autostart => write!(f, "autostart"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "profile", rename_all = "snake_case")]
pub enum HookState {
    #[default]
    Disabled,
    Enabled(String),
}

impl HookState {
    pub fn profile(&self) -> Option<&str> {
        match self {
            HookState::Disabled => None,
            HookState::Enabled(name) => Some(name),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, HookState::Enabled(_))
    }
}

/// What the OS reports for one hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DetectedHook {
    Absent,
    /// Installed; `profile` is `None` when the hook was not written by us
    /// or its binding could not be read back.
    Installed { profile: Option<String> },
}

/// Hook bindings as recorded in the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "IntegrationFile", into = "IntegrationFile")]
pub struct IntegrationState {
    pub boot: HookState,
    pub resume: HookState,
    pub autostart: HookState,
}

/// On-disk shape of [`IntegrationState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IntegrationFile {
    boot_enabled: bool,
    boot_profile: Option<String>,
    resume_enabled: bool,
    resume_profile: Option<String>,
    autostart_enabled: bool,
    autostart_profile: Option<String>,
}

fn hook_from_file(enabled: bool, profile: Option<String>) -> HookState {
    match (enabled, profile) {
        (true, Some(name)) if !name.is_empty() => HookState::Enabled(name),
        _ => HookState::Disabled,
    }
}

impl From<IntegrationFile> for IntegrationState {
    fn from(file: IntegrationFile) -> Self {
        Self {
            boot: hook_from_file(file.boot_enabled, file.boot_profile),
            resume: hook_from_file(file.resume_enabled, file.resume_profile),
            autostart: hook_from_file(file.autostart_enabled, file.autostart_profile),
        }
    }
}

impl From<IntegrationState> for IntegrationFile {
    fn from(state: IntegrationState) -> Self {
        Self {
            boot_enabled: state.boot.is_enabled(),
            boot_profile: state.boot.profile().map(str::to_string),
            resume_enabled: state.resume.is_enabled(),
            resume_profile: state.resume.profile().map(str::to_string),
            autostart_enabled: state.autostart.is_enabled(),
            autostart_profile: state.autostart.profile().map(str::to_string),
        }
    }
}

/// Installs, removes and detects OS-level hooks.
pub trait HookBackend: Send + Sync {
    fn install(&self, kind: HookKind, profile: &str) -> Result<()>;
    fn remove(&self, kind: HookKind) -> Result<()>;
    fn detect(&self, kind: HookKind) -> Result<DetectedHook>;
}

impl IntegrationState {
    pub fn get(&self, kind: HookKind) -> &HookState {
        match kind {
            HookKind::Boot => &self.boot,
            HookKind::Resume => &self.resume,
            HookKind::Autostart => &self.autostart,
        }
    }

    fn slot(&mut self, kind: HookKind) -> &mut HookState {
        match kind {
            HookKind::Boot => &mut self.boot,
            HookKind::Resume => &mut self.resume,
            HookKind::Autostart => &mut self.autostart,
        }
    }

    pub fn enabled_hooks(&self) -> Vec<HookKind> {
        HookKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_enabled())
            .collect()
    }

    /// Hooks currently bound to `profile`.
    pub fn bound_to(&self, profile: &str) -> Vec<HookKind> {
        HookKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).profile() == Some(profile))
            .collect()
    }

    /// Install the OS hook bound to `profile`. State only changes once the
    /// install succeeded.
    pub fn enable(
        &mut self,
        kind: HookKind,
        profile: &str,
        store: &ProfileStore,
        backend: &dyn HookBackend,
    ) -> Result<()> {
        if !store.contains(profile) {
            return Err(Error::NotFound(profile.to_string()));
        }
        backend.install(kind, profile)?;
        info!("{} hook bound to profile '{}'", kind, profile);
        *self.slot(kind) = HookState::Enabled(profile.to_string());
        Ok(())
    }

    /// Mark a hook disabled without touching the OS.
    pub fn forget(&mut self, kind: HookKind) {
        *self.slot(kind) = HookState::Disabled;
    }

    /// Remove the OS hook. Safe to call when already disabled.
    pub fn disable(&mut self, kind: HookKind, backend: &dyn HookBackend) -> Result<()> {
        backend.remove(kind)?;
        if self.get(kind).is_enabled() {
            info!("{} hook disabled", kind);
        }
        *self.slot(kind) = HookState::Disabled;
        Ok(())
    }

    /// Disable every hook bound to a profile that is going away.
    ///
    /// The recorded state is always cleared so nothing dangles; OS removal
    /// failures are returned for the caller to report.
    pub fn release_profile(
        &mut self,
        profile: &str,
        backend: &dyn HookBackend,
    ) -> Vec<(HookKind, Error)> {
        let mut failures = Vec::new();
        for kind in self.bound_to(profile) {
            if let Err(e) = backend.remove(kind) {
                warn!("failed to remove {} hook for '{}': {}", kind, profile, e);
                failures.push((kind, e));
            }
            *self.slot(kind) = HookState::Disabled;
        }
        failures
    }

    /// Rebind every enabled hook to `new_active` by replaying `enable`.
    /// Returns the hooks that were rebound.
    pub fn auto_sync(
        &mut self,
        new_active: &str,
        store: &ProfileStore,
        backend: &dyn HookBackend,
    ) -> Result<Vec<HookKind>> {
        let mut rebound = Vec::new();
        for kind in self.enabled_hooks() {
            if self.get(kind).profile() == Some(new_active) {
                continue;
            }
            self.enable(kind, new_active, store, backend)?;
            rebound.push(kind);
        }
        Ok(rebound)
    }
}

/// Detect what is installed right now. Detection errors read as `Absent`.
pub fn detect_current_state(backend: &dyn HookBackend) -> Vec<(HookKind, DetectedHook)> {
    HookKind::ALL
        .into_iter()
        .map(|kind| {
            let detected = backend.detect(kind).unwrap_or_else(|e| {
                warn!("could not inspect {} hook: {}", kind, e);
                DetectedHook::Absent
            });
            (kind, detected)
        })
        .collect()
}

/// A mismatch between the recorded bindings and the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Recorded as enabled, but nothing is installed.
    Missing { hook: HookKind, recorded: String },
    /// Installed, but the state file says disabled.
    Unrecorded {
        hook: HookKind,
        installed: Option<String>,
    },
    /// Installed and recorded, bound to different profiles.
    Mismatch {
        hook: HookKind,
        recorded: String,
        installed: Option<String>,
    },
    /// Installed hook points at a profile that does not exist.
    UnknownProfile { hook: HookKind, profile: String },
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let or_unknown = |p: &Option<String>| p.clone().unwrap_or_else(|| "unknown".into());
        match self {
            Discrepancy::Missing { hook, recorded } => write!(
                f,
                "{} hook recorded for '{}' but not installed",
                hook, recorded
            ),
            Discrepancy::Unrecorded { hook, installed } => write!(
                f,
                "{} hook installed (profile: {}) but not recorded",
                hook,
                or_unknown(installed)
            ),
            Discrepancy::Mismatch {
                hook,
                recorded,
                installed,
            } => write!(
                f,
                "{} hook recorded for '{}' but installed for '{}'",
                hook,
                recorded,
                or_unknown(installed)
            ),
            Discrepancy::UnknownProfile { hook, profile } => write!(
                f,
                "{} hook installed for missing profile '{}'",
                hook, profile
            ),
        }
    }
}

pub fn discrepancies(
    recorded: &IntegrationState,
    detected: &[(HookKind, DetectedHook)],
    store: &ProfileStore,
) -> Vec<Discrepancy> {
    let mut found = Vec::new();
    for (kind, detected) in detected {
        let hook = *kind;
        match (recorded.get(hook), detected) {
            (HookState::Disabled, DetectedHook::Absent) => {}
            (HookState::Enabled(name), DetectedHook::Absent) => found.push(Discrepancy::Missing {
                hook,
                recorded: name.clone(),
            }),
            (HookState::Disabled, DetectedHook::Installed { profile }) => {
                found.push(Discrepancy::Unrecorded {
                    hook,
                    installed: profile.clone(),
                })
            }
            (HookState::Enabled(name), DetectedHook::Installed { profile }) => {
                if profile.as_deref() != Some(name.as_str()) {
                    found.push(Discrepancy::Mismatch {
                        hook,
                        recorded: name.clone(),
                        installed: profile.clone(),
                    });
                }
            }
        }

        if let DetectedHook::Installed {
            profile: Some(profile),
        } = detected
            && !store.contains(profile)
        {
            found.push(Discrepancy::UnknownProfile {
                hook,
                profile: profile.clone(),
            });
        }
    }
    found
}
