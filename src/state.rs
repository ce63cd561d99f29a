//! The state manager: profiles, the active selection and hook bindings,
//! kept in one JSON file and guarded by one lock.
//!
//! Every mutation works on a copy. The copy is written to disk first and
//! only replaces the in-memory state once the write succeeded, so a failed
//! write leaves both memory and disk as they were.

use crate::engine::{ApplyReport, Engine, HardwareSnapshot, InfoReading, Telemetry};
use crate::error::{Error, Result};
use crate::executor::ProcessRunner;
use crate::integration::{
    self, DetectedHook, Discrepancy, HookBackend, HookKind, IntegrationState,
};
use crate::job::CancelToken;
use crate::profile::{Profile, ProfileStore, ProfileValues};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Everything written to the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(flatten)]
    pub store: ProfileStore,
    #[serde(default)]
    pub integration: IntegrationState,
}

impl PersistedState {
    /// A missing file is an empty state. Anything unreadable is an error so a
    /// damaged file is never silently overwritten.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state file at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::persistence(path, format!("failed to read: {}", e))),
        };
        let mut state: Self = serde_json::from_str(&data)
            .map_err(|e| Error::persistence(path, format!("failed to parse: {}", e)))?;
        state.store.normalize();
        state.drop_dangling_bindings();
        Ok(state)
    }

    /// Write via a temporary file in the same directory, then rename over
    /// the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::persistence(path, format!("failed to create directory: {}", e)))?;
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| Error::persistence(path, format!("failed to serialize: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::persistence(path, format!("failed to create temp file: {}", e)))?;
        tmp.write_all(data.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::persistence(path, format!("failed to write: {}", e)))?;
        keep_ownership(tmp.path(), path, parent);
        tmp.persist(path)
            .map_err(|e| Error::persistence(path, format!("failed to replace: {}", e.error)))?;
        debug!("state written to {}", path.display());
        Ok(())
    }

    /// Recorded bindings to profiles that no longer exist read as disabled.
    /// The OS hook itself is left alone; detection reports it.
    fn drop_dangling_bindings(&mut self) {
        for kind in HookKind::ALL {
            if let Some(profile) = self.integration.get(kind).profile()
                && !self.store.contains(profile)
            {
                warn!(
                    "{} hook bound to missing profile '{}', marking it disabled",
                    kind, profile
                );
                self.integration.forget(kind);
            }
        }
    }
}

/// Give the replacement file the mode and owner of the file it replaces.
/// A new file takes the owner of its directory. Ownership only changes when
/// running as root.
fn keep_ownership(tmp: &Path, target: &Path, parent: &Path) {
    let existing = std::fs::metadata(target).ok();
    if let Some(meta) = &existing
        && let Err(e) = std::fs::set_permissions(tmp, meta.permissions())
    {
        warn!("could not copy permissions of {}: {}", target.display(), e);
    }

    if !nix::unistd::geteuid().is_root() {
        return;
    }
    let Some(owner) = existing.or_else(|| std::fs::metadata(parent).ok()) else {
        return;
    };
    if owner.uid() == 0 && owner.gid() == 0 {
        return;
    }
    let uid = nix::unistd::Uid::from_raw(owner.uid());
    let gid = nix::unistd::Gid::from_raw(owner.gid());
    if let Err(e) = nix::unistd::chown(tmp, Some(uid), Some(gid)) {
        warn!("could not hand {} back to uid {}: {}", target.display(), owner.uid(), e);
    }
}

/// Shape of import/export files.
#[derive(Debug, Serialize, Deserialize)]
struct ExchangeFile<P> {
    profiles: BTreeMap<String, P>,
}

/// Result of a successful or partial apply through the manager.
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub profile: String,
    pub report: ApplyReport,
    /// Hooks rebound to this profile by auto-sync.
    pub rebound: Vec<HookKind>,
    /// Set when auto-sync was attempted and stopped early.
    pub sync_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct Deletion {
    pub released: Vec<HookKind>,
    /// Hooks whose OS files could not be removed. They are disabled in the
    /// state regardless.
    pub hook_failures: Vec<(HookKind, Error)>,
}

/// Recorded bindings next to what the machine reports.
#[derive(Debug, Clone, Serialize)]
pub struct HookReport {
    pub recorded: IntegrationState,
    pub detected: Vec<(HookKind, DetectedHook)>,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub auto_sync: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { auto_sync: true }
    }
}

pub struct StateManager<R> {
    path: PathBuf,
    state: Mutex<PersistedState>,
    engine: Engine<R>,
    hooks: Box<dyn HookBackend>,
    options: ManagerOptions,
}

impl<R: ProcessRunner> StateManager<R> {
    /// Load the state file (or start empty) and take ownership of the
    /// engine and hook backend.
    pub fn open(
        path: impl Into<PathBuf>,
        engine: Engine<R>,
        hooks: Box<dyn HookBackend>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let path = path.into();
        let state = PersistedState::load(&path)?;
        info!(
            "loaded {} profile(s) from {}",
            state.store.profiles.len(),
            path.display()
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
            engine,
            hooks,
            options,
        })
    }

    /// Flush to disk and drop the manager.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn flush(&self) -> Result<()> {
        self.lock().save(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> &Engine<R> {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on a copy of the state, persist the copy, then swap it in.
    ///
    /// Hooks installed or removed by `f` are put back the way they were
    /// when the write fails, so the operation leaves no trace.
    fn mutate<T>(
        &self,
        guard: &mut MutexGuard<'_, PersistedState>,
        f: impl FnOnce(&mut PersistedState) -> Result<T>,
    ) -> Result<T> {
        let mut draft = (**guard).clone();
        let value = f(&mut draft)?;
        if let Err(e) = draft.save(&self.path) {
            self.restore_hooks(&guard.integration, &draft.integration);
            return Err(e);
        }
        **guard = draft;
        Ok(value)
    }

    fn restore_hooks(&self, before: &IntegrationState, after: &IntegrationState) {
        for kind in HookKind::ALL {
            let previous = before.get(kind);
            if previous == after.get(kind) {
                continue;
            }
            let restored = match previous.profile() {
                Some(profile) => self.hooks.install(kind, profile),
                None => self.hooks.remove(kind),
            };
            match restored {
                Ok(()) => info!("{} hook restored after failed write", kind),
                Err(e) => warn!("could not restore {} hook: {}", kind, e),
            }
        }
    }

    /// A copy of the whole state, for display.
    pub fn snapshot(&self) -> PersistedState {
        self.lock().clone()
    }

    pub fn list(&self) -> Vec<String> {
        self.lock()
            .store
            .list()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn load_profile(&self, name: &str) -> Result<Profile> {
        self.lock().store.load(name).cloned()
    }

    pub fn active_profile(&self) -> Option<String> {
        self.lock().store.active_profile.clone()
    }

    pub fn integration(&self) -> IntegrationState {
        self.lock().integration.clone()
    }

    pub fn save_profile(&self, name: &str, values: ProfileValues, overwrite: bool) -> Result<()> {
        let mut guard = self.lock();
        self.mutate(&mut guard, |state| state.store.save(name, values, overwrite))?;
        info!("saved profile '{}'", name.trim());
        Ok(())
    }

    /// Delete a profile. The active selection and every hook bound to it are
    /// cleared in the same write.
    pub fn delete_profile(&self, name: &str) -> Result<Deletion> {
        let name = name.trim();
        let mut guard = self.lock();
        if !guard.store.contains(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        let deletion = self.mutate(&mut guard, |state| {
            state.store.delete(name)?;
            let released = state.integration.bound_to(name);
            let hook_failures = state.integration.release_profile(name, self.hooks.as_ref());
            Ok(Deletion {
                released,
                hook_failures,
            })
        })?;
        info!("deleted profile '{}'", name);
        Ok(deletion)
    }

    pub fn read_hardware(&self) -> Result<HardwareSnapshot> {
        let _guard = self.lock();
        self.engine.read_hardware_snapshot()
    }

    pub fn read_info(&self) -> Result<InfoReading> {
        let _guard = self.lock();
        self.engine.read_info()
    }

    pub fn read_telemetry(&self) -> Result<Telemetry> {
        let _guard = self.lock();
        self.engine.read_telemetry()
    }

    /// Read the hardware and store it as the hidden initial default.
    pub fn capture_initial_default(&self, force: bool) -> Result<HardwareSnapshot> {
        let mut guard = self.lock();
        if guard.store.has_initial_default() && !force {
            return Err(Error::AlreadyCaptured);
        }
        let snapshot = self.engine.read_hardware_snapshot()?;
        self.mutate(&mut guard, |state| {
            state
                .store
                .capture_initial_default(snapshot.to_profile_values(), force)
        })?;
        info!(
            "captured initial default ({} parameters)",
            snapshot.supported_count()
        );
        Ok(snapshot)
    }

    /// Apply a saved profile. Only a fully successful apply makes it the
    /// active profile and, with auto-sync on, rebinds the enabled hooks.
    pub fn activate(&self, name: &str, cancel: &CancelToken) -> Result<Activation> {
        let name = name.trim();
        let mut guard = self.lock();
        let profile = guard.store.load(name)?.clone();
        let report = self.engine.apply(&profile, cancel)?;

        let mut activation = Activation {
            profile: name.to_string(),
            report,
            rebound: Vec::new(),
            sync_error: None,
        };
        if !activation.report.is_success() {
            warn!(
                "profile '{}' not fully applied; active profile unchanged",
                name
            );
            return Ok(activation);
        }

        let auto_sync = self.options.auto_sync;
        let (rebound, sync_error) = self.mutate(&mut guard, |state| {
            state.store.set_active(name)?;
            if !auto_sync {
                return Ok((Vec::new(), None));
            }
            let pending: Vec<HookKind> = state
                .integration
                .enabled_hooks()
                .into_iter()
                .filter(|k| state.integration.get(*k).profile() != Some(name))
                .collect();
            match state
                .integration
                .auto_sync(name, &state.store, self.hooks.as_ref())
            {
                Ok(rebound) => Ok((rebound, None)),
                Err(e) => {
                    warn!("auto-sync stopped: {}", e);
                    let rebound = pending
                        .into_iter()
                        .filter(|k| state.integration.get(*k).profile() == Some(name))
                        .collect();
                    Ok((rebound, Some(e.to_string())))
                }
            }
        })?;
        activation.rebound = rebound;
        activation.sync_error = sync_error;
        info!("profile '{}' is now active", name);
        Ok(activation)
    }

    /// Apply the hidden initial default. On success no named profile is
    /// active any more.
    pub fn reset_to_default(&self, cancel: &CancelToken) -> Result<ApplyReport> {
        let mut guard = self.lock();
        let profile = guard.store.reset_to_default()?.clone();
        let report = self.engine.apply(&profile, cancel)?;
        if report.is_success() && guard.store.active_profile.is_some() {
            self.mutate(&mut guard, |state| {
                state.store.clear_active();
                Ok(())
            })?;
        }
        Ok(report)
    }

    pub fn enable_hook(&self, kind: HookKind, profile: &str) -> Result<()> {
        let profile = profile.trim();
        let mut guard = self.lock();
        self.mutate(&mut guard, |state| {
            state
                .integration
                .enable(kind, profile, &state.store, self.hooks.as_ref())
        })
    }

    pub fn disable_hook(&self, kind: HookKind) -> Result<()> {
        let mut guard = self.lock();
        self.mutate(&mut guard, |state| {
            state.integration.disable(kind, self.hooks.as_ref())
        })
    }

    /// Detect installed hooks and compare with the record. Read-only.
    pub fn hook_report(&self) -> HookReport {
        let guard = self.lock();
        let detected = integration::detect_current_state(self.hooks.as_ref());
        let discrepancies = integration::discrepancies(&guard.integration, &detected, &guard.store);
        HookReport {
            recorded: guard.integration.clone(),
            detected,
            discrepancies,
        }
    }

    /// Write the visible profiles to `path`. Returns how many were written.
    pub fn export(&self, path: &Path) -> Result<usize> {
        let guard = self.lock();
        let file = ExchangeFile {
            profiles: guard.store.profiles.clone(),
        };
        let data = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Other(format!("failed to serialize profiles: {}", e)))?;
        std::fs::write(path, data).map_err(|e| {
            Error::Other(format!("failed to write {}: {}", path.display(), e))
        })?;
        info!("exported {} profile(s) to {}", file.profiles.len(), path.display());
        Ok(file.profiles.len())
    }

    /// Merge profiles from an export file. Same-named profiles are replaced.
    pub fn import(&self, path: &Path) -> Result<usize> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidImport(format!("{}: {}", path.display(), e)))?;
        let file: ExchangeFile<serde_json::Value> = serde_json::from_str(&data)
            .map_err(|e| Error::InvalidImport(format!("{}: {}", path.display(), e)))?;

        let mut parsed = BTreeMap::new();
        for (name, raw) in file.profiles {
            match serde_json::from_value::<Profile>(raw) {
                Ok(profile) => {
                    parsed.insert(name, profile);
                }
                Err(e) => warn!("skipping imported profile '{}': {}", name, e),
            }
        }

        let mut guard = self.lock();
        let count = self.mutate(&mut guard, |state| state.store.merge(parsed))?;
        info!("imported {} profile(s) from {}", count, path.display());
        Ok(count)
    }
}
