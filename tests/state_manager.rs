//! End-to-end tests of the state manager against a temporary directory.
//!
//! ryzenadj is scripted through `FakeRunner`. Hook scripts are really run
//! by `sh` with a stub `systemctl` on PATH, so hook files land under the
//! temporary root and detection reads them back.

use ryzenctl::engine::{Engine, Outcome, Reading};
use ryzenctl::error::Error;
use ryzenctl::executor::{FakeRunner, Invocation, ProcessOutput};
use ryzenctl::integration::{
    DetectedHook, Discrepancy, HookCommand, HookKind, HookPaths, HookState, SystemHooks,
};
use ryzenctl::job::{CancelToken, spawn_job};
use ryzenctl::profile::{ProfileValue, ProfileValues};
use ryzenctl::state::{ManagerOptions, PersistedState, StateManager};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use tempfile::TempDir;

type Manager = StateManager<Arc<FakeRunner>>;

const INFO: &str = "\
|        Name         |   Value   |     Parameter      |
|---------------------|-----------|--------------------|
| STAPM LIMIT         |    25.000 | stapm-limit        |
| PPT LIMIT FAST      |    35.000 | fast-limit         |
| THM LIMIT CORE      |    95.000 | tctl-temp          |
| CCLK Boost SETPOINT |    50.000 | cclk-setpoint      |
";

struct Rig {
    dir: TempDir,
    runner: Arc<FakeRunner>,
}

impl Rig {
    /// `ryzenadj` answers every parameter with `apply` and `--info` with INFO.
    fn new(apply: impl Fn(&Invocation) -> ProcessOutput + Send + Sync + 'static) -> Self {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let systemctl = bin.join("systemctl");
        std::fs::write(&systemctl, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&systemctl, std::fs::Permissions::from_mode(0o755)).unwrap();

        let search_path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string())
        );
        let unit = HookPaths::under(&dir.path().join("hooks")).service_unit;

        let runner = Arc::new(FakeRunner::with_handler(move |inv| match inv.program.as_str() {
            "ryzenadj" if inv.args == ["--info"] => Ok(ProcessOutput::success(INFO)),
            "ryzenadj" => Ok(apply(inv)),
            "systemctl" if inv.args.first().map(String::as_str) == Some("is-enabled") => {
                if unit.exists() {
                    Ok(ProcessOutput::success("enabled\n"))
                } else {
                    Ok(ProcessOutput::failure(1, "disabled"))
                }
            }
            "sh" => {
                let out = std::process::Command::new("sh")
                    .args(&inv.args)
                    .env("PATH", &search_path)
                    .output()
                    .unwrap();
                Ok(ProcessOutput {
                    code: out.status.code(),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                    timed_out: false,
                })
            }
            _ => Ok(ProcessOutput::success("")),
        }));
        Self { dir, runner }
    }

    fn ok() -> Self {
        Self::new(|_| ProcessOutput::success(""))
    }

    fn state_file(&self) -> PathBuf {
        self.dir.path().join("config").join("state.json")
    }

    fn paths(&self) -> HookPaths {
        HookPaths::under(&self.dir.path().join("hooks"))
    }

    fn open_with(&self, auto_sync: bool) -> Manager {
        StateManager::open(
            self.state_file(),
            Engine::new(Arc::clone(&self.runner), "ryzenadj"),
            Box::new(SystemHooks::new(
                Arc::clone(&self.runner),
                self.paths(),
                HookCommand::new("/usr/bin/ryzenctl", self.state_file()),
            )),
            ManagerOptions { auto_sync },
        )
        .unwrap()
    }

    fn open(&self) -> Manager {
        self.open_with(true)
    }

    fn ryzenadj_calls(&self) -> Vec<Invocation> {
        self.runner
            .calls()
            .into_iter()
            .filter(|c| c.program == "ryzenadj")
            .collect()
    }
}

fn values(entries: &[(&str, u32, bool)]) -> ProfileValues {
    entries
        .iter()
        .map(|(id, v, on)| {
            let pv = if *on {
                ProfileValue::enabled(*v)
            } else {
                ProfileValue::disabled(*v)
            };
            (id.to_string(), pv)
        })
        .collect()
}

fn quiet() -> ProfileValues {
    values(&[("stapm_limit", 15_000, true), ("fast_limit", 20_000, false)])
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[test]
fn test_save_then_load_survives_reopen() {
    let rig = Rig::ok();
    let names = ["quiet", "Turbo 35W", "évé", "a.b/c"];
    {
        let manager = rig.open();
        for name in names {
            manager.save_profile(name, quiet(), false).unwrap();
        }
        manager.close().unwrap();
    }
    let manager = rig.open();
    for name in names {
        assert_eq!(manager.load_profile(name).unwrap().values, quiet());
    }
    let mut sorted: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    sorted.sort();
    assert_eq!(manager.list(), sorted);
}

#[test]
fn test_reserved_name_is_rejected() {
    let rig = Rig::ok();
    let manager = rig.open();
    assert!(matches!(
        manager.save_profile("Initial Default", quiet(), false),
        Err(Error::InvalidName { .. })
    ));
    assert!(manager.list().is_empty());
}

#[test]
fn test_capture_twice_keeps_first_snapshot() {
    let rig = Rig::ok();
    let manager = rig.open();

    let snapshot = manager.capture_initial_default(false).unwrap();
    assert_eq!(snapshot.get("stapm_limit"), Some(Reading::Value(25_000)));
    let first = manager.snapshot().store.initial_default.unwrap();

    assert!(matches!(
        manager.capture_initial_default(false),
        Err(Error::AlreadyCaptured)
    ));
    assert_eq!(manager.snapshot().store.initial_default.unwrap(), first);
    assert!(manager.list().is_empty());

    manager.capture_initial_default(true).unwrap();
    assert!(manager.snapshot().store.initial_default.is_some());
}

#[test]
fn test_snapshot_marks_unreported_parameters_unsupported() {
    let rig = Rig::ok();
    let manager = rig.open();

    let snapshot = manager.read_hardware().unwrap();

    assert_eq!(snapshot.get("stapm_limit"), Some(Reading::Value(25_000)));
    assert_eq!(snapshot.get("fast_limit"), Some(Reading::Value(35_000)));
    assert_eq!(snapshot.get("tctl_temp"), Some(Reading::Value(95)));
    assert_eq!(snapshot.get("vrm_current"), Some(Reading::Unsupported));
    assert!(snapshot.get("cclk_setpoint").is_none());
    assert_eq!(snapshot.supported_count(), 3);
}

#[test]
fn test_quiet_profile_sends_only_enabled_parameter() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();

    let activation = manager.activate("quiet", &CancelToken::new()).unwrap();

    let calls = rig.ryzenadj_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args, vec!["--stapm-limit", "15000"]);
    assert!(calls[0].privileged);
    assert_eq!(activation.report.outcomes.len(), 1);
    assert_eq!(
        activation.report.outcome("stapm_limit"),
        Some(&Outcome::Applied)
    );
    assert!(activation.report.outcome("fast_limit").is_none());
    assert_eq!(manager.active_profile().as_deref(), Some("quiet"));
}

#[test]
fn test_nothing_enabled_makes_no_invocations() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager
        .save_profile("off", values(&[("stapm_limit", 15_000, false)]), false)
        .unwrap();

    assert!(matches!(
        manager.activate("off", &CancelToken::new()),
        Err(Error::NothingToApply)
    ));
    assert_eq!(rig.runner.call_count(), 0);
    assert_eq!(manager.active_profile(), None);
}

#[test]
fn test_delete_active_profile_disables_its_hooks() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.save_profile("turbo", quiet(), false).unwrap();
    manager.activate("quiet", &CancelToken::new()).unwrap();
    manager.enable_hook(HookKind::Resume, "quiet").unwrap();
    manager.enable_hook(HookKind::Autostart, "quiet").unwrap();
    manager.enable_hook(HookKind::Boot, "turbo").unwrap();
    let paths = rig.paths();
    assert!(read(&paths.sleep_hook).contains("apply --no-sync 'quiet'"));
    assert!(paths.autostart_entry.exists());

    let deletion = manager.delete_profile("quiet").unwrap();

    assert!(deletion.hook_failures.is_empty());
    assert_eq!(deletion.released, vec![HookKind::Resume, HookKind::Autostart]);
    assert_eq!(manager.active_profile(), None);
    let integration = manager.integration();
    assert_eq!(integration.resume, HookState::Disabled);
    assert_eq!(integration.autostart, HookState::Disabled);
    assert_eq!(integration.boot, HookState::Enabled("turbo".into()));
    assert!(!paths.sleep_hook.exists());
    assert!(!paths.autostart_entry.exists());
    assert!(paths.service_unit.exists());

    drop(manager);
    let reopened = PersistedState::load(&rig.state_file()).unwrap();
    assert_eq!(reopened.store.active_profile, None);
    assert_eq!(reopened.integration.resume, HookState::Disabled);
}

#[test]
fn test_persistence_round_trip() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.capture_initial_default(false).unwrap();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager
        .save_profile(
            "turbo",
            values(&[("stapm_limit", 35_000, true), ("max_performance", 1, true)]),
            false,
        )
        .unwrap();
    manager.activate("turbo", &CancelToken::new()).unwrap();
    manager.enable_hook(HookKind::Resume, "turbo").unwrap();
    let before = manager.snapshot();
    manager.close().unwrap();

    let fresh = rig.open();
    assert_eq!(fresh.snapshot(), before);
}

#[test]
fn test_failed_write_leaves_memory_and_disk_unchanged() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    let on_disk = read(&rig.state_file());

    // Swap the state directory for a plain file so nothing can be written.
    let config_dir = rig.state_file().parent().unwrap().to_path_buf();
    let moved = rig.dir.path().join("moved");
    std::fs::rename(&config_dir, &moved).unwrap();
    std::fs::write(&config_dir, "not a directory").unwrap();

    let err = manager.save_profile("turbo", quiet(), false).unwrap_err();
    assert!(matches!(err, Error::Persistence { .. }));
    assert_eq!(manager.list(), vec!["quiet"]);
    assert!(matches!(
        manager.delete_profile("quiet"),
        Err(Error::Persistence { .. })
    ));
    assert_eq!(manager.list(), vec!["quiet"]);
    assert_eq!(read(&moved.join("state.json")), on_disk);
}

/// Replace the state directory with a plain file so every write fails.
fn break_state_dir(rig: &Rig) {
    let config_dir = rig.state_file().parent().unwrap().to_path_buf();
    std::fs::rename(&config_dir, rig.dir.path().join("moved")).unwrap();
    std::fs::write(&config_dir, "not a directory").unwrap();
}

#[test]
fn test_failed_write_undoes_hook_install() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    break_state_dir(&rig);

    let err = manager.enable_hook(HookKind::Autostart, "quiet").unwrap_err();

    assert!(matches!(err, Error::Persistence { .. }));
    assert_eq!(manager.integration().autostart, HookState::Disabled);
    assert!(!rig.paths().autostart_entry.exists());
}

#[test]
fn test_failed_write_undoes_hook_removal() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.enable_hook(HookKind::Resume, "quiet").unwrap();
    break_state_dir(&rig);

    assert!(manager.disable_hook(HookKind::Resume).is_err());
    assert!(manager.delete_profile("quiet").is_err());

    assert_eq!(
        manager.integration().resume,
        HookState::Enabled("quiet".into())
    );
    assert!(read(&rig.paths().sleep_hook).contains("apply --no-sync 'quiet'"));
}

#[test]
fn test_hooks_name_the_state_file() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.enable_hook(HookKind::Resume, "quiet").unwrap();
    manager.enable_hook(HookKind::Boot, "quiet").unwrap();

    let state_file = rig.state_file().display().to_string();
    let paths = rig.paths();
    assert!(read(&paths.sleep_hook).contains(&format!("--state-file '{}'", state_file)));
    assert!(read(&paths.service_unit).contains(&format!("RYZENCTL_STATE={}", state_file)));
}

#[test]
fn test_zero_mode_flag_is_saved_but_not_sent() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager
        .save_profile(
            "turbo",
            values(&[
                ("stapm_limit", 35_000, true),
                ("power_saving", 0, true),
                ("max_performance", 1, true),
            ]),
            false,
        )
        .unwrap();

    manager.activate("turbo", &CancelToken::new()).unwrap();

    let args: Vec<Vec<String>> = rig.ryzenadj_calls().into_iter().map(|c| c.args).collect();
    assert_eq!(
        args,
        vec![
            vec!["--stapm-limit".to_string(), "35000".to_string()],
            vec!["--max-performance".to_string()],
        ]
    );
}

#[test]
fn test_auto_sync_rebinds_hooks_after_successful_apply() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.save_profile("turbo", quiet(), false).unwrap();
    manager.enable_hook(HookKind::Resume, "quiet").unwrap();
    manager.enable_hook(HookKind::Autostart, "quiet").unwrap();

    let activation = manager.activate("turbo", &CancelToken::new()).unwrap();

    assert_eq!(activation.rebound, vec![HookKind::Resume, HookKind::Autostart]);
    assert!(activation.sync_error.is_none());
    let integration = manager.integration();
    assert_eq!(integration.resume, HookState::Enabled("turbo".into()));
    assert_eq!(integration.autostart, HookState::Enabled("turbo".into()));
    assert_eq!(integration.boot, HookState::Disabled);
    assert!(read(&rig.paths().sleep_hook).contains("apply --no-sync 'turbo'"));
}

#[test]
fn test_auto_sync_off_leaves_hooks_alone() {
    let rig = Rig::ok();
    let manager = rig.open_with(false);
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.save_profile("turbo", quiet(), false).unwrap();
    manager.enable_hook(HookKind::Autostart, "quiet").unwrap();

    let activation = manager.activate("turbo", &CancelToken::new()).unwrap();

    assert!(activation.rebound.is_empty());
    assert_eq!(manager.active_profile().as_deref(), Some("turbo"));
    assert_eq!(
        manager.integration().autostart,
        HookState::Enabled("quiet".into())
    );
}

#[test]
fn test_failed_apply_changes_nothing() {
    let rig = Rig::new(|inv| {
        if inv.args[0] == "--tctl-temp" {
            ProcessOutput::failure(1, "Failed to set tctl_temp")
        } else {
            ProcessOutput::success("")
        }
    });
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager
        .save_profile(
            "hot",
            values(&[("stapm_limit", 30_000, true), ("tctl_temp", 100, true)]),
            false,
        )
        .unwrap();
    manager.activate("quiet", &CancelToken::new()).unwrap();
    manager.enable_hook(HookKind::Autostart, "quiet").unwrap();

    let activation = manager.activate("hot", &CancelToken::new()).unwrap();

    assert_eq!(activation.report.applied(), 1);
    assert_eq!(activation.report.failed(), 1);
    assert!(activation.rebound.is_empty());
    assert_eq!(manager.active_profile().as_deref(), Some("quiet"));
    assert_eq!(
        manager.integration().autostart,
        HookState::Enabled("quiet".into())
    );
}

#[test]
fn test_unsupported_parameter_still_counts_as_success() {
    let rig = Rig::new(|inv| {
        if inv.args[0] == "--vrm-current" {
            ProcessOutput::failure(255, "set_vrm_current is not supported on this family")
        } else {
            ProcessOutput::success("")
        }
    });
    let manager = rig.open();
    manager
        .save_profile(
            "mixed",
            values(&[("stapm_limit", 30_000, true), ("vrm_current", 90, true)]),
            false,
        )
        .unwrap();

    let activation = manager.activate("mixed", &CancelToken::new()).unwrap();

    assert!(matches!(
        activation.report.outcome("vrm_current"),
        Some(Outcome::Unsupported(_))
    ));
    assert!(activation.report.is_success());
    assert_eq!(manager.active_profile().as_deref(), Some("mixed"));
}

#[test]
fn test_timeout_is_a_failure() {
    let rig = Rig::new(|_| ProcessOutput::timeout());
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();

    let activation = manager.activate("quiet", &CancelToken::new()).unwrap();

    assert!(matches!(
        activation.report.outcome("stapm_limit"),
        Some(Outcome::Failed(_))
    ));
    assert_eq!(manager.active_profile(), None);
}

#[test]
fn test_cancel_before_worker_runs_skips_everything() {
    let rig = Rig::ok();
    let manager = Arc::new(rig.open());
    manager
        .save_profile(
            "turbo",
            values(&[("stapm_limit", 35_000, true), ("fast_limit", 45_000, true)]),
            false,
        )
        .unwrap();

    let (go_tx, go_rx) = mpsc::channel::<()>();
    let worker = Arc::clone(&manager);
    let job = spawn_job(move |cancel| {
        go_rx.recv().unwrap();
        worker.activate("turbo", &cancel)
    });
    job.cancel_token().cancel();
    go_tx.send(()).unwrap();
    let activation = job.wait().unwrap().unwrap();

    assert!(activation.report.cancelled);
    assert_eq!(activation.report.skipped(), 2);
    assert!(rig.ryzenadj_calls().is_empty());
    assert_eq!(manager.active_profile(), None);
}

#[test]
fn test_reset_applies_captured_default() {
    let rig = Rig::ok();
    let manager = rig.open();
    assert!(matches!(
        manager.reset_to_default(&CancelToken::new()),
        Err(Error::NoDefaultCaptured)
    ));

    manager.capture_initial_default(false).unwrap();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.activate("quiet", &CancelToken::new()).unwrap();
    rig.runner.clear();

    let report = manager.reset_to_default(&CancelToken::new()).unwrap();

    assert_eq!(report.applied(), 3);
    let args: Vec<Vec<String>> = rig.ryzenadj_calls().into_iter().map(|c| c.args).collect();
    assert_eq!(
        args,
        vec![
            vec!["--stapm-limit".to_string(), "25000".to_string()],
            vec!["--fast-limit".to_string(), "35000".to_string()],
            vec!["--tctl-temp".to_string(), "95".to_string()],
        ]
    );
    assert_eq!(manager.active_profile(), None);
}

#[test]
fn test_detection_reports_drift_without_fixing_it() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.enable_hook(HookKind::Autostart, "quiet").unwrap();
    manager.enable_hook(HookKind::Resume, "quiet").unwrap();
    let paths = rig.paths();

    std::fs::remove_file(&paths.autostart_entry).unwrap();
    std::fs::create_dir_all(paths.service_unit.parent().unwrap()).unwrap();
    std::fs::write(
        &paths.service_unit,
        "# Managed by ryzenctl, profile=gaming\n[Service]\n",
    )
    .unwrap();
    let before = manager.snapshot();

    let report = manager.hook_report();

    assert!(report.discrepancies.contains(&Discrepancy::Missing {
        hook: HookKind::Autostart,
        recorded: "quiet".into(),
    }));
    assert!(report.discrepancies.iter().any(|d| matches!(
        d,
        Discrepancy::Unrecorded { hook: HookKind::Boot, installed: Some(p) } if p == "gaming"
    )));
    assert!(report.detected.contains(&(
        HookKind::Resume,
        DetectedHook::Installed {
            profile: Some("quiet".into())
        }
    )));
    assert_eq!(manager.snapshot(), before);
}

#[test]
fn test_disable_hook_is_idempotent() {
    let rig = Rig::ok();
    let manager = rig.open();
    manager.save_profile("quiet", quiet(), false).unwrap();
    manager.enable_hook(HookKind::Resume, "quiet").unwrap();

    manager.disable_hook(HookKind::Resume).unwrap();
    manager.disable_hook(HookKind::Resume).unwrap();

    assert_eq!(manager.integration().resume, HookState::Disabled);
    assert!(!rig.paths().sleep_hook.exists());
}

#[test]
fn test_enable_hook_for_missing_profile() {
    let rig = Rig::ok();
    let manager = rig.open();
    assert!(matches!(
        manager.enable_hook(HookKind::Boot, "ghost"),
        Err(Error::NotFound(_))
    ));
    assert!(!rig.paths().service_unit.exists());
}

#[test]
fn test_export_then_import_into_fresh_store() {
    let rig = Rig::ok();
    let export = rig.dir.path().join("profiles.json");
    {
        let manager = rig.open();
        manager.capture_initial_default(false).unwrap();
        manager.save_profile("quiet", quiet(), false).unwrap();
        manager
            .save_profile("turbo", values(&[("stapm_limit", 35_000, true)]), false)
            .unwrap();
        assert_eq!(manager.export(&export).unwrap(), 2);
    }
    let exported: serde_json::Value = serde_json::from_str(&read(&export)).unwrap();
    assert!(exported["profiles"]["quiet"].is_object());
    assert!(exported["profiles"].get("Initial Default").is_none());

    let other = Rig::ok();
    let manager = other.open();
    manager
        .save_profile("turbo", values(&[("stapm_limit", 1_000, true)]), false)
        .unwrap();
    assert_eq!(manager.import(&export).unwrap(), 2);
    assert_eq!(manager.list(), vec!["quiet", "turbo"]);
    assert_eq!(
        manager.load_profile("turbo").unwrap().values["stapm_limit"].value,
        35_000
    );
}

#[test]
fn test_import_rejects_files_without_valid_profiles() {
    let rig = Rig::ok();
    let manager = rig.open();
    let path = rig.dir.path().join("bad.json");

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(manager.import(&path), Err(Error::InvalidImport(_))));

    std::fs::write(
        &path,
        r#"{"profiles": {
            "Initial Default": {"createdAt": "x", "values": {}},
            "broken": {"values": 5},
            "too hot": {"createdAt": "x", "values": {"tctl_temp": {"value": 500, "enabled": true}}}
        }}"#,
    )
    .unwrap();
    assert!(matches!(manager.import(&path), Err(Error::InvalidImport(_))));
    assert!(manager.list().is_empty());
}
