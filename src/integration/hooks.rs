use super::{DetectedHook, HookBackend, HookKind};
use crate::error::{Error, Result};
use crate::executor::{Invocation, ProcessRunner};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

const SERVICE_NAME: &str = "ryzenctl.service";
const SERVICE_PATH: &str = "/etc/systemd/system/ryzenctl.service";
const SLEEP_HOOK_PATH: &str = "/usr/lib/systemd/system-sleep/ryzenctl-resume";
const AUTOSTART_FILE: &str = "ryzenctl.desktop";

/// Every hook file carries this line followed by the bound profile.
const MARKER: &str = "# Managed by ryzenctl, profile=";

/// Where each hook lives.
#[derive(Debug, Clone)]
pub struct HookPaths {
    pub service_name: String,
    pub service_unit: PathBuf,
    pub sleep_hook: PathBuf,
    pub autostart_entry: PathBuf,
}

impl HookPaths {
    pub fn system() -> Self {
        let autostart_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc/xdg"))
            .join("autostart");
        Self {
            service_name: SERVICE_NAME.to_string(),
            service_unit: PathBuf::from(SERVICE_PATH),
            sleep_hook: PathBuf::from(SLEEP_HOOK_PATH),
            autostart_entry: autostart_dir.join(AUTOSTART_FILE),
        }
    }

    /// All hooks under one directory (tests, staging).
    pub fn under(root: &Path) -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            service_unit: root.join("systemd/system").join(SERVICE_NAME),
            sleep_hook: root.join("systemd/system-sleep/ryzenctl-resume"),
            autostart_entry: root.join("autostart").join(AUTOSTART_FILE),
        }
    }
}

/// How a hook calls back into this tool.
///
/// Boot and resume hooks run as root, whose config directory is not the
/// user's, so the state file is always passed explicitly. Hooks apply with
/// `--no-sync`: a hook firing never rebinds the other hooks.
#[derive(Debug, Clone)]
pub struct HookCommand {
    pub program: String,
    /// Absolute path of the state file holding the bound profiles.
    pub state_file: PathBuf,
}

impl HookCommand {
    pub fn new(program: impl Into<String>, state_file: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            state_file: state_file.into(),
        }
    }

    fn state_file(&self) -> String {
        self.state_file.display().to_string()
    }
}

/// Quote for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote for a systemd `Environment=` assignment.
fn systemd_quote(value: &str) -> String {
    let escaped = value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{}\"", escaped)
}

/// Quote for a desktop entry `Exec=` argument.
fn desktop_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out.replace('%', "%%")
}

fn service_content(command: &HookCommand, profile: &str) -> String {
    format!(
        "{marker}{profile}
[Unit]
Description=Apply ryzenadj profile (ryzenctl)
After=multi-user.target

[Service]
Type=oneshot
Environment={state_env}
Environment={profile_env}
ExecStart={program} --state-file ${{RYZENCTL_STATE}} apply --no-sync ${{RYZENCTL_PROFILE}}

[Install]
WantedBy=multi-user.target
",
        marker = MARKER,
        profile = profile,
        state_env = systemd_quote(&format!("RYZENCTL_STATE={}", command.state_file())),
        profile_env = systemd_quote(&format!("RYZENCTL_PROFILE={}", profile)),
        program = command.program,
    )
}

fn sleep_hook_content(command: &HookCommand, profile: &str) -> String {
    format!(
        "#!/bin/sh
{marker}{profile}
if [ \"$1\" = \"post\" ]; then
  {program} --state-file {state} apply --no-sync {quoted}
fi
",
        marker = MARKER,
        profile = profile,
        program = shell_quote(&command.program),
        state = shell_quote(&command.state_file()),
        quoted = shell_quote(profile),
    )
}

fn autostart_content(command: &HookCommand, profile: &str) -> String {
    format!(
        "[Desktop Entry]
{marker}{profile}
Type=Application
Name=ryzenctl
Comment=Apply the active ryzenadj profile at login
Exec={program} --state-file {state} apply --no-sync {quoted}
Terminal=false
X-GNOME-Autostart-enabled=true
",
        marker = MARKER,
        profile = profile,
        program = command.program,
        state = desktop_quote(&command.state_file()),
        quoted = desktop_quote(profile),
    )
}

/// Pull the bound profile back out of a hook file.
fn read_marker(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix(MARKER))
        .map(|p| p.trim_end().to_string())
        .filter(|p| !p.is_empty())
}

fn write_script(path: &Path, content: &str, mode: &str) -> Vec<String> {
    let dir = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target = shell_quote(&path.display().to_string());
    vec![
        format!("mkdir -p {}", shell_quote(&dir)),
        format!("printf '%s' {} > {}", shell_quote(content), target),
        format!("chmod {} {}", mode, target),
    ]
}

/// Hooks backed by systemd units, system-sleep scripts and XDG autostart.
///
/// Root-owned files are written by a generated shell script run through the
/// privileged runner, so a single escalation prompt covers each change.
pub struct SystemHooks<R> {
    runner: R,
    paths: HookPaths,
    command: HookCommand,
}

impl<R: ProcessRunner> SystemHooks<R> {
    pub fn new(runner: R, paths: HookPaths, command: HookCommand) -> Self {
        Self {
            runner,
            paths,
            command,
        }
    }

    pub fn paths(&self) -> &HookPaths {
        &self.paths
    }

    fn run_privileged_script(&self, lines: Vec<String>) -> Result<()> {
        let mut script = vec!["set -eu".to_string()];
        script.extend(lines);
        let script = script.join("\n");
        debug!("hook script:\n{}", script);

        let invocation = Invocation::new("sh", ["-c".to_string(), script]).privileged();
        let output = self.runner.run(&invocation)?;
        if output.is_success() {
            return Ok(());
        }
        Err(Error::Executor {
            program: "hook script".to_string(),
            detail: if output.timed_out {
                "timed out".to_string()
            } else {
                let text = output.combined();
                if text.is_empty() {
                    format!("exit status {:?}", output.code)
                } else {
                    text
                }
            },
        })
    }

    fn service_enabled(&self) -> bool {
        let query = Invocation::new("systemctl", ["is-enabled", self.paths.service_name.as_str()]);
        match self.runner.run(&query) {
            Ok(out) => out.is_success() && out.stdout.trim() == "enabled",
            Err(_) => false,
        }
    }
}

impl<R: ProcessRunner> HookBackend for SystemHooks<R> {
    fn install(&self, kind: HookKind, profile: &str) -> Result<()> {
        match kind {
            HookKind::Boot => {
                let unit = &self.paths.service_unit;
                let mut lines = write_script(unit, &service_content(&self.command, profile), "644");
                lines.push("systemctl daemon-reload".to_string());
                lines.push(format!(
                    "systemctl enable {}",
                    shell_quote(&self.paths.service_name)
                ));
                self.run_privileged_script(lines)
            }
            HookKind::Resume => {
                let hook = &self.paths.sleep_hook;
                let lines = write_script(hook, &sleep_hook_content(&self.command, profile), "755");
                self.run_privileged_script(lines)
            }
            HookKind::Autostart => {
                let entry = &self.paths.autostart_entry;
                if let Some(parent) = entry.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
                }
                fs::write(entry, autostart_content(&self.command, profile))
                    .map_err(|e| Error::persistence(entry, e))
            }
        }
    }

    fn remove(&self, kind: HookKind) -> Result<()> {
        match kind {
            HookKind::Boot => {
                if !self.paths.service_unit.exists() {
                    return Ok(());
                }
                let service = shell_quote(&self.paths.service_name);
                self.run_privileged_script(vec![
                    format!("systemctl disable {} || true", service),
                    format!(
                        "rm -f {}",
                        shell_quote(&self.paths.service_unit.display().to_string())
                    ),
                    "systemctl daemon-reload".to_string(),
                ])
            }
            HookKind::Resume => {
                if !self.paths.sleep_hook.exists() {
                    return Ok(());
                }
                self.run_privileged_script(vec![format!(
                    "rm -f {}",
                    shell_quote(&self.paths.sleep_hook.display().to_string())
                )])
            }
            HookKind::Autostart => match fs::remove_file(&self.paths.autostart_entry) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::persistence(&self.paths.autostart_entry, e)),
            },
        }
    }

    fn detect(&self, kind: HookKind) -> Result<DetectedHook> {
        let path = match kind {
            HookKind::Boot => &self.paths.service_unit,
            HookKind::Resume => &self.paths.sleep_hook,
            HookKind::Autostart => &self.paths.autostart_entry,
        };

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DetectedHook::Absent);
            }
            Err(e) => return Err(Error::persistence(path, e)),
        };

        if kind == HookKind::Boot && !self.service_enabled() {
            return Ok(DetectedHook::Absent);
        }

        Ok(DetectedHook::Installed {
            profile: read_marker(&content),
        })
    }
}
