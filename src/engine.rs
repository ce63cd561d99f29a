//! Reading hardware state from `ryzenadj --info` and applying profiles one
//! parameter at a time.

use crate::catalog::{self, ParameterSpec};
use crate::error::{Error, Result};
use crate::executor::{Invocation, ProcessOutput, ProcessRunner};
use crate::job::CancelToken;
use crate::profile::{Profile, ProfileValue, ProfileValues};
use log::{debug, info, warn};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Output that means "this chip cannot do that", not a failure.
const UNSUPPORTED_PATTERNS: &[&str] = &["not supported on this family", "is not supported"];

/// Output that turns any run into a failure, even next to an unsupported notice.
const FATAL_PATTERNS: &[&str] = &[
    "permission denied",
    "command not found",
    "no such file",
    "failed to",
    "traceback",
    "unable to",
    "polkit",
    "authentication",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Reading {
    Value(u32),
    Unsupported,
}

/// One `--info` read, keyed by parameter id. Every catalog id is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HardwareSnapshot {
    pub readings: BTreeMap<String, Reading>,
}

impl HardwareSnapshot {
    pub fn get(&self, id: &str) -> Option<Reading> {
        self.readings.get(id).copied()
    }

    pub fn supported_count(&self) -> usize {
        self.readings
            .values()
            .filter(|r| matches!(r, Reading::Value(_)))
            .count()
    }

    /// Every supported reading, enabled. Unsupported ids are left out.
    pub fn to_profile_values(&self) -> ProfileValues {
        self.readings
            .iter()
            .filter_map(|(id, reading)| match reading {
                Reading::Value(v) => Some((id.clone(), ProfileValue::enabled(*v))),
                Reading::Unsupported => None,
            })
            .collect()
    }
}

fn normalize_cell(cell: &str) -> String {
    cell.trim()
        .trim_start_matches('-')
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_cells(line: &str) -> Vec<&str> {
    if line.contains('|') {
        return line
            .split('|')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
    }
    if let Some((key, value)) = line.split_once(':').or_else(|| line.split_once('=')) {
        return vec![key.trim(), value.trim()];
    }
    Vec::new()
}

/// First cell that parses as a number. `nan` parses but is not usable.
fn first_number(cells: &[&str]) -> Option<f64> {
    cells.iter().find_map(|c| c.parse::<f64>().ok())
}

fn names_parameter(cell: &str, spec: &ParameterSpec) -> bool {
    let cell = normalize_cell(cell);
    !cell.is_empty() && (cell == normalize_cell(spec.flag) || cell == normalize_cell(spec.id))
}

/// Parse `ryzenadj --info` output against `catalog`.
///
/// Catalog ids that never show up, or show up with no usable number, read as
/// `Unsupported`. Lines naming anything outside the catalog are ignored.
pub fn parse_info_output(catalog: &[ParameterSpec], text: &str) -> HardwareSnapshot {
    let mut readings: BTreeMap<String, Reading> = catalog
        .iter()
        .filter(|spec| spec.capturable)
        .map(|spec| (spec.id.to_string(), Reading::Unsupported))
        .collect();

    for line in text.lines() {
        let cells = split_cells(line);
        if cells.len() < 2 {
            continue;
        }
        let Some(spec) = catalog
            .iter()
            .filter(|spec| spec.capturable)
            .find(|spec| cells.iter().any(|c| names_parameter(c, spec)))
        else {
            continue;
        };
        match first_number(&cells) {
            Some(n) => match spec.from_reported(n) {
                Some(raw) => {
                    readings.insert(spec.id.to_string(), Reading::Value(raw));
                }
                None if n.is_finite() => warn!(
                    "{}: reported {} is outside {}..={}, treating it as unsupported",
                    spec.id, n, spec.min, spec.max
                ),
                None => debug!("{}: no usable value in '{}'", spec.id, line.trim()),
            },
            None => debug!("{}: no usable value in '{}'", spec.id, line.trim()),
        }
    }

    HardwareSnapshot { readings }
}

/// Live values from `ryzenadj --info`: the limits in force next to what the
/// SMU says it is drawing right now. Power in W, temperature in °C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub stapm_limit: Option<f64>,
    pub stapm_value: Option<f64>,
    pub fast_limit: Option<f64>,
    pub fast_value: Option<f64>,
    pub slow_limit: Option<f64>,
    pub slow_value: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub power_draw: Option<f64>,
}

impl Telemetry {
    /// Whether any row was recognised.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn telemetry_slot<'a>(telemetry: &'a mut Telemetry, name: &str) -> Option<&'a mut Option<f64>> {
    let slot = match name {
        "stapm limit" => &mut telemetry.stapm_limit,
        "stapm value" => &mut telemetry.stapm_value,
        "ppt limit fast" | "ppt fast limit" => &mut telemetry.fast_limit,
        "ppt value fast" | "ppt fast value" => &mut telemetry.fast_value,
        "ppt limit slow" | "ppt slow limit" => &mut telemetry.slow_limit,
        "ppt value slow" | "ppt slow value" => &mut telemetry.slow_value,
        "thm value core" | "cpu temp" | "cpu temperature" | "temperature" => &mut telemetry.cpu_temp,
        "socket power" | "package power" | "cpu power" | "current power draw" => {
            &mut telemetry.power_draw
        }
        _ => return None,
    };
    Some(slot)
}

/// Pick the telemetry rows out of `ryzenadj --info` output. The first row
/// naming a value wins; `nan` leaves it unset.
pub fn parse_telemetry(text: &str) -> Telemetry {
    let mut telemetry = Telemetry::default();
    for line in text.lines() {
        let cells = split_cells(line);
        let Some((name, rest)) = cells.split_first() else {
            continue;
        };
        let Some(slot) = telemetry_slot(&mut telemetry, &normalize_cell(name)) else {
            continue;
        };
        if slot.is_none() {
            *slot = first_number(rest).filter(|n| n.is_finite());
        }
    }
    telemetry
}

/// Both views of a single `--info` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InfoReading {
    pub snapshot: HardwareSnapshot,
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Unsupported(String),
    Failed(String),
    /// Not launched because the batch was cancelled.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterOutcome {
    pub id: String,
    pub value: u32,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<ParameterOutcome>,
    /// Profile entries the catalog no longer knows. Never sent.
    pub stale: Vec<String>,
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.id == id).map(|o| &o.outcome)
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| *o == Outcome::Applied)
    }

    pub fn unsupported(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Unsupported(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| *o == Outcome::Skipped)
    }

    /// No failures and the batch ran to the end. Unsupported is fine.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed() == 0
    }
}

fn first_matching_line(text: &str, patterns: &[&str]) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_lowercase();
            patterns.iter().any(|p| lower.contains(p))
        })
        .map(str::to_string)
}

/// Map one finished invocation to an outcome.
pub fn classify(output: &ProcessOutput) -> Outcome {
    if output.timed_out {
        return Outcome::Failed("timed out".into());
    }
    let text = output.combined();
    let fatal = first_matching_line(&text, FATAL_PATTERNS);
    if fatal.is_none() {
        if let Some(line) = first_matching_line(&text, UNSUPPORTED_PATTERNS) {
            return Outcome::Unsupported(line);
        }
    }
    match output.code {
        Some(0) => match fatal {
            Some(line) => Outcome::Failed(line),
            None => Outcome::Applied,
        },
        Some(code @ (126 | 127)) => Outcome::Failed(format!(
            "exit code {}: escalation denied or program not found",
            code
        )),
        code => {
            let reason = fatal
                .or_else(|| text.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string))
                .unwrap_or_default();
            let code = code.map_or_else(|| "signal".to_string(), |c| format!("exit code {}", c));
            if reason.is_empty() {
                Outcome::Failed(code)
            } else {
                Outcome::Failed(format!("{}: {}", code, reason))
            }
        }
    }
}

/// Talks to ryzenadj through a `ProcessRunner`.
pub struct Engine<R> {
    runner: R,
    binary: String,
    catalog: Cow<'static, [ParameterSpec]>,
}

impl<R: ProcessRunner> Engine<R> {
    pub fn new(runner: R, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            catalog: Cow::Borrowed(catalog::parameters()),
        }
    }

    /// Use a different parameter list. Tests use this to keep fixtures small.
    pub fn with_catalog(mut self, catalog: Vec<ParameterSpec>) -> Self {
        self.catalog = Cow::Owned(catalog);
        self
    }

    pub fn catalog(&self) -> &[ParameterSpec] {
        &self.catalog
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn run_info(&self) -> Result<String> {
        let invocation = Invocation::new(self.binary.as_str(), ["--info"]).privileged();
        debug!("reading hardware state: {}", invocation);
        let output = self.runner.run(&invocation)?;
        if !output.is_success() {
            let detail = if output.timed_out {
                "timed out".to_string()
            } else {
                let text = output.combined();
                let text = text.trim();
                match output.code {
                    Some(code) if text.is_empty() => format!("exit code {}", code),
                    Some(code) => format!("exit code {}: {}", code, text),
                    None => text.to_string(),
                }
            };
            return Err(Error::Executor {
                program: invocation.to_string(),
                detail,
            });
        }
        Ok(output.stdout)
    }

    pub fn read_hardware_snapshot(&self) -> Result<HardwareSnapshot> {
        Ok(self.read_info()?.snapshot)
    }

    pub fn read_telemetry(&self) -> Result<Telemetry> {
        let telemetry = parse_telemetry(&self.run_info()?);
        if telemetry.is_empty() {
            warn!("ryzenadj --info reported no telemetry rows");
        }
        Ok(telemetry)
    }

    /// Tunable values and telemetry from one `--info` invocation.
    pub fn read_info(&self) -> Result<InfoReading> {
        let text = self.run_info()?;
        let snapshot = parse_info_output(&self.catalog, &text);
        info!(
            "read {} of {} parameters from hardware",
            snapshot.supported_count(),
            snapshot.readings.len()
        );
        Ok(InfoReading {
            snapshot,
            telemetry: parse_telemetry(&text),
        })
    }

    /// Apply every enabled value of `profile`, one invocation each, in
    /// catalog order. Failures are recorded and the batch keeps going.
    /// Mode flags set to 0 are not sent.
    pub fn apply(&self, profile: &Profile, cancel: &CancelToken) -> Result<ApplyReport> {
        let stale: Vec<String> = profile
            .values
            .keys()
            .filter(|id| !self.catalog.iter().any(|spec| spec.id == id.as_str()))
            .cloned()
            .collect();
        for id in &stale {
            warn!("profile carries unknown parameter '{}'; not sent", id);
        }

        let batch: Vec<(&ParameterSpec, u32, Vec<String>)> = self
            .catalog
            .iter()
            .filter_map(|spec| match profile.values.get(spec.id) {
                Some(pv) if pv.enabled => spec
                    .command_args(pv.value)
                    .map(|args| (spec, pv.value, args)),
                _ => None,
            })
            .collect();
        if batch.is_empty() {
            return Err(Error::NothingToApply);
        }

        let mut report = ApplyReport {
            stale,
            ..Default::default()
        };
        for (spec, value, args) in batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.outcomes.push(ParameterOutcome {
                    id: spec.id.to_string(),
                    value,
                    outcome: Outcome::Skipped,
                });
                continue;
            }
            let invocation = Invocation::new(self.binary.as_str(), args).privileged();
            debug!("running {}", invocation);
            let outcome = match self.runner.run(&invocation) {
                Ok(output) => classify(&output),
                Err(e) => Outcome::Failed(e.to_string()),
            };
            match &outcome {
                Outcome::Applied => debug!("{} = {}", spec.id, value),
                Outcome::Unsupported(why) => info!("{} unsupported: {}", spec.id, why),
                Outcome::Failed(why) => warn!("{} failed: {}", spec.id, why),
                Outcome::Skipped => {}
            }
            report.outcomes.push(ParameterOutcome {
                id: spec.id.to_string(),
                value,
                outcome,
            });
        }
        Ok(report)
    }
}
