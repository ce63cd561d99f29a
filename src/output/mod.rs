use crate::catalog::{self, Category, ParameterSpec};
use crate::engine::{ApplyReport, HardwareSnapshot, Outcome, Reading, Telemetry};
use std::io::Write;
use crate::integration::{DetectedHook, HookKind};
use crate::profile::Profile;
use crate::state::{Activation, HookReport};
use colored::Colorize;
use serde::Serialize;

const LABEL_W: usize = 26;
const DIVIDER_W: usize = 64;

fn section(title: &str) {
    let fill = DIVIDER_W.saturating_sub(2 + title.len());
    println!("── {} {}", title.bold(), "─".repeat(fill));
}

fn label_for(id: &str) -> String {
    catalog::find(id)
        .map(|spec| spec.label.to_string())
        .unwrap_or_else(|| id.to_string())
}

fn display_for(id: &str, raw: u32) -> String {
    catalog::find(id)
        .map(|spec| spec.display_value(raw))
        .unwrap_or_else(|| raw.to_string())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to encode output: {}", e),
    }
}

pub fn print_parameters(parameters: &[ParameterSpec]) {
    let mut current: Option<Category> = None;
    for spec in parameters {
        if current != Some(spec.category) {
            if current.is_some() {
                println!();
            }
            section(&spec.category.to_string());
            current = Some(spec.category);
        }
        let range = if spec.kind == catalog::ParameterKind::Flag {
            "flag".to_string()
        } else {
            format!("{}..={}", spec.min, spec.max)
        };
        println!(
            "  {:<w$} {:<28} {}",
            spec.id,
            spec.flag.cyan(),
            range.dimmed(),
            w = LABEL_W
        );
    }
}

pub fn print_profile_list(names: &[String], active: Option<&str>, has_default: bool) {
    if names.is_empty() {
        println!(
            "{}",
            "  No profiles saved. Create one with `ryzenctl save <name> --set id=value`.".yellow()
        );
    } else {
        section(&format!("Profiles ({})", names.len()));
        for name in names {
            if Some(name.as_str()) == active {
                println!("  {} {}", "●".green(), name.bold());
            } else {
                println!("    {}", name);
            }
        }
    }
    if !has_default {
        println!();
        println!(
            "  {} no initial default captured; run {} before tuning",
            "Note:".yellow(),
            "ryzenctl capture-default".cyan()
        );
    }
}

pub fn print_profile(name: &str, profile: &Profile) {
    section(name);
    println!("  {:<w$} {}", "Created".dimmed(), profile.created_at, w = LABEL_W);
    for (id, value) in &profile.values {
        let label = label_for(id);
        let shown = display_for(id, value.value);
        if catalog::find(id).is_none() {
            println!("  {:<w$} {} {}", label, shown, "(unknown parameter)".red(), w = LABEL_W);
        } else if value.enabled {
            println!("  {:<w$} {}", label, shown, w = LABEL_W);
        } else {
            println!("  {:<w$} {}", label.dimmed(), format!("{} (off)", shown).dimmed(), w = LABEL_W);
        }
    }
}

pub fn print_snapshot(snapshot: &HardwareSnapshot) {
    section(&format!(
        "Hardware ({} of {} readable)",
        snapshot.supported_count(),
        snapshot.readings.len()
    ));
    for spec in catalog::parameters() {
        let Some(reading) = snapshot.get(spec.id) else {
            continue;
        };
        match reading {
            Reading::Value(raw) => {
                println!("  {:<w$} {}", spec.label, spec.display_value(raw), w = LABEL_W)
            }
            Reading::Unsupported => println!(
                "  {:<w$} {}",
                spec.label.dimmed(),
                "unsupported".dimmed(),
                w = LABEL_W
            ),
        }
    }
}

fn reading(value: Option<f64>, unit: &str) -> String {
    value
        .map(|v| format!("{:.1} {}", v, unit))
        .unwrap_or_else(|| "N/A".to_string())
}

fn usage(value: Option<f64>, limit: Option<f64>) -> String {
    match (value, limit) {
        (Some(v), Some(l)) => format!("{:.1} / {:.1} W", v, l),
        (None, Some(l)) => format!("N/A / {:.1} W", l),
        (v, None) => reading(v, "W"),
    }
}

pub fn print_telemetry(telemetry: &Telemetry) {
    section("Telemetry");
    if telemetry.is_empty() {
        println!("  {}", "ryzenadj reported no telemetry".dimmed());
        return;
    }
    let rows = [
        ("STAPM", usage(telemetry.stapm_value, telemetry.stapm_limit)),
        ("PPT Fast", usage(telemetry.fast_value, telemetry.fast_limit)),
        ("PPT Slow", usage(telemetry.slow_value, telemetry.slow_limit)),
        ("CPU Temperature", reading(telemetry.cpu_temp, "°C")),
        ("Power Draw", reading(telemetry.power_draw, "W")),
    ];
    for (label, value) in rows {
        println!("  {:<w$} {}", label, value, w = LABEL_W);
    }
}

/// Header for `info --watch`.
pub fn print_telemetry_header() {
    println!(
        "{:>8} {:>16} {:>16} {:>16} {:>8} {:>8}",
        "Time".dimmed(),
        "STAPM W".cyan(),
        "Fast W".cyan(),
        "Slow W".cyan(),
        "Temp".cyan(),
        "Draw W".cyan(),
    );
    println!("{}", "-".repeat(77).dimmed());
}

/// One refresh of `info --watch`, rewriting the current line.
pub fn print_telemetry_row(elapsed_secs: u64, telemetry: &Telemetry) {
    let pair = |v: Option<f64>, l: Option<f64>| -> String {
        let fmt = |x: Option<f64>| x.map_or_else(|| "N/A".to_string(), |x| format!("{:.1}", x));
        format!("{}/{}", fmt(v), fmt(l))
    };
    let single = |v: Option<f64>| v.map_or_else(|| "N/A".to_string(), |v| format!("{:.1}", v));
    print!(
        "\r{:>8} {:>16} {:>16} {:>16} {:>8} {:>8}",
        format!("{:02}:{:02}", elapsed_secs / 60, elapsed_secs % 60),
        pair(telemetry.stapm_value, telemetry.stapm_limit),
        pair(telemetry.fast_value, telemetry.fast_limit),
        pair(telemetry.slow_value, telemetry.slow_limit),
        single(telemetry.cpu_temp),
        single(telemetry.power_draw),
    );
    let _ = std::io::stdout().flush();
}

pub fn print_apply_report(report: &ApplyReport) {
    for entry in &report.outcomes {
        let label = label_for(&entry.id);
        let value = display_for(&entry.id, entry.value);
        match &entry.outcome {
            Outcome::Applied => println!("  {} {:<w$} {}", "✓".green(), label, value, w = LABEL_W),
            Outcome::Unsupported(why) => println!(
                "  {} {:<w$} {}",
                "–".yellow(),
                label,
                format!("unsupported: {}", why).yellow(),
                w = LABEL_W
            ),
            Outcome::Failed(why) => println!(
                "  {} {:<w$} {}",
                "✗".red(),
                label,
                why.red(),
                w = LABEL_W
            ),
            Outcome::Skipped => println!(
                "  {} {:<w$} {}",
                "·".dimmed(),
                label.dimmed(),
                "skipped".dimmed(),
                w = LABEL_W
            ),
        }
    }
    for id in &report.stale {
        println!(
            "  {} {:<w$} {}",
            "!".yellow(),
            id,
            "no longer a known parameter, not sent".yellow(),
            w = LABEL_W
        );
    }

    println!("{}", "─".repeat(DIVIDER_W));
    let summary = format!(
        "{} applied, {} unsupported, {} failed",
        report.applied(),
        report.unsupported(),
        report.failed()
    );
    if report.failed() > 0 || report.cancelled {
        println!("  {}", summary.red().bold());
    } else if report.unsupported() > 0 {
        println!("  {}", summary.yellow().bold());
    } else {
        println!("  {}", summary.green().bold());
    }
}

pub fn print_activation(activation: &Activation) {
    section(&format!("Applying '{}'", activation.profile));
    print_apply_report(&activation.report);
    if !activation.report.is_success() {
        println!(
            "  {}",
            "Active profile unchanged because the apply did not fully succeed.".yellow()
        );
        return;
    }
    println!("  Active profile: {}", activation.profile.green());
    if !activation.rebound.is_empty() {
        let hooks: Vec<String> = activation.rebound.iter().map(HookKind::to_string).collect();
        println!("  Hooks now applying it: {}", hooks.join(", ").cyan());
    }
    if let Some(err) = &activation.sync_error {
        println!("  {} {}", "Hook sync stopped:".red(), err);
    }
}

pub fn print_hook_report(report: &HookReport) {
    section("Hooks");
    for (kind, detected) in &report.detected {
        let recorded = report
            .recorded
            .get(*kind)
            .profile()
            .map(|p| p.green().to_string())
            .unwrap_or_else(|| "disabled".dimmed().to_string());
        let installed = match detected {
            DetectedHook::Absent => "not installed".dimmed().to_string(),
            DetectedHook::Installed { profile: Some(p) } => {
                format!("installed for '{}'", p)
            }
            DetectedHook::Installed { profile: None } => {
                "installed (unknown binding)".yellow().to_string()
            }
        };
        println!("  {:<12} {:<24} {}", kind.to_string().bold(), recorded, installed);
    }

    if report.discrepancies.is_empty() {
        return;
    }
    println!();
    section(&format!("Drift ({})", report.discrepancies.len()));
    for d in &report.discrepancies {
        println!("  {} {}", "!".yellow().bold(), d);
    }
    println!(
        "  Fix with {} or {}.",
        "ryzenctl hook enable <hook> <profile>".cyan(),
        "ryzenctl hook disable <hook>".cyan()
    );
}
