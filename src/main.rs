use anyhow::{Result, bail};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use ryzenctl::catalog;
use ryzenctl::cli::{Cli, Command, HookAction};
use ryzenctl::config::AppConfig;
use ryzenctl::engine::Engine;
use ryzenctl::executor::SystemRunner;
use ryzenctl::integration::{HookCommand, HookKind, HookPaths, SystemHooks};
use ryzenctl::job::{self, CancelToken, Poll};
use ryzenctl::profile::{ProfileValue, ProfileValues};
use ryzenctl::state::{ManagerOptions, StateManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Manager = StateManager<SystemRunner>;

/// Everything a command needs once the state file is open.
struct Ctx {
    manager: Arc<Manager>,
    runner: SystemRunner,
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = ryzenctl::config::load(cli.config.as_deref());

    match cli.command {
        Command::Parameters => cmd_parameters(cli.json),
        Command::Completions { shell } => {
            ryzenctl::cli::print_completions(shell);
            Ok(())
        }
        command => {
            let runner = SystemRunner::new(config.executor.escalation, config.executor.timeout());
            let state_file =
                std::path::absolute(cli.state_file.unwrap_or_else(|| config.storage.state_file()))?;
            let options = ManagerOptions {
                auto_sync: config.integration.auto_sync
                    && !matches!(command, Command::Apply { no_sync: true, .. }),
            };
            let ctx = Ctx {
                manager: Arc::new(open_manager(&config, runner.clone(), state_file, options)?),
                runner,
                json: cli.json,
            };
            run(command, &ctx)?;
            match Arc::try_unwrap(ctx.manager) {
                Ok(manager) => manager.close()?,
                Err(manager) => manager.flush()?,
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn open_manager(
    config: &AppConfig,
    runner: SystemRunner,
    state_file: PathBuf,
    options: ManagerOptions,
) -> Result<Manager> {
    let engine = Engine::new(runner.clone(), config.executor.binary.clone());
    let command = HookCommand::new(config.integration.program(), state_file.clone());
    let hooks = SystemHooks::new(runner, HookPaths::system(), command);
    let manager = StateManager::open(state_file, engine, Box::new(hooks), options)?;
    Ok(manager)
}

fn run(command: Command, ctx: &Ctx) -> Result<()> {
    match command {
        Command::List => cmd_list(ctx),
        Command::Show { name } => cmd_show(ctx, &name),
        Command::Save {
            name,
            set,
            off,
            from_hardware,
            force,
        } => cmd_save(ctx, &name, set, off, from_hardware, force),
        Command::Delete { name } => cmd_delete(ctx, &name),
        Command::Apply { name, .. } => cmd_apply(ctx, name),
        Command::CaptureDefault { force } => cmd_capture_default(ctx, force),
        Command::Reset => cmd_reset(ctx),
        Command::Info { watch } => match watch {
            Some(secs) => cmd_watch(ctx, Duration::from_secs(secs)),
            None => cmd_info(ctx),
        },
        Command::Hook { action } => cmd_hook(ctx, action),
        Command::Import { path } => cmd_import(ctx, &path),
        Command::Export { path } => cmd_export(ctx, &path),
        Command::Parameters | Command::Completions { .. } => Ok(()),
    }
}

/// ryzenadj and the root-owned hooks need root or a way to get it.
fn require_escalation(runner: &SystemRunner) -> Result<()> {
    if !runner.can_escalate() {
        bail!(
            "This needs root. Run as root or set executor.escalation to \"pkexec\" or \"sudo\"."
        );
    }
    Ok(())
}

/// Run `work` on a worker thread, drawing a spinner until it reports back.
fn with_spinner<T, F>(ctx: &Ctx, message: String, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> T + Send + 'static,
{
    let job = job::spawn_job(work);
    let spinner = if ctx.json || ctx.runner.prompts_on_terminal() {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message);

    loop {
        match job.poll(Duration::from_millis(80)) {
            Poll::Ready(value) => {
                spinner.finish_and_clear();
                return Ok(value);
            }
            Poll::Pending => spinner.tick(),
            Poll::Lost => {
                spinner.finish_and_clear();
                bail!("worker thread stopped without a result");
            }
        }
    }
}

fn cmd_parameters(json: bool) -> Result<()> {
    if json {
        ryzenctl::output::print_json(catalog::parameters());
    } else {
        ryzenctl::output::print_parameters(catalog::parameters());
    }
    Ok(())
}

fn cmd_list(ctx: &Ctx) -> Result<()> {
    let state = ctx.manager.snapshot();
    let names = ctx.manager.list();
    if ctx.json {
        ryzenctl::output::print_json(&serde_json::json!({
            "profiles": names,
            "activeProfile": state.store.active_profile,
            "initialDefault": state.store.has_initial_default(),
        }));
    } else {
        ryzenctl::output::print_profile_list(
            &names,
            state.store.active_profile.as_deref(),
            state.store.has_initial_default(),
        );
    }
    Ok(())
}

fn cmd_show(ctx: &Ctx, name: &str) -> Result<()> {
    let profile = ctx.manager.load_profile(name)?;
    if ctx.json {
        ryzenctl::output::print_json(&profile);
    } else {
        ryzenctl::output::print_profile(name.trim(), &profile);
    }
    Ok(())
}

fn cmd_save(
    ctx: &Ctx,
    name: &str,
    set: Vec<(String, u32)>,
    off: Vec<(String, u32)>,
    from_hardware: bool,
    force: bool,
) -> Result<()> {
    let mut values = if from_hardware {
        require_escalation(&ctx.runner)?;
        ctx.manager.read_hardware()?.to_profile_values()
    } else if force {
        // Editing in place: unspecified parameters keep their stored values.
        ctx.manager
            .load_profile(name)
            .map(|p| {
                p.values
                    .into_iter()
                    .filter(|(id, _)| catalog::find(id).is_some())
                    .collect()
            })
            .unwrap_or_default()
    } else {
        ProfileValues::new()
    };
    for (id, value) in set {
        values.insert(id, ProfileValue::enabled(value));
    }
    for (id, value) in off {
        values.insert(id, ProfileValue::disabled(value));
    }

    let enabled = values.values().filter(|v| v.enabled).count();
    ctx.manager.save_profile(name, values, force)?;
    if !ctx.json {
        println!(
            "{} Saved '{}' ({} enabled parameter(s)).",
            "✓".green(),
            name.trim(),
            enabled
        );
    }
    Ok(())
}

fn cmd_delete(ctx: &Ctx, name: &str) -> Result<()> {
    let deletion = ctx.manager.delete_profile(name)?;
    if ctx.json {
        ryzenctl::output::print_json(&serde_json::json!({
            "deleted": name.trim(),
            "releasedHooks": deletion.released,
            "hookFailures": deletion
                .hook_failures
                .iter()
                .map(|(kind, e)| serde_json::json!({ "hook": kind, "error": e.to_string() }))
                .collect::<Vec<_>>(),
        }));
        return Ok(());
    }
    println!("{} Deleted '{}'.", "✓".green(), name.trim());
    for kind in &deletion.released {
        println!("  {} hook disabled", kind);
    }
    for (kind, e) in &deletion.hook_failures {
        println!(
            "  {} could not remove the {} hook files: {}",
            "Warning:".yellow(),
            kind,
            e
        );
    }
    Ok(())
}

fn cmd_apply(ctx: &Ctx, name: String) -> Result<()> {
    require_escalation(&ctx.runner)?;
    let worker = Arc::clone(&ctx.manager);
    let message = format!("Applying '{}'...", name);
    let activation = with_spinner(ctx, message, move |cancel| worker.activate(&name, &cancel))??;

    if ctx.json {
        ryzenctl::output::print_json(&activation);
    } else {
        ryzenctl::output::print_activation(&activation);
    }
    if !activation.report.is_success() {
        bail!("{} parameter(s) failed", activation.report.failed());
    }
    Ok(())
}

fn cmd_capture_default(ctx: &Ctx, force: bool) -> Result<()> {
    require_escalation(&ctx.runner)?;
    let worker = Arc::clone(&ctx.manager);
    let snapshot = with_spinner(ctx, "Reading hardware...".to_string(), move |_| {
        worker.capture_initial_default(force)
    })??;

    if ctx.json {
        ryzenctl::output::print_json(&snapshot);
    } else {
        ryzenctl::output::print_snapshot(&snapshot);
        println!(
            "{} Initial default captured. Run {} to restore it.",
            "✓".green(),
            "ryzenctl reset".cyan()
        );
    }
    Ok(())
}

fn cmd_reset(ctx: &Ctx) -> Result<()> {
    require_escalation(&ctx.runner)?;
    let worker = Arc::clone(&ctx.manager);
    let report = with_spinner(ctx, "Restoring initial default...".to_string(), move |cancel| {
        worker.reset_to_default(&cancel)
    })??;

    if ctx.json {
        ryzenctl::output::print_json(&report);
    } else {
        ryzenctl::output::print_apply_report(&report);
    }
    if !report.is_success() {
        bail!("{} parameter(s) failed", report.failed());
    }
    Ok(())
}

fn cmd_info(ctx: &Ctx) -> Result<()> {
    require_escalation(&ctx.runner)?;
    let worker = Arc::clone(&ctx.manager);
    let reading = with_spinner(ctx, "Reading hardware...".to_string(), move |_| {
        worker.read_info()
    })??;

    if ctx.json {
        ryzenctl::output::print_json(&reading);
    } else {
        ryzenctl::output::print_snapshot(&reading.snapshot);
        println!();
        ryzenctl::output::print_telemetry(&reading.telemetry);
    }
    Ok(())
}

/// Refresh telemetry until interrupted.
fn cmd_watch(ctx: &Ctx, interval: Duration) -> Result<()> {
    require_escalation(&ctx.runner)?;
    if !ctx.json {
        println!("{}", "ryzenadj Telemetry".bold().underline());
        println!("Press Ctrl+C to stop");
        if ctx.runner.prompts_every_call() {
            println!(
                "  {} pkexec asks on every refresh; run as root or use sudo escalation",
                "Note:".yellow()
            );
        }
        println!();
        ryzenctl::output::print_telemetry_header();
    }

    let start = Instant::now();
    let mut refreshes: u64 = 0;
    loop {
        let telemetry = ctx.manager.read_telemetry()?;
        if ctx.json {
            println!("{}", serde_json::to_string(&telemetry)?);
        } else {
            ryzenctl::output::print_telemetry_row(start.elapsed().as_secs(), &telemetry);
            refreshes += 1;
            // keep every tenth row in scrollback
            if refreshes.is_multiple_of(10) {
                println!();
            }
        }
        std::thread::sleep(interval);
    }
}

fn cmd_hook(ctx: &Ctx, action: HookAction) -> Result<()> {
    match action {
        HookAction::Enable { hook, profile } => {
            if hook != HookKind::Autostart {
                require_escalation(&ctx.runner)?;
            }
            ctx.manager.enable_hook(hook, &profile)?;
            if !ctx.json {
                println!(
                    "{} {} hook applies '{}'.",
                    "✓".green(),
                    hook,
                    profile.trim()
                );
            }
        }
        HookAction::Disable { hook } => {
            if hook != HookKind::Autostart {
                require_escalation(&ctx.runner)?;
            }
            ctx.manager.disable_hook(hook)?;
            if !ctx.json {
                println!("{} {} hook disabled.", "✓".green(), hook);
            }
        }
        HookAction::Status => {
            let report = ctx.manager.hook_report();
            if ctx.json {
                ryzenctl::output::print_json(&report);
            } else {
                ryzenctl::output::print_hook_report(&report);
            }
        }
    }
    Ok(())
}

fn cmd_import(ctx: &Ctx, path: &Path) -> Result<()> {
    let count = ctx.manager.import(path)?;
    if !ctx.json {
        println!(
            "{} Imported {} profile(s) from {}.",
            "✓".green(),
            count,
            path.display()
        );
    }
    Ok(())
}

fn cmd_export(ctx: &Ctx, path: &Path) -> Result<()> {
    let count = ctx.manager.export(path)?;
    if !ctx.json {
        println!(
            "{} Exported {} profile(s) to {}.",
            "✓".green(),
            count,
            path.display()
        );
    }
    Ok(())
}
