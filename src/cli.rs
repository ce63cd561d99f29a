use crate::integration::HookKind;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ryzenctl",
    about = "Save, apply and restore ryzenadj tuning profiles on AMD Ryzen laptops",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output as JSON instead of formatted tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Read configuration from this file instead of the system and user files
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Use this state file instead of the configured one
    #[arg(long, global = true, value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// List every tunable parameter with its flag, unit and bounds
    Parameters,

    /// List saved profiles
    List,

    /// Show the values stored in a profile
    Show {
        /// Profile name
        name: String,
    },

    /// Create or update a profile
    Save {
        /// Profile name
        name: String,

        /// Enabled value, in raw units (e.g. stapm_limit=15000). Repeatable.
        #[arg(long = "set", value_name = "ID=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, u32)>,

        /// Stored but not sent on apply. Repeatable.
        #[arg(long = "off", value_name = "ID=VALUE", value_parser = parse_assignment)]
        off: Vec<(String, u32)>,

        /// Start from the values ryzenadj reports right now
        #[arg(long)]
        from_hardware: bool,

        /// Replace an existing profile with the same name
        #[arg(long)]
        force: bool,
    },

    /// Delete a profile and disable hooks bound to it
    Delete {
        /// Profile name
        name: String,
    },

    /// Apply a profile and make it the active one
    Apply {
        /// Profile name
        name: String,

        /// Leave enabled hooks bound to their current profiles
        #[arg(long)]
        no_sync: bool,
    },

    /// Record the current hardware values as the initial default
    CaptureDefault {
        /// Replace an existing capture
        #[arg(long)]
        force: bool,
    },

    /// Apply the captured initial default
    Reset,

    /// Read the current values and telemetry from ryzenadj --info
    Info {
        /// Keep refreshing telemetry every SECS seconds until interrupted
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        watch: Option<u64>,
    },

    /// Manage boot, resume and login hooks
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Merge profiles from an exported file
    Import {
        /// File written by `ryzenctl export`
        path: PathBuf,
    },

    /// Write all profiles to a file
    Export {
        /// Destination file
        path: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for (auto-detected if omitted)
        shell: Option<Shell>,
    },
}

#[derive(Subcommand)]
pub enum HookAction {
    /// Install a hook that applies a profile
    Enable {
        #[arg(value_enum)]
        hook: HookKind,
        /// Profile the hook applies
        profile: String,
    },
    /// Remove a hook
    Disable {
        #[arg(value_enum)]
        hook: HookKind,
    },
    /// Show recorded and installed hooks and any drift between them
    Status,
}

/// Parse `id=value`.
pub fn parse_assignment(s: &str) -> Result<(String, u32), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=VALUE, got '{}'", s))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("missing parameter id in '{}'", s));
    }
    let value = value
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid value in '{}': {}", s, e))?;
    Ok((id.to_string(), value))
}

/// Print shell completions to stdout.
pub fn print_completions(shell: Option<Shell>) {
    let shell = shell.or_else(Shell::from_env).unwrap_or_else(|| {
        eprintln!(
            "Could not detect shell. Specify one: ryzenctl completions bash|zsh|fish|elvish|powershell"
        );
        std::process::exit(1);
    });
    clap_complete::generate(
        shell,
        &mut Cli::command(),
        "ryzenctl",
        &mut std::io::stdout(),
    );
}
