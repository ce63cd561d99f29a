use clap::CommandFactory;
use std::io;
use std::path::PathBuf;

/// Writes ryzenctl.1 and one page per subcommand into `man/`, or into the
/// directory given as the first argument.
fn main() -> io::Result<()> {
    let out_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));
    std::fs::create_dir_all(&out_dir)?;

    clap_mangen::generate_to(ryzenctl::cli::Cli::command(), &out_dir)?;

    let mut pages: Vec<PathBuf> = std::fs::read_dir(&out_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "1"))
        .collect();
    pages.sort();
    for page in pages {
        println!("Generated {}", page.display());
    }

    Ok(())
}
