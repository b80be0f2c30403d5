use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use dwarfpatch::EditOptions;

/// Rewrites source-path prefixes in DWARF debug information and recomputes
/// GNU build-id notes.
#[derive(Debug, Parser)]
#[command(name = "dwarfpatch", version, about)]
struct Args {
    /// Build-time directory prefix to replace.
    #[arg(short, long, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Install-time directory prefix to substitute.
    #[arg(short, long, value_name = "DIR", requires = "base_dir")]
    dest_dir: Option<PathBuf>,

    /// Append null-terminated source paths to this file.
    #[arg(short, long, value_name = "FILE")]
    list_file: Option<PathBuf>,

    /// Recompute the GNU build-id note and print it to stdout.
    #[arg(short = 'i', long)]
    build_id: bool,

    /// Mix this seed string into the build-id hash.
    #[arg(short = 's', long, value_name = "SEED", requires = "build_id")]
    build_id_seed: Option<String>,

    /// Print the build-id note without recomputing it.
    #[arg(short = 'n', long, requires = "build_id")]
    no_recompute_build_id: bool,

    /// Restore access and modification times after editing.
    #[arg(short, long)]
    preserve_dates: bool,

    /// The ELF file to edit.
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
        .without_time()
        .with_target(false)
        .init();

    let args = Args::parse();
    let options = EditOptions {
        base_dir: args.base_dir.as_deref().map(|p| p.as_os_str().as_bytes().to_vec()),
        dest_dir: args.dest_dir.as_deref().map(|p| p.as_os_str().as_bytes().to_vec()),
        list_file: args.list_file,
        build_id: args.build_id,
        build_id_seed: args.build_id_seed.map(String::into_bytes),
        recompute_build_id: !args.no_recompute_build_id,
        preserve_dates: args.preserve_dates,
    };

    let summary = dwarfpatch::edit_file(&args.file, &options)
        .with_context(|| format!("failed to edit {}", args.file.display()))?;

    if let Some(build_id) = summary.build_id {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for byte in &build_id {
            write!(out, "{byte:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}
