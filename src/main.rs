//! Command-line entry point.
//!
//! Three subcommands, each taking a torrent file:
//!
//! ```bash
//! marmot parse <file>       # print the torrent's metadata
//! marmot handshake <file>   # handshake one peer, address read from stdin
//! marmot download <file>    # download into the current directory
//! ```
//!
//! Exit code 0 on success, 1 on any error.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use marmot::download;
use marmot::handshake::handshake;
use marmot::torrent::Torrent;
use marmot::tracker;

#[derive(Parser, Debug)]
#[command(version, about = "A command-line BitTorrent client, written in Rust.")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print name, private flag, infohash and length of a torrent
    Parse {
        /// Path to the .torrent file
        file: PathBuf,
    },
    /// Perform a handshake with a single peer
    Handshake {
        /// Path to the .torrent file
        file: PathBuf,
    },
    /// Download the torrent into the current directory
    Download {
        /// Path to the .torrent file
        file: PathBuf,
    },
}

fn main() {
    // Usage errors exit 1; --help and --version stay successful.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    init_logger(args.verbose);

    if let Err(error) = run(args) {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }

    std::process::exit(0);
}

fn init_logger(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    } else if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Warn);
    }
    builder.init();
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Parse { file } => cmd_parse(&file),
        Command::Handshake { file } => cmd_handshake(&file),
        Command::Download { file } => cmd_download(&file),
    }
}

fn cmd_parse(file: &Path) -> Result<()> {
    let torrent = load_torrent(file)?;

    println!("Name: {}", torrent.name);
    println!("Private: {}", torrent.private);
    println!("Info hash: {}", hex::encode(torrent.info_hash));
    println!("Length: {}", torrent.length);
    if let Some(tracker) = &torrent.primary_tracker {
        println!("Tracker: {tracker}");
    }

    Ok(())
}

fn cmd_handshake(file: &Path) -> Result<()> {
    let torrent = load_torrent(file)?;

    print!("Enter peer address (host:port): ");
    io::stdout().flush()?;

    let mut addr = String::new();
    io::stdin().lock().read_line(&mut addr)?;
    let addr = addr.trim();
    if addr.is_empty() {
        bail!("peer address cannot be empty");
    }

    let conn = handshake(addr, &torrent.info_hash)
        .with_context(|| format!("handshake failed with {addr}"))?;
    drop(conn);

    println!("Handshake successful with {addr}");
    Ok(())
}

fn cmd_download(file: &Path) -> Result<()> {
    let mut torrent = load_torrent(file)?;

    torrent.peers = tracker::discover_peers(&torrent);

    let output = sanitize_filename(&torrent.name);
    download::download(&torrent, Path::new(&output))?;

    println!("Download complete: {output}");
    Ok(())
}

fn load_torrent(file: &Path) -> Result<Torrent> {
    Torrent::from_file(file).with_context(|| format!("could not load {}", file.display()))
}

/// Keep the metainfo name from escaping the current directory.
fn sanitize_filename(name: &str) -> String {
    let safe = name.replace(['/', '\\'], "_");
    if safe.trim().is_empty() {
        "download".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_separators_are_stripped_from_filenames() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("plain.iso"), "plain.iso");
    }

    #[test]
    fn empty_names_fall_back_to_a_default() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
