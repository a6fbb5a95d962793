use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fsark::archinfo;
use fsark::crypto::EncryptAlgo;
use fsark::devinfo;
use fsark::errmsg;
use fsark::options::{Options, ECC_MAX};
use fsark::{CompressAlgo, FsaError, FsaResult, RestoreSpec};

#[derive(Parser)]
#[command(
    name = "fsark",
    version,
    about = "Filesystem archiver with per-block compression, encryption and error correction"
)]
struct Cli {
    /// Overwrite the archive if it already exists
    #[arg(short = 'o', long, global = true)]
    overwrite: bool,

    /// Split the archive into volumes of SIZE MiB
    #[arg(short = 's', long, value_name = "SIZE", global = true)]
    split: Option<u64>,

    /// Compression: a level (0..9) or algo:level (none, lz4, zstd, lzma)
    #[arg(short = 'z', long, value_name = "COMP", global = true)]
    compress: Option<String>,

    /// Number of compression jobs (1..32)
    #[arg(short = 'j', long, value_name = "N", global = true)]
    jobs: Option<u32>,

    /// Encrypt/decrypt with this password (6..64 chars, "-" to prompt)
    #[arg(short = 'c', long, value_name = "PASSWORD", global = true)]
    crypto: Option<String>,

    /// Exclude files/dirs matching this pattern (repeatable)
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN", global = true)]
    exclude: Vec<String>,

    /// Error-correction level: N = 16 + ECC packets per frame (0..16)
    #[arg(long = "ecc", value_name = "LEVEL", global = true)]
    ecclevel: Option<u32>,

    /// Fail instead of prompting when a volume file is missing
    #[arg(long, global = true)]
    batch: bool,

    /// Archive label
    #[arg(short = 'L', long, value_name = "TEXT", global = true)]
    label: Option<String>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save block-device filesystems to an archive
    SaveFs {
        archive: PathBuf,
        /// Devices to save, e.g. /dev/sda1 /dev/sda2
        #[arg(required = true)]
        device: Vec<String>,
    },
    /// Recreate filesystems from an archive
    RestoreFs {
        archive: PathBuf,
        /// id=N,dest=/dev/xxx[,mkfs=fam][,mkfsopt=...][,label=...][,uuid=...]
        #[arg(required = true)]
        spec: Vec<String>,
    },
    /// Save directory trees to an archive
    SaveDir {
        archive: PathBuf,
        #[arg(required = true)]
        dir: Vec<PathBuf>,
    },
    /// Restore a directory archive into a destination directory
    RestoreDir {
        archive: PathBuf,
        destination: PathBuf,
    },
    /// Show information about an archive and its filesystems
    ArchiveInfo {
        archive: PathBuf,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the partition tables captured in an archive
    ShowPartitionTable { archive: PathBuf },
    /// Show how captured partition tables map onto destination disks
    RestorePartitionTable {
        archive: PathBuf,
        /// id=N,dest=/dev/xxx
        #[arg(required = true)]
        spec: Vec<String>,
    },
    /// List block devices and the filesystems on them
    Probe {
        #[arg(long)]
        details: bool,
    },
}

/// Parse `-z`: a bare level selects zstd, `algo:level` selects both.
fn parse_compress(s: &str) -> FsaResult<(CompressAlgo, i32)> {
    if let Ok(level) = s.parse::<i32>() {
        if !(0..=9).contains(&level) {
            return Err(FsaError::InvalidArg(format!(
                "compression level {level} out of range 0..9"
            )));
        }
        return Ok((CompressAlgo::Zstd, level));
    }
    let (name, level) = match s.split_once(':') {
        Some((n, l)) => (
            n,
            l.parse::<i32>()
                .map_err(|_| FsaError::InvalidArg(format!("bad compression level in \"{s}\"")))?,
        ),
        None => (s, 3),
    };
    let algo = CompressAlgo::from_name(name)
        .ok_or_else(|| FsaError::InvalidArg(format!("unknown compression algorithm \"{name}\"")))?;
    Ok((algo, level))
}

fn read_password_prompt() -> FsaResult<String> {
    print!("Password: ");
    std::io::stdout()
        .flush()
        .map_err(|e| FsaError::Write(e.to_string()))?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| FsaError::Read(e.to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn build_options(cli: &Cli) -> FsaResult<Options> {
    let mut opts = Options {
        overwrite: cli.overwrite,
        splitsize: cli.split.unwrap_or(0) * 1024 * 1024,
        exclude: cli.exclude.clone(),
        batch_mode: cli.batch,
        archive_label: cli.label.clone().unwrap_or_default(),
        verbosity: cli.verbose as i32,
        ..Options::default()
    };
    if let Some(z) = &cli.compress {
        let (algo, level) = parse_compress(z)?;
        opts.compress_algo = algo;
        opts.compress_level = level;
    }
    if let Some(jobs) = cli.jobs {
        opts.compress_jobs = jobs;
    }
    if let Some(ecc) = cli.ecclevel {
        if ecc > ECC_MAX {
            return Err(FsaError::InvalidArg(format!(
                "ecc level {ecc} out of range 0..{ECC_MAX}"
            )));
        }
        opts.ecclevel = ecc;
    }
    if let Some(pass) = &cli.crypto {
        let pass = if pass == "-" {
            read_password_prompt()?
        } else {
            pass.clone()
        };
        fsark::crypto::check_password(&pass).map_err(|e| FsaError::InvalidArg(e.to_string()))?;
        opts.encrypt_algo = EncryptAlgo::Aes256;
        opts.encrypt_pass = Some(pass);
    }
    opts.validate().map_err(FsaError::InvalidArg)?;
    Ok(opts)
}

fn parse_specs(args: &[String]) -> FsaResult<Vec<RestoreSpec>> {
    args.iter().map(|a| RestoreSpec::parse(a)).collect()
}

/// Returns the per-object error count of the operation.
fn run(cli: Cli) -> FsaResult<u64> {
    let opts = build_options(&cli)?;

    match &cli.command {
        Commands::SaveFs { archive, device } => {
            let stats = fsark::save_fs(archive, device, &opts)?;
            Ok(stats.errors())
        }
        Commands::RestoreFs { archive, spec } => {
            let specs = parse_specs(spec)?;
            let stats = fsark::restore_fs(archive, &specs, &opts)?;
            Ok(stats.errors())
        }
        Commands::SaveDir { archive, dir } => {
            let stats = fsark::save_dir(archive, dir, &opts)?;
            Ok(stats.errors())
        }
        Commands::RestoreDir {
            archive,
            destination,
        } => {
            let stats = fsark::restore_dir(archive, destination, &opts)?;
            Ok(stats.errors())
        }
        Commands::ArchiveInfo { archive, json } => {
            archinfo::archive_info(archive, &opts, *json)?;
            Ok(0)
        }
        Commands::ShowPartitionTable { archive } => {
            archinfo::show_partition_table(archive, &opts)?;
            Ok(0)
        }
        Commands::RestorePartitionTable { archive, spec } => {
            let specs = parse_specs(spec)?;
            archinfo::restore_partition_table(archive, &specs, &opts)?;
            Ok(0)
        }
        Commands::Probe { details } => {
            devinfo::print_probe(*details)?;
            Ok(0)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    fsark::logmsg::set_verbosity(cli.verbose as i32);

    if let Err(e) = fsark::install_signal_handlers() {
        errmsg!("cannot install signal handlers: {e}");
        std::process::exit(1);
    }

    match run(cli) {
        Ok(0) => {}
        Ok(errors) => {
            errmsg!("operation finished with {errors} error(s)");
            std::process::exit(1);
        }
        Err(e) => {
            errmsg!("fsark: {e}");
            std::process::exit(1);
        }
    }
}
