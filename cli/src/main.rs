//! bagport - Command-line interface for the bagging engine.
//!
//! Thin glue around `bagport-engine`: argument parsing, metadata assembly,
//! confirmation prompts for destructive operations, and status output on
//! stderr. All transfer and verification work happens in the engine.

mod logging;

use anyhow::{anyhow, bail, Context, Result};
use bagport_engine::{
    create_job, run_job, BagItLibrary, BagMetadata, ChecksumAlgorithm, JobOptions, JobReport,
    LayoutMode, OperationMode, Phase, ProgressCallback, TransferJob, TransferPlan,
};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// bagport - Integrity-verified bagging and unbagging
#[derive(Parser, Debug)]
#[command(name = "bagport")]
#[command(version)]
#[command(about = "Create, unpack, validate and update BagIt bags with verified copies")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Checksum algorithm for new manifests: md5, sha256, or sha512
    #[arg(short = 'a', long, value_name = "ALGORITHM", default_value = "sha256", global = true)]
    algorithm: String,

    /// Work inside the source directory instead of copying to a destination
    #[arg(short = 'i', long = "inplace", global = true)]
    inplace: bool,

    /// Unbag into the objects/ and metadata/submissionDocumentation/ layout
    #[arg(short = 'A', long, global = true)]
    archivematica: bool,

    /// Read bag-info fields from a JSON file (overrides metadata flags)
    #[arg(short = 'j', long, value_name = "FILE", global = true)]
    json: Option<PathBuf>,

    /// Suppress status output and confirmation prompts
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Number of parallel hashing workers
    #[arg(short = 'p', long, value_name = "N", default_value_t = 1, global = true)]
    processes: usize,

    /// Verify by file count and total size instead of checksums
    #[arg(short = 'f', long, global = true)]
    fast: bool,

    /// Do not copy tag files and unbag.txt next to the unbagged payload
    #[arg(short = 'x', long, global = true)]
    no_bag_files: bool,

    /// Regenerate payload manifests when updating
    #[arg(short = 'r', long = "regen", global = true)]
    regen: bool,

    /// Do not write checksum.<alg> into metadata/ (with --archivematica)
    #[arg(short = 'X', long, global = true)]
    no_manifest: bool,

    /// Skip confirmation prompts
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(flatten)]
    metadata: MetadataArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Package sources into a new bag (SOURCE... DEST, or one SOURCE with --inplace)
    Bag {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Extract a bag's payload into DEST (or in place with --inplace)
    Unbag {
        bag: PathBuf,
        dest: Option<PathBuf>,
    },

    /// Check a bag against its manifests
    Validate { bag: PathBuf },

    /// Rewrite a bag's info fields, optionally regenerating manifests
    Update { bag: PathBuf },
}

/// bag-info fields settable from the command line.
#[derive(clap::Args, Debug, Default)]
struct MetadataArgs {
    #[arg(long, value_name = "TEXT", global = true)]
    accession_number: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    department: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    contact_name: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    contact_title: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    contact_email: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    contact_phone: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    contact_address: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    records_schedule_number: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    bag_size: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    record_dates: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    description: Option<String>,
    #[arg(long, value_name = "TEXT", global = true)]
    notes: Option<String>,
}

impl MetadataArgs {
    /// Field labels as written to bag-info.txt, paired with their values.
    fn fields(&self) -> [(&'static str, Option<&String>); 12] {
        [
            ("accession number", self.accession_number.as_ref()),
            ("department", self.department.as_ref()),
            ("contact name", self.contact_name.as_ref()),
            ("contact title", self.contact_title.as_ref()),
            ("contact email", self.contact_email.as_ref()),
            ("contact phone", self.contact_phone.as_ref()),
            ("contact address", self.contact_address.as_ref()),
            ("records schedule number", self.records_schedule_number.as_ref()),
            ("bag size", self.bag_size.as_ref()),
            ("record dates", self.record_dates.as_ref()),
            ("description", self.description.as_ref()),
            ("notes", self.notes.as_ref()),
        ]
    }

    fn any_given(&self) -> bool {
        self.fields().iter().any(|(_, value)| value.is_some())
    }
}

/// CLI implementation of ProgressCallback: one status line per phase
struct CliProgress {
    verbose: bool,
    quiet: bool,
    files: AtomicU64,
    bytes: AtomicU64,
}

impl CliProgress {
    const STATUS_WIDTH: usize = 20;

    fn new(verbose: bool, quiet: bool) -> Self {
        CliProgress {
            verbose,
            quiet,
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    /// Status text for a phase, if the phase is worth announcing.
    fn status_message(mode: OperationMode, phase: Phase) -> Option<&'static str> {
        match phase {
            Phase::Validating => Some("validating bag"),
            Phase::Staging => Some("staging files"),
            Phase::PreHashing => Some("hashing files"),
            Phase::Copying => Some("copying files"),
            Phase::PostVerify => Some("validating copies"),
            Phase::ExternalPackaging => match mode {
                OperationMode::Bag => Some("creating bag"),
                OperationMode::Unbag => Some("writing manifest"),
                OperationMode::Update => Some("updating bag"),
                OperationMode::Validate => None,
            },
            Phase::MetadataFinalize => Some("finalizing"),
            Phase::Idle | Phase::Planning | Phase::Done | Phase::Aborted => None,
        }
    }

    /// `msg` padded with dots to the status width, ending in `done!`.
    fn finished_line(msg: &str) -> String {
        let dots = Self::STATUS_WIDTH.saturating_sub(msg.len()).max(3);
        format!("{}{}done!", msg, ".".repeat(dots))
    }
}

impl ProgressCallback for CliProgress {
    fn on_phase_started(&self, job: &TransferJob, phase: Phase) {
        if phase == Phase::Copying {
            self.files.store(0, Ordering::Relaxed);
            self.bytes.store(0, Ordering::Relaxed);
        }
        if self.quiet {
            return;
        }
        if let Some(msg) = Self::status_message(job.mode, phase) {
            eprint!("\r{}...", msg);
            let _ = io::stderr().flush();
        }
    }

    fn on_phase_completed(&self, job: &TransferJob, phase: Phase) {
        if self.quiet {
            return;
        }
        let Some(msg) = Self::status_message(job.mode, phase) else {
            return;
        };
        let mut line = Self::finished_line(msg);
        if self.verbose && phase == Phase::Copying {
            line.push_str(&format!(
                " ({} files, {})",
                self.files.load(Ordering::Relaxed),
                Self::format_bytes(self.bytes.load(Ordering::Relaxed))
            ));
        }
        eprintln!("\r{}", line);
    }

    fn on_file_transferred(&self, _src: &Path, _dst: &Path, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_job_completed(&self, _job: &TransferJob, report: &JobReport) {
        if self.verbose && !self.quiet {
            eprintln!(
                "Verified {} manifest entries ({})",
                report.verified_entries,
                report.verification.description()
            );
        }
    }
}

/// Elapsed time in the largest sensible unit.
fn duration_text(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 120.0 {
        format!("completed in {} seconds", secs.round() as u64)
    } else if secs < 7200.0 {
        format!("completed in {} minutes", (secs / 60.0).round() as u64)
    } else {
        let hours = (secs / 3600.0 * 100.0).round() / 100.0;
        format!("completed in {} hours", hours)
    }
}

/// Closing line naming where the result is.
fn end_text(mode: OperationMode, in_place: bool, fast: bool, report: &JobReport) -> String {
    let destination = report.destination.display();
    match mode {
        OperationMode::Bag if in_place => format!("bag saved in place at {}", destination),
        OperationMode::Bag => format!("bag saved to {}", destination),
        OperationMode::Unbag if in_place => format!("files unbagged in place at {}", destination),
        OperationMode::Unbag => format!("files unbagged to {}", destination),
        OperationMode::Validate if fast => "bag is valid! (fast scan)".to_string(),
        OperationMode::Validate => "bag is valid!".to_string(),
        OperationMode::Update => format!("updated bag: {}", destination),
    }
}

/// Ask a yes/no question on stdin until answered. End of input counts as no.
fn confirm(question: &str) -> Result<bool> {
    let stdin = io::stdin();
    loop {
        eprint!("{} (y/n) ", question);
        io::stderr().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            return Ok(false);
        }
        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => eprintln!("invalid selection"),
        }
    }
}

/// Split the subcommand into a mode and a transfer plan.
fn build_plan(args: &Args) -> Result<(OperationMode, TransferPlan)> {
    let layout = if args.archivematica {
        LayoutMode::Archival
    } else {
        LayoutMode::Direct
    };

    let (mode, sources, destination_root) = match &args.command {
        Command::Bag { paths } => {
            if args.inplace {
                if paths.len() != 1 {
                    bail!("bag --inplace takes exactly one source and no destination");
                }
                (OperationMode::Bag, paths.clone(), None)
            } else {
                let Some((dest, sources)) = paths.split_last() else {
                    bail!("bag requires at least one source and a destination");
                };
                if sources.is_empty() {
                    bail!("bag requires a destination after the sources");
                }
                (OperationMode::Bag, sources.to_vec(), Some(dest.clone()))
            }
        }
        Command::Unbag { bag, dest } => {
            match (args.inplace, dest) {
                (true, Some(_)) => bail!("unbag --inplace takes no destination"),
                (false, None) => bail!("unbag requires a destination unless --inplace is given"),
                _ => {}
            }
            (OperationMode::Unbag, vec![bag.clone()], dest.clone())
        }
        Command::Validate { bag } => (OperationMode::Validate, vec![bag.clone()], None),
        Command::Update { bag } => (OperationMode::Update, vec![bag.clone()], None),
    };

    if args.inplace && !matches!(mode, OperationMode::Bag | OperationMode::Unbag) {
        bail!("--inplace only applies to bag and unbag");
    }

    for source in &sources {
        if !source.exists() {
            bail!("Source does not exist: {}", source.display());
        }
    }

    Ok((
        mode,
        TransferPlan {
            sources,
            destination_root,
            layout,
            in_place: args.inplace,
        },
    ))
}

/// Fields for bag and update: the JSON file when given, otherwise the flags.
fn load_metadata(args: &Args) -> Result<BagMetadata> {
    match &args.json {
        Some(path) => {
            if args.metadata.any_given() {
                tracing::warn!(json = %path.display(), "metadata flags ignored in favour of JSON file");
            }
            BagMetadata::from_json_file(path)
                .with_context(|| format!("Failed to load metadata from {}", path.display()))
        }
        None => Ok(BagMetadata::from_fields(args.metadata.fields())),
    }
}

/// Parse command-line arguments, then run the job
fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init_logging(args.verbose, args.quiet) {
        eprintln!("Warning: {:#}", e);
    }

    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<()> {
    let algorithm: ChecksumAlgorithm = args.algorithm.parse().map_err(|_| {
        anyhow!(
            "Invalid checksum algorithm '{}'. Must be 'md5', 'sha256', or 'sha512'",
            args.algorithm
        )
    })?;

    if args.processes == 0 {
        bail!("--processes must be at least 1");
    }

    let (mode, plan) = build_plan(args)?;

    let regenerate = mode == OperationMode::Update && args.regen;
    let metadata = match mode {
        OperationMode::Bag | OperationMode::Update => load_metadata(args)?,
        OperationMode::Unbag | OperationMode::Validate => BagMetadata::default(),
    };
    if mode == OperationMode::Update && metadata.fields.is_empty() && !regenerate {
        bail!("update needs metadata fields (flags or --json) or --regen");
    }

    if !args.quiet && !args.yes {
        let question = match mode {
            OperationMode::Unbag if args.inplace => Some((
                "WARNING: unbagging in place will remove the original bag - are you sure?",
                "unbag cancelled",
            )),
            OperationMode::Update if regenerate => Some((
                "WARNING: are you sure you want to overwrite the current manifests?",
                "manifest regeneration cancelled",
            )),
            _ => None,
        };
        if let Some((question, cancel_text)) = question {
            if !confirm(question)? {
                eprintln!("{}", cancel_text);
                return Ok(());
            }
        }
    }

    let options = JobOptions {
        algorithm,
        processes: args.processes,
        fast: args.fast,
        copy_bag_files: !args.no_bag_files,
        archival_manifest: !args.no_manifest,
        regenerate_manifests: regenerate,
        info: metadata.fields,
        submission_documents: if mode == OperationMode::Bag {
            metadata.submission_documents
        } else {
            Vec::new()
        },
    };

    let mut job = create_job(mode, plan, options).context("Job creation failed")?;
    let library = BagItLibrary::new(args.processes);
    let progress = CliProgress::new(args.verbose, args.quiet);

    let start = Instant::now();
    let report = match run_job(&mut job, &library, Some(&progress)) {
        Ok(report) => report,
        Err(e) => {
            if !args.quiet {
                eprintln!();
            }
            let phase = job.aborted_in.unwrap_or(job.phase);
            return Err(anyhow::Error::new(e).context(format!("{} aborted during {}", mode, phase)));
        }
    };

    if !args.quiet {
        println!();
        println!("{}", duration_text(start.elapsed()));
        println!("{}", end_text(mode, args.inplace, args.fast, &report));
    }

    Ok(())
}
