use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;

use cpu::{DiskImage, Machine, MachineConfig, RunOutcome, DEFAULT_RAM_PAGES};

/// Simulate the MIT CADR Lisp machine processor.
#[derive(Debug, Parser)]
#[command(name = "cadr")]
struct Cli {
    /// Boot PROM image to start executing from.
    #[arg(long, value_name = "FILE", default_value = "promh.mcr")]
    prom: PathBuf,

    /// Disk pack image (a labelled Trident pack).
    #[arg(long, value_name = "FILE")]
    disk: Option<PathBuf>,

    /// Write the (possibly modified) disk pack back on exit.
    #[arg(long, requires = "disk")]
    save_disk: bool,

    /// Main-memory snapshot file, used by --warm-boot and saved on
    /// halt.
    #[arg(long, value_name = "FILE")]
    snapshot: Option<PathBuf>,

    /// Restore main memory from the snapshot once the boot PROM is
    /// switched out, skipping the cold boot.
    #[arg(short = 'w', long)]
    warm_boot: bool,

    /// Dump the processor state when the run ends.
    #[arg(short = 'd', long)]
    dump_state: bool,

    /// Number of 256-word RAM pages.
    #[arg(long, default_value_t = DEFAULT_RAM_PAGES)]
    ram_pages: usize,

    /// Stop after this many cycles instead of running until a halt.
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn run_simulator() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // See
    // https://docs.rs/tracing-subscriber/0.2.19/tracing_subscriber/fmt/index.html#filtering-events-with-environment-variables
    // for instructions on how to select which trace messages get
    // printed.
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let filter_layer = match tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
    {
        Err(e) => {
            return Err(Box::new(e));
        }
        Ok(layer) => layer,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let mut machine = Machine::new(MachineConfig {
        ram_pages: cli.ram_pages,
        warm_boot: cli.warm_boot,
        snapshot_file: cli.snapshot.clone(),
        max_cycles: cli.max_cycles,
        ..MachineConfig::default()
    });

    let mut prom_file = BufReader::new(File::open(&cli.prom)?);
    machine.load_prom(&mut prom_file)?;
    event!(Level::INFO, "loaded boot prom {}", cli.prom.display());

    if let Some(disk_path) = &cli.disk {
        let bytes = std::fs::read(disk_path)?;
        machine.attach_disk(DiskImage::from_bytes(&bytes)?);
        event!(Level::INFO, "attached disk {}", disk_path.display());
    }

    let outcome = machine.run();
    event!(
        Level::INFO,
        "run ended after {} cycles: {:?}",
        machine.cycles(),
        outcome
    );

    if cli.dump_state {
        let stdout = std::io::stdout();
        machine.dump_state(&mut stdout.lock())?;
    }

    if outcome == RunOutcome::Halted {
        if let Some(snapshot_path) = &cli.snapshot {
            let mut out = BufWriter::new(File::create(snapshot_path)?);
            machine.save_snapshot(&mut out)?;
            event!(Level::INFO, "memory snapshot saved to {}", snapshot_path.display());
        }
    }

    if cli.save_disk {
        // The flag requires --disk, so both paths exist here.
        if let (Some(disk_path), Some(image)) = (&cli.disk, machine.disk_image()) {
            let mut out = BufWriter::new(File::create(disk_path)?);
            for word in image.words() {
                out.write_all(&word.to_le_bytes())?;
            }
            out.flush()?;
            event!(Level::INFO, "disk image saved to {}", disk_path.display());
        }
    }

    Ok(())
}

fn main() {
    match run_simulator() {
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
        Ok(()) => {
            exit(0);
        }
    }
}
