#![forbid(unsafe_code)]

//! Native runner for [`ember_machine::Machine`]: boots from local files instead of HTTP ranges.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ember_machine::events::MachineEvent;
use ember_machine::storage::FileRangeProvider;
use ember_machine::{ImageSource, Machine, MachineConfig, RunMode};
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Parser)]
#[command(about = "Boot an ember machine from local images (integration debugging)")]
struct Args {
    /// JSON machine configuration. Image URLs in it are paths relative to `--root`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory that relative image paths are resolved against.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// System BIOS image, mapped to end at 1 MiB.
    #[arg(long)]
    bios: Option<String>,

    /// VGA BIOS image, mapped at 0xC0000.
    #[arg(long)]
    vga_bios: Option<String>,

    /// Raw hard disk image attached as the primary master.
    #[arg(long)]
    hda: Option<String>,

    /// Snapshot to restore before running.
    #[arg(long)]
    initial_state: Option<String>,

    /// Guest RAM size in MiB.
    #[arg(long)]
    memory_mib: Option<usize>,

    /// VGA memory size in MiB.
    #[arg(long)]
    vga_memory_mib: Option<usize>,

    /// Number of macro-steps to run.
    #[arg(long, default_value_t = 1000)]
    steps: u64,

    /// Where to write serial output (`stdout` or a file path).
    #[arg(long, default_value = "stdout")]
    serial_out: String,

    /// Print the VGA text plane to stdout on exit.
    #[arg(long)]
    vga_text: bool,

    /// Save a snapshot on exit.
    #[arg(long)]
    snapshot_save: Option<PathBuf>,

    /// Wait for outstanding disk reads after every step, so the run does not depend on
    /// download timing. Without it the CPU keeps running while reads are in flight.
    #[arg(long)]
    reproducible: bool,
}

impl Args {
    fn machine_config(&self) -> Result<MachineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config: {}", path.display()))?;
                MachineConfig::from_json(&json)
                    .with_context(|| format!("invalid config: {}", path.display()))?
            }
            None => MachineConfig::default(),
        };

        if let Some(path) = &self.bios {
            config.bios = Some(ImageSource::new("BIOS", path.as_str()));
        }
        if let Some(path) = &self.vga_bios {
            config.vga_bios = Some(ImageSource::new("VGA BIOS", path.as_str()));
        }
        if let Some(path) = &self.hda {
            config.hda = Some(ImageSource::new(display_name(path), path.as_str()));
        }
        if let Some(path) = &self.initial_state {
            config.initial_state = Some(ImageSource::new(display_name(path), path.as_str()));
        }
        if let Some(mib) = self.memory_mib {
            config.memory_size = mib.checked_mul(MIB).context("memory size overflow")?;
        }
        if let Some(mib) = self.vga_memory_mib {
            config.vga_memory_size = mib.checked_mul(MIB).context("VGA memory size overflow")?;
        }
        // The runner drives the step loop itself.
        config.autostart = false;
        config.validate()?;
        Ok(config)
    }
}

fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = args.machine_config()?;
    let provider = Arc::new(FileRangeProvider::new(&args.root));

    let mut machine = Machine::boot(config, provider, Handle::current())
        .await
        .context("boot failed")?;
    let mut events = machine.subscribe();
    let mut serial_sink = open_sink(&args.serial_out)?;

    machine.start();
    for _ in 0..args.steps {
        machine.step();
        if args.reproducible {
            machine.quiesce().await;
        } else if machine.devices().first_busy().is_some() {
            // Let fetch tasks make progress on this runtime.
            tokio::task::yield_now().await;
        }
        stream_serial(&mut machine, &mut serial_sink)?;

        for event in events.drain() {
            if let MachineEvent::DownloadError { file_name } = event {
                warn!(%file_name, "download failed");
            }
        }
        if machine.cpu().mode() == RunMode::Shutdown {
            bail!(
                "cpu shut down after {} steps at eip {:#x}",
                machine.steps(),
                machine.cpu().regs.eip
            );
        }
    }
    machine.stop();
    stream_serial(&mut machine, &mut serial_sink)?;
    serial_sink.flush()?;

    info!(
        steps = machine.steps(),
        reproducible = args.reproducible,
        instructions = machine.cpu().instructions_retired(),
        "run finished"
    );

    if args.vga_text {
        println!("{}", machine.vga_text());
    }

    if let Some(path) = &args.snapshot_save {
        machine.quiesce().await;
        let blob = machine.save().context("snapshot save failed")?;
        std::fs::write(path, &blob)
            .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        info!(path = %path.display(), len = blob.len(), "snapshot written");
    }

    Ok(())
}

fn open_sink(dest: &str) -> Result<Box<dyn Write>> {
    if dest == "stdout" {
        return Ok(Box::new(io::stdout()));
    }
    let file = File::create(dest)
        .with_context(|| format!("failed to create serial output file: {dest}"))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn stream_serial(machine: &mut Machine, out: &mut dyn Write) -> Result<()> {
    let bytes = machine.take_serial_output();
    if !bytes.is_empty() {
        out.write_all(&bytes)?;
    }
    Ok(())
}
