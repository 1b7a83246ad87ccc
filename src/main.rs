//! vshark CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use vshark_core::capture_file::read_frames;
use vshark_core::dissect::{cancel_pair, Dissector, Progress};
use vshark_core::{logging, CaptureLoop, CaptureOptions, CaptureSource, Config, FilterSpec};

#[derive(Parser, Debug)]
#[command(name = "vshark", version, about = "Conversation-level packet capture and tshark dissection")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture from an interface or replay a file, printing one line per packet
    Capture {
        /// Interface to capture on (defaults to the configured one)
        #[arg(short, long, conflicts_with = "file")]
        interface: Option<String>,

        /// Replay a pcap/pcapng file instead of capturing live
        #[arg(short = 'r', long)]
        file: Option<PathBuf>,

        /// BPF capture filter, e.g. "tcp port 443"
        #[arg(short, long)]
        filter: Option<String>,

        /// Keep only packets touching these ports
        #[arg(short, long)]
        port: Vec<u16>,

        /// Keep only packets of processes matching this glob
        #[arg(long)]
        process: Option<String>,

        /// Write the delivered frames to this pcap file on exit
        #[arg(short = 'w', long)]
        save: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Dissect a capture file with tshark and print typed layer summaries
    Dissect {
        file: PathBuf,

        /// Print tshark's JSON records instead of summaries
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_or_default(path),
        None => Config::default(),
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&config.logging.level));

    match cli.command {
        Command::Capture {
            interface,
            file,
            filter,
            port,
            process,
            save,
            duration,
        } => {
            let source = match file {
                Some(path) => CaptureSource::File(path),
                None => CaptureSource::Device(interface.unwrap_or_else(|| config.capture.interface.clone())),
            };
            let filter = filter.or_else(|| config.capture.bpf_filter.clone());
            let spec = (!port.is_empty() || process.is_some()).then(|| FilterSpec {
                include_ports: port,
                process,
                ..FilterSpec::default()
            });
            capture(&config, source, filter, spec, save, duration.map(Duration::from_secs)).await
        }
        Command::Dissect { file, json } => dissect(&config, file, json).await,
    }
}

async fn capture(
    config: &Config,
    source: CaptureSource,
    bpf_filter: Option<String>,
    spec: Option<FilterSpec>,
    save: Option<PathBuf>,
    duration: Option<Duration>,
) -> Result<()> {
    let capture = Arc::new(CaptureLoop::new(CaptureOptions::from(&config.capture)));
    capture.set_filter(spec).context("invalid packet filter")?;

    let replay = matches!(source, CaptureSource::File(_));
    capture
        .start(source, bpf_filter.as_deref(), |packet| println!("{:>6} {}", packet.number, packet.summary()))
        .context("failed to start capture")?;

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    let drained = async {
        loop {
            if replay && capture.source_exhausted() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!(event.name = "cli.interrupted"),
        _ = deadline => debug!(event.name = "cli.deadline"),
        _ = drained => {}
    }

    let stopper = Arc::clone(&capture);
    let stats = tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("capture shutdown task failed")??;

    println!();
    for (key, packets) in capture.flows() {
        let (a, b) = key.endpoints();
        let name = capture
            .dns_cache()
            .lookup(&b.ip)
            .or_else(|| capture.dns_cache().lookup(&a.ip));
        match name {
            Some(name) => println!("{key}  {} packet(s)  [{name}]", packets.len()),
            None => println!("{key}  {} packet(s)", packets.len()),
        }
    }
    println!(
        "{} received, {} delivered, {} DNS, {} filtered",
        stats.received, stats.delivered, stats.dns, stats.filtered
    );

    if let Some(path) = save {
        let written = capture
            .write_capture(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {written} frame(s) to {}", path.display());
    }
    Ok(())
}

async fn dissect(config: &Config, file: PathBuf, json: bool) -> Result<()> {
    let frames = read_frames(&file).with_context(|| format!("failed to read {}", file.display()))?;
    let dissector = Dissector::from_config(&config.dissector);

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    let progress = |p: Progress| debug!(event.name = "cli.progress", progress = ?p);

    if json {
        for record in dissector.convert_frames(&frames, &token, progress).await? {
            println!("{record}");
        }
        return Ok(());
    }

    let results = dissector.analyze_frames(&frames, &token, progress).await?;
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(packet) => {
                let number = packet.number.unwrap_or(i as u64 + 1);
                println!("#{number}");
                for layer in &packet.layers {
                    println!("  {layer}");
                }
            }
            Err(e) => warn!(event.name = "cli.record_skipped", record = i + 1, error = %e, "skipping record"),
        }
    }
    Ok(())
}
