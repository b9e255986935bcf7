//! Command-line interface for hwsched

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use hwsched::stress::{run_producers, LoadSpec, ProducerReport};
use hwsched::{
    ContextFlags, ContextParams, FaultCause, FaultReport, Scheduler, SchedulerConfig,
    SchedulerStats, SimHardware,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "hwsched")]
#[command(version = hwsched::VERSION)]
#[command(about = "GPU command scheduler driven by simulated hardware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output verbosity
    #[arg(short, long, value_enum, default_value_t = Verbosity::Normal)]
    verbosity: Verbosity,
}

#[derive(Subcommand)]
enum Commands {
    /// Push synthetic work through the scheduler
    Run {
        /// Number of contexts, spread over the priority buckets
        #[arg(short, long, default_value_t = 4)]
        contexts: usize,

        /// Submissions per context
        #[arg(short, long, default_value_t = 64)]
        submissions: usize,

        /// Commands per submission
        #[arg(long, default_value_t = 2)]
        batch: usize,

        /// IBs per command
        #[arg(long, default_value_t = 4)]
        ibs: usize,

        /// Append a marker to every n-th submission (0 = never)
        #[arg(long, default_value_t = 8)]
        marker_every: usize,

        /// Refuse this many submissions with "busy" first
        #[arg(long, default_value_t = 0)]
        busy: u32,

        /// Inject a fault once the producers finish
        #[arg(long, value_enum)]
        inject_fault: Option<FaultKind>,

        /// Configuration file (JSON); defaults otherwise
        #[arg(long, env = "HWSCHED_CONFIG")]
        config: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Export final stats to a JSON file
        #[arg(long)]
        json_output: Option<String>,
    },

    /// Print or validate a configuration
    Config {
        /// File to validate; prints the preset if omitted
        #[arg(short, long)]
        file: Option<String>,

        /// Preset to print
        #[arg(long, value_enum, default_value_t = Preset::Default)]
        preset: Preset,
    },

    /// Show version information
    Version,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    Minimal,
    Normal,
    Detailed,
    Debug,
}

impl Verbosity {
    fn filter(self) -> &'static str {
        match self {
            Verbosity::Minimal => "warn",
            Verbosity::Normal => "info",
            Verbosity::Detailed => "debug",
            Verbosity::Debug => "trace",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Preset {
    Default,
    Quick,
    Debug,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FaultKind {
    PageFault,
    Hang,
    Fatal,
}

impl FaultKind {
    fn cause(self) -> FaultCause {
        match self {
            FaultKind::PageFault => FaultCause::PAGE_FAULT,
            FaultKind::Hang => FaultCause::FW_HANG,
            FaultKind::Fatal => FaultCause::FW_FATAL,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.verbosity.filter()))
        .init();
    hwsched::init();

    match cli.command {
        Commands::Run {
            contexts,
            submissions,
            batch,
            ibs,
            marker_every,
            busy,
            inject_fault,
            config,
            format,
            json_output,
        } => {
            let config = match config {
                Some(path) => SchedulerConfig::from_json_file(&path)
                    .with_context(|| format!("loading config from {}", path))?,
                None => SchedulerConfig::default(),
            };
            let spec = LoadSpec {
                submissions,
                batch,
                ibs,
                marker_every,
            };
            let (stats, reports, elapsed) = run(config, contexts, spec, busy, inject_fault)?;

            match format {
                OutputFormat::Text => print_run_text(&stats, &reports, elapsed),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }

            if let Some(path) = json_output {
                let json = serde_json::to_string_pretty(&stats)?;
                std::fs::write(&path, json).with_context(|| format!("writing {}", path))?;
                println!("\n✅ Stats exported to: {}", path);
            }
        }

        Commands::Config { file, preset } => match file {
            Some(path) => {
                let config = SchedulerConfig::from_json_file(&path)
                    .with_context(|| format!("loading config from {}", path))?;
                println!("✅ {} is valid", path);
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            None => {
                let config = match preset {
                    Preset::Default => SchedulerConfig::default(),
                    Preset::Quick => SchedulerConfig::quick(),
                    Preset::Debug => SchedulerConfig::debug(),
                };
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },

        Commands::Version => {
            println!("hwsched v{}", hwsched::version());
            println!("GPU command dispatch scheduler");
        }
    }

    Ok(())
}

fn run(
    config: SchedulerConfig,
    contexts: usize,
    spec: LoadSpec,
    busy: u32,
    fault: Option<FaultKind>,
) -> anyhow::Result<(SchedulerStats, Vec<ProducerReport>, Duration)> {
    let gpu = SimHardware::auto_retiring();
    gpu.inject_busy(busy);
    let priorities = config.num_priorities;
    let scheduler = Scheduler::new(config, gpu.interfaces())?;

    let ids = (0..contexts)
        .map(|i| {
            scheduler.create_context(ContextParams {
                priority: i % priorities,
                flags: ContextFlags::empty(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    println!("🚀 Driving {} contexts x {} submissions...", contexts, spec.submissions);
    let bar = ProgressBar::new((contexts * spec.submissions) as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} submissions ({elapsed})") {
        bar.set_style(style);
    }

    let start = Instant::now();
    let reports = run_producers(&scheduler, &ids, spec, || bar.inc(1));
    bar.finish();

    if let (Some(kind), Some(&first)) = (fault, ids.first()) {
        let last = reports.first().map(|r| r.last_timestamp).unwrap_or(0);
        println!("💥 Injecting {:?} on ctx {} ts {}", kind.cause(), first, last);
        scheduler.report_fault(FaultReport::for_object(kind.cause(), first, last));
    }

    scheduler
        .wait_idle(Duration::from_secs(30))
        .context("waiting for the scheduler to go idle")?;
    Ok((scheduler.stats(), reports, start.elapsed()))
}

fn print_run_text(stats: &SchedulerStats, reports: &[ProducerReport], elapsed: Duration) {
    println!("\n📊 Run Summary:");
    println!("================");
    println!("Elapsed: {:.2?}", elapsed);
    println!("Submitted: {}", stats.submitted);
    println!("Retired: {}", stats.retired);
    println!("Requeued: {}", stats.requeued);
    println!("Dispatch passes: {}", stats.passes);
    println!("Power vote taken: {} time(s)", stats.power_acquisitions);

    println!("\nContexts:");
    for report in reports {
        println!(
            "  • ctx {}: {} accepted, {} timed out, {} rejected, last ts {}",
            report.context, report.accepted, report.timed_out, report.rejected, report.last_timestamp
        );
    }

    if !stats.fault_history.is_empty() {
        println!("\nFaults:");
        for record in &stats.fault_history {
            println!(
                "  • {} {:?}: culprits {:?}, invalidated {:?}, replayed {}, dropped {}",
                record.at.format("%H:%M:%S%.3f"),
                record.cause,
                record.culprits,
                record.invalidated,
                record.replayed,
                record.dropped
            );
        }
    }
}
