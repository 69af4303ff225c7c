//! neo-sync CLI entrypoint.
//!
//! ```bash
//! neo-sync geometry --count 64 --width 64 --json
//! neo-sync simulate --backend tbx --events 4 --kernels 2 --packets 2
//! neo-sync simulate --hang --timeout-ms 50 --json
//! neo-sync config --config sync.json --json
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use neo_sync_core::csr::CsrBackend;
use neo_sync_core::device::{DeviceClock, TimestampWidth};
use neo_sync_core::types::DeviceId;
use neo_sync_core::{ErrorKind, Result, SyncConfig, SyncError};
use neo_sync_event::{
    Context, DriverHandle, Event, EventDesc, EventPoolDesc, EventPoolFlags, EventScope,
    PoolGeometry,
};
use neo_sync_sim::SimPlatform;
use neo_sync_timestamp::{EVENT_MAX_KERNEL_SPLIT, KernelTimestampResult};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "neo-sync",
    version,
    about = "GPU event synchronization engine over a simulated device",
    arg_required_else_help = true,
    after_help = "Examples:\n  neo-sync geometry --count 64 --json\n  neo-sync simulate --backend tbx --events 4 --kernels 2\n  neo-sync simulate --hang --timeout-ms 50 --json\n  neo-sync config --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute the slot layout of an event pool.
    Geometry(GeometryArgs),
    /// Complete events from a simulated GPU thread and wait on them from the host.
    Simulate(SimulateArgs),
    /// Print the effective configuration.
    Config(ConfigArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WidthArg {
    #[value(name = "32")]
    Bits32,
    #[value(name = "64")]
    Bits64,
}

impl From<WidthArg> for TimestampWidth {
    fn from(width: WidthArg) -> Self {
        match width {
            WidthArg::Bits32 => TimestampWidth::Bits32,
            WidthArg::Bits64 => TimestampWidth::Bits64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Hardware,
    Tbx,
    TbxWithAub,
    Aub,
}

impl From<BackendArg> for CsrBackend {
    fn from(backend: BackendArg) -> Self {
        match backend {
            BackendArg::Hardware => CsrBackend::Hardware,
            BackendArg::Tbx => CsrBackend::Tbx,
            BackendArg::TbxWithAub => CsrBackend::TbxWithAub,
            BackendArg::Aub => CsrBackend::Aub,
        }
    }
}

#[derive(Args, Debug)]
struct GeometryArgs {
    /// Number of events in the pool.
    #[arg(long = "count")]
    count: u32,

    /// Timestamp packets per event.
    #[arg(long = "max-packets", default_value_t = 16)]
    max_packets: u32,

    /// Timestamp word width in bits.
    #[arg(long = "width", value_enum, default_value_t = WidthArg::Bits32)]
    width: WidthArg,

    /// Event slot alignment in bytes (power of two).
    #[arg(long = "alignment", default_value_t = 64)]
    alignment: usize,

    /// Report the completion word of a timestamp pool.
    #[arg(long = "timestamp")]
    timestamp: bool,

    /// Emit machine-readable JSON on stdout.
    #[arg(long = "json")]
    json: bool,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long = "backend", value_enum, default_value_t = BackendArg::Hardware)]
    backend: BackendArg,

    /// Events to complete.
    #[arg(long = "events", default_value_t = 4)]
    events: u32,

    /// Kernels folded into each event.
    #[arg(long = "kernels", default_value_t = 1)]
    kernels: u32,

    /// Packets used by each kernel.
    #[arg(long = "packets", default_value_t = 1)]
    packets: u32,

    /// Delay before the simulated GPU completes the events.
    #[arg(long = "delay-ms", default_value_t = 5)]
    delay_ms: u64,

    /// Host wait timeout per event.
    #[arg(long = "timeout-ms", default_value_t = 1000)]
    timeout_ms: u64,

    /// Hang the simulated GPU instead of completing the events.
    #[arg(long = "hang")]
    hang: bool,

    /// JSON configuration file. `NEO_SYNC_*` variables apply on top.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Emit machine-readable JSON on stdout.
    #[arg(long = "json")]
    json: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON configuration file. `NEO_SYNC_*` variables apply on top.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Emit machine-readable JSON on stdout.
    #[arg(long = "json")]
    json: bool,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Geometry(args) if args.json => Some("geometry"),
        Commands::Simulate(args) if args.json => Some("simulate"),
        Commands::Config(args) if args.json => Some("config"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Geometry(args) => run_geometry(args),
        Commands::Simulate(args) => run_simulate(args),
        Commands::Config(args) => run_config(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn command_error_json(command: &str, err: &SyncError) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "kind": err.kind().as_str(),
        "code": err.error_code(),
    })
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => {
            let data = std::fs::read_to_string(path).map_err(|err| {
                SyncError::InvalidArgument(format!("cannot read config {}: {err}", path.display()))
            })?;
            SyncConfig::from_json_str(&data)?
        }
        None => SyncConfig::default(),
    };
    config.with_env_overrides()
}

// ─── geometry ───────────────────────────────────────────────────────────

fn run_geometry(args: GeometryArgs) -> Result<()> {
    if args.count == 0 {
        return Err(SyncError::InvalidArgument("--count must be at least 1".into()));
    }
    let geometry = PoolGeometry::new(
        args.width.into(),
        args.max_packets,
        EVENT_MAX_KERNEL_SPLIT,
        args.alignment,
    )?;
    let pool_size = geometry.pool_size(args.count)?;
    let completion_offset = geometry.layout().completion_offset(args.timestamp);

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "geometry",
                "ok": true,
                "count": args.count,
                "timestamp": args.timestamp,
                "geometry": geometry,
                "pool_size": pool_size,
                "completion_word_offset": completion_offset,
            })
        );
    } else {
        println!(
            "geometry: count={} width={} packets={} packet_size={} event_size={} pool_size={} completion_word_offset={}",
            args.count,
            geometry.width.bits(),
            geometry.max_event_packets,
            geometry.packet_size,
            geometry.event_size,
            pool_size,
            completion_offset
        );
    }
    Ok(())
}

// ─── simulate ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EventReport {
    index: u32,
    status: &'static str,
    wait_us: u64,
    kernels: u32,
    packets: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<KernelTimestampResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn run_simulate(args: SimulateArgs) -> Result<()> {
    if args.events == 0 || args.kernels == 0 || args.packets == 0 {
        return Err(SyncError::InvalidArgument(
            "--events, --kernels and --packets must be at least 1".into(),
        ));
    }
    let config = load_config(args.config.as_deref())?;
    let platform = SimPlatform::builder().backend(args.backend.into()).build()?;
    let driver = DriverHandle::new(
        platform.root_devices().to_vec(),
        platform.memory_manager(),
        Arc::new(config),
    )?;
    let context = Context::new(&driver, &[])?;
    let pool_handle = context.create_event_pool(
        &[],
        &EventPoolDesc {
            count: args.events,
            flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP,
        },
    )?;
    let pool = context.event_pool(pool_handle)?;
    let allocation = pool
        .allocation_for(0)
        .ok_or_else(|| SyncError::InvalidArgument("pool has no memory on root device 0".into()))?;
    let csr = platform
        .csr(DeviceId::root(0), 0)
        .ok_or_else(|| SyncError::InvalidArgument("simulated device has no engine".into()))?;
    let clock = platform
        .clock(0)
        .cloned()
        .ok_or_else(|| SyncError::InvalidArgument("simulated device has no clock".into()))?;

    let mut events = Vec::with_capacity(args.events as usize);
    let mut slots = Vec::with_capacity(args.events as usize);
    for index in 0..args.events {
        let handle = context.create_event(
            pool_handle,
            &EventDesc {
                index,
                signal_scope: EventScope::HOST,
                wait_scope: EventScope::HOST,
            },
        )?;
        let event = context.event(handle)?;
        plan_kernels(&event, args.kernels, args.packets)?;
        event.add_csr(csr.clone());
        let offset = (event.gpu_address(event.device()) - allocation.gpu_address) as usize;
        slots.push((offset, event.packets_in_use()));
        events.push(event);
    }
    info!(
        backend = CsrBackend::from(args.backend).as_str(),
        events = args.events,
        kernels = args.kernels,
        packets = args.packets,
        hang = args.hang,
        "Starting simulation"
    );

    let layout = pool.geometry().layout();
    let delay = Duration::from_millis(args.delay_ms);
    let hang = args.hang;
    let gpu = {
        let csr = csr.clone();
        let allocation = allocation.clone();
        thread::spawn(move || -> Result<()> {
            let start = clock.gpu_cpu_time()?.gpu_timestamp;
            thread::sleep(delay);
            if hang {
                csr.inject_hang();
                return Ok(());
            }
            for (offset, packets) in slots {
                let end = clock.gpu_cpu_time()?.gpu_timestamp;
                let bytes = layout.range_bytes(start, end).repeat(packets as usize);
                let task = csr.execute_write(&allocation, offset, &bytes)?;
                debug!(offset, packets, task, "Simulated GPU completed event");
            }
            Ok(())
        })
    };

    let timeout_ns = args.timeout_ms.saturating_mul(1_000_000);
    let started = Instant::now();
    let reports: Vec<EventReport> = events
        .iter()
        .map(|event| wait_for(event, timeout_ns))
        .collect();
    let elapsed = started.elapsed();

    gpu.join()
        .map_err(|_| SyncError::InvalidArgument("simulated GPU thread panicked".into()))??;

    let completed = reports.iter().filter(|r| r.status == "completed").count();
    let ok = completed == reports.len();
    if !ok {
        warn!(completed, total = reports.len(), "Not every event completed");
    }

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "simulate",
                "ok": ok,
                "backend": CsrBackend::from(args.backend).as_str(),
                "completed": completed,
                "elapsed_us": elapsed.as_micros() as u64,
                "downloads": csr.stats().downloads.load(std::sync::atomic::Ordering::Relaxed),
                "events": reports,
            })
        );
    } else {
        for report in &reports {
            println!(
                "event {}: status={} wait_us={} kernels={} packets={}",
                report.index, report.status, report.wait_us, report.kernels, report.packets
            );
        }
        println!(
            "simulate: completed={}/{} elapsed_ms={:.3}",
            completed,
            reports.len(),
            elapsed.as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

/// Fold `kernels` kernels of `packets` packets each into `event`.
fn plan_kernels(event: &Event, kernels: u32, packets: u32) -> Result<()> {
    event.set_packets_in_use(packets)?;
    for _ in 1..kernels {
        event.increase_kernel_count()?;
        event.set_packets_in_use(packets)?;
    }
    Ok(())
}

fn wait_for(event: &Event, timeout_ns: u64) -> EventReport {
    let start = Instant::now();
    let waited = event.host_synchronize(timeout_ns);
    let wait_us = start.elapsed().as_micros() as u64;
    let (status, timestamp, error) = match waited.and_then(|()| event.query_kernel_timestamp()) {
        Ok(timestamp) => ("completed", Some(timestamp), None),
        Err(err) => (err.kind().as_str(), None, Some(err.to_string())),
    };
    if status == ErrorKind::DeviceLost.as_str() {
        warn!(index = event.index(), "Device lost while waiting");
    }
    EventReport {
        index: event.index(),
        status,
        wait_us,
        kernels: event.kernel_count(),
        packets: event.packets_in_use(),
        timestamp,
        error,
    }
}

// ─── config ─────────────────────────────────────────────────────────────

fn run_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let rendered = serde_json::to_value(&config)
        .map_err(|err| SyncError::InvalidArgument(format!("cannot render config: {err}")))?;
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "config",
                "ok": true,
                "config": rendered,
            })
        );
    } else {
        let pretty = serde_json::to_string_pretty(&rendered)
            .map_err(|err| SyncError::InvalidArgument(format!("cannot render config: {err}")))?;
        println!("{pretty}");
    }
    Ok(())
}
