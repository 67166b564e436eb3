//! Daemon entrypoint: brings up a bus (real GPIO hardware, behind the
//! `hardware` feature, or an in-process loopback pair for `--selftest`),
//! attaches the requested fixture devices, and runs the target set until a
//! signal or the embedded self-test initiator asks it to stop.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::info;

use scsi_target_core::bus::loopback::LoopbackBus;
use scsi_target_core::bus::{Bus, Phase, Signal};
use scsi_target_core::controller::{Controller, ShutdownMode};
use scsi_target_core::devices::host_services::HostServicesDevice;
use scsi_target_core::devices::memory_disk::MemoryDisk;
use scsi_target_core::target_set::TargetSet;

#[derive(Clone, Copy, Debug)]
enum FixtureDevice {
    HostServices,
    MemoryDisk,
}

/// `<target-id>:<fixture>`, e.g. `0:host-services`.
#[derive(Clone, Debug)]
struct TargetSpec {
    target_id: u8,
    device: FixtureDevice,
}

impl FromStr for TargetSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, device) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <target-id>:<fixture>, got '{s}'"))?;
        let target_id: u8 = id.parse().map_err(|_| format!("invalid target ID '{id}'"))?;
        let device = match device {
            "host-services" => FixtureDevice::HostServices,
            "memory-disk" => FixtureDevice::MemoryDisk,
            other => return Err(format!("unknown fixture device '{other}'")),
        };
        Ok(Self { target_id, device })
    }
}

#[derive(Parser)]
#[command(about = "SCSI/SASI parallel-bus target device emulator", long_about = None)]
struct Args {
    /// Target to bring up, as <target-id>:<fixture>. Repeatable.
    #[arg(long = "target", value_name = "ID:FIXTURE")]
    targets: Vec<TargetSpec>,

    /// Run the embedded self-test initiator against an in-process loopback
    /// bus instead of waiting on real hardware.
    #[arg(long)]
    selftest: bool,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn build_device(device: FixtureDevice) -> Box<dyn scsi_target_core::device::LogicalUnit> {
    match device {
        FixtureDevice::HostServices => Box::new(HostServicesDevice::new()),
        FixtureDevice::MemoryDisk => Box::new(MemoryDisk::new(0, 2048)),
    }
}

fn build_target_set(targets: &[TargetSpec]) -> Result<TargetSet> {
    let mut set = TargetSet::new();
    for spec in targets {
        let mut controller = Controller::new(spec.target_id);
        controller
            .add_device(0, build_device(spec.device))
            .map_err(|e| anyhow!(e))?;
        set.attach(controller).map_err(|e| anyhow!(e))?;
    }
    Ok(set)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.targets.is_empty() {
        bail!("at least one --target <id>:<fixture> is required");
    }

    if args.selftest {
        return run_selftest(&args.targets);
    }

    run_daemon(&args.targets)
}

#[cfg(feature = "hardware")]
fn run_daemon(targets: &[TargetSpec]) -> Result<()> {
    use scsi_target_core::bus::gpio::GpioBus;

    let mut set = build_target_set(targets)?;
    let mut bus = GpioBus::open().context("failed to initialize GPIO bus")?;
    bus.reset();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install SIGINT/SIGTERM handler")?;

    let target_ids = set.target_ids();
    info!("targets up: {target_ids:?}");
    while !shutdown.load(Ordering::SeqCst) {
        if !set.run_once(&mut bus) {
            break;
        }
    }
    for id in &target_ids {
        if let Some(c) = set.controller_mut(*id) {
            c.schedule_shutdown(ShutdownMode::Shutdown);
        }
    }
    info!("shutting down");
    Ok(())
}

#[cfg(not(feature = "hardware"))]
fn run_daemon(_targets: &[TargetSpec]) -> Result<()> {
    bail!("this build has no `hardware` feature; pass --selftest, or rebuild with --features hardware on a Raspberry Pi");
}

/// Runs the target set against an in-process loopback bus, driven by a
/// minimal embedded initiator on the current thread: SELECT the first
/// target, send an INQUIRY, and report the vendor string it returns.
fn run_selftest(targets: &[TargetSpec]) -> Result<()> {
    let mut set = build_target_set(targets)?;
    let target_id = targets[0].target_id;
    // Quit after this single connection rather than polling for another.
    if let Some(c) = set.controller_mut(target_id) {
        c.schedule_shutdown(ShutdownMode::Shutdown);
    }

    let mut target_bus = LoopbackBus::new(true);
    let mut initiator_bus = target_bus.handle(false);

    let worker = thread::spawn(move || {
        target_bus.mark_target_ready();
        set.run(&mut target_bus);
    });

    if !initiator_bus.wait_for_target() {
        bail!("target side never came up");
    }

    select_target(&mut initiator_bus, 7, target_id)?;

    let cdb = [0x12, 0x00, 0x00, 0x00, 36, 0x00];
    let (status, data) = run_command(&mut initiator_bus, &cdb, 36)?;
    info!("INQUIRY status {status:#04x}, vendor: {:?}", String::from_utf8_lossy(&data[8..16.min(data.len())]));

    worker.join().map_err(|_| anyhow!("target thread panicked"))?;
    println!("self-test OK: target {target_id} answered INQUIRY with status {status:#04x}");
    Ok(())
}

fn wait_phase(bus: &mut dyn Bus, phase: Phase, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        bus.acquire();
        if bus.get_phase() == phase {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out waiting for phase {phase:?}");
        }
    }
}

fn select_target(bus: &mut dyn Bus, initiator_id: u8, target_id: u8) -> Result<()> {
    bus.set_dat((1u8 << initiator_id) | (1u8 << target_id));
    bus.set_signal(Signal::Sel, true);
    let selected = bus.wait_handshake(Signal::Bsy, true);
    bus.set_signal(Signal::Sel, false);
    if !selected {
        bail!("target {target_id} did not respond to selection");
    }
    Ok(())
}

fn run_command(bus: &mut dyn Bus, cdb: &[u8], max_response: usize) -> Result<(u8, Vec<u8>)> {
    wait_phase(bus, Phase::Command, Duration::from_secs(1))?;
    if bus.initiator_send_handshake(cdb).count() != cdb.len() {
        bail!("CDB send incomplete");
    }

    let mut data = Vec::new();
    bus.acquire();
    if bus.is_phase(Phase::DataIn) {
        data = vec![0u8; max_response];
        let outcome = bus.initiator_receive_handshake(&mut data);
        data.truncate(outcome.count());
    }

    wait_phase(bus, Phase::Status, Duration::from_secs(1))?;
    let status = bus
        .initiator_byte_in()
        .ok_or_else(|| anyhow!("no STATUS byte received"))?;

    wait_phase(bus, Phase::MsgIn, Duration::from_secs(1))?;
    bus.initiator_msg_in_handshake()
        .ok_or_else(|| anyhow!("no MESSAGE IN byte received"))?;

    Ok((status, data))
}
