use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use forceplate::{
    logging, ConnectionManager, DeviceHandle, PlateConfig, SerialDriver, SimulatedDriver,
    StreamEnd, TransportDriver, CALIBRATION_REPLY,
};

#[derive(Parser, Debug)]
#[command(name = "forceplate-demo", about = "Stream samples from a dual force plate")]
struct Cli {
    /// Use the in-process simulated instrument instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List candidate serial ports
    List,
    /// Connect and print samples
    Stream {
        /// Serial port path (e.g., /dev/ttyUSB0); ignored with --simulate
        port: Option<String>,
        /// Number of samples to print before disconnecting
        #[arg(long, default_value_t = 20)]
        count: u64,
        #[command(flatten)]
        plate: PlateArgs,
    },
    /// Connect and run the calibration handshake
    Calibrate {
        port: Option<String>,
        /// Calibration timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[command(flatten)]
        plate: PlateArgs,
    },
}

#[derive(Args, Debug)]
struct PlateArgs {
    /// Raw code corresponding to full-scale force
    #[arg(long, default_value_t = 8_388_607)]
    max_raw_code: i32,
    /// Full-scale force in Newtons
    #[arg(long, default_value_t = 500.0)]
    max_force: f64,
    /// Nominal sampling rate in Hz
    #[arg(long, default_value_t = 1000)]
    rate: u32,
}

impl PlateArgs {
    fn config(&self) -> PlateConfig {
        PlateConfig::default()
            .with_calibration(self.max_raw_code, self.max_force)
            .with_sampling_rate(self.rate)
    }
}

fn main() {
    logging::init_rust_logging();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(Cli::parse())) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

/// Connection target: a real serial manager, or a simulated one plus its generator.
struct Target {
    manager: ConnectionManager,
    device: DeviceHandle,
    sim: Option<SimulatedDriver>,
}

fn target(simulate: bool, port: Option<String>, config: PlateConfig) -> Result<Target> {
    if simulate {
        let sim = SimulatedDriver::new();
        let device = sim.device();
        let manager = ConnectionManager::new(sim.clone(), config)?;
        return Ok(Target {
            manager,
            device,
            sim: Some(sim),
        });
    }
    let Some(port) = port else {
        bail!("a serial port is required (or pass --simulate)");
    };
    Ok(Target {
        manager: ConnectionManager::serial(config)?,
        device: DeviceHandle::new(port),
        sim: None,
    })
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::List => {
            let devices = if cli.simulate {
                SimulatedDriver::new().list_devices()?
            } else {
                SerialDriver.list_devices()?
            };
            if devices.is_empty() {
                println!("No serial ports found.");
            }
            for d in devices {
                match &d.description {
                    Some(desc) => println!("{}  ({})", d.path, desc),
                    None => println!("{}", d.path),
                }
            }
            Ok(())
        }
        Command::Stream { port, count, plate } => {
            let rate = plate.rate;
            let t = target(cli.simulate, port, plate.config())?;
            stream(t, count, rate).await
        }
        Command::Calibrate {
            port,
            timeout_ms,
            plate,
        } => {
            let config = plate
                .config()
                .with_calibration_timeout(Duration::from_millis(timeout_ms));
            let t = target(cli.simulate, port, config)?;
            calibrate(t).await
        }
    }
}

async fn stream(t: Target, count: u64, rate: u32) -> Result<()> {
    let Target {
        manager,
        device,
        sim,
    } = t;
    println!("--- Connecting to {} ---", device);
    manager
        .connect(&device)
        .await
        .with_context(|| format!("could not connect to {device}"))?;
    let mut samples = manager.subscribe()?;

    let stop = Arc::new(AtomicBool::new(false));
    let generator = match &sim {
        Some(sim) => Some(sim.spawn_generator(rate, stop.clone())?),
        None => None,
    };

    let mut received = 0;
    while received < count {
        match tokio::time::timeout(Duration::from_secs(2), samples.recv()).await {
            Ok(Ok(s)) => {
                println!(
                    "[{:>6}] t={} | L: {:>8.2?} | R: {:>8.2?} | total {:.2} N",
                    s.sample_index,
                    s.timestamp_ms(),
                    s.left_channels,
                    s.right_channels,
                    s.total()
                );
                received += 1;
            }
            Ok(Err(StreamEnd::Faulted(e))) => {
                stop.store(true, Ordering::Relaxed);
                bail!("connection faulted: {e}");
            }
            Ok(Err(StreamEnd::Closed)) => break,
            Err(_) => {
                println!("No data for 2s, giving up.");
                break;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    let stats = manager.stats();
    manager.disconnect();
    if let Some(handle) = generator {
        let _ = handle.join();
    }
    info!("stream finished: {:?}", stats);
    println!(
        "Done. samples={} corrupted={} gaps={} bytes={}",
        stats.samples_decoded, stats.corrupted_frames, stats.timestamp_gaps, stats.bytes_received
    );
    Ok(())
}

async fn calibrate(t: Target) -> Result<()> {
    let Target {
        manager,
        device,
        sim,
    } = t;
    if let Some(sim) = &sim {
        sim.reply_to_calibration(Some(CALIBRATION_REPLY.to_vec()));
    }
    manager
        .connect(&device)
        .await
        .with_context(|| format!("could not connect to {device}"))?;
    println!("Calibrating {} ...", device);
    let result = manager.start_calibration().await;
    manager.disconnect();
    result?;
    println!("Calibration acknowledged.");
    Ok(())
}
