use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use umh_link::config::BAUD_RATE;
use umh_link::port::is_denied;
use umh_link::sim::SimulatedPorts;
use umh_link::{
    logging, DeviceSnapshot, HapticsLink, LinkConfig, PortOpener, Stimulation, SystemPorts, Vec3,
};

/// How long to wait for a reply to a one-shot request.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "umh-link", about = "Talk to an ultrasonic haptics array over serial")]
struct Args {
    /// Serial baud rate
    #[arg(long, global = true, default_value_t = BAUD_RATE)]
    baud: u32,
    /// Connect to this port directly instead of scanning
    #[arg(long, global = true)]
    port: Option<String>,
    /// Use simulated ports with a simulated array instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports
    Ports,
    /// Probe every port and report which one answers
    Scan,
    /// Print the device status once
    Status,
    /// Print the array configuration
    Config,
    /// Focus a point at X Y Z (meters)
    Point {
        x: f32,
        y: f32,
        z: f32,
        #[arg(long, default_value_t = umh_link::device::DEFAULT_STRENGTH)]
        strength: f32,
        #[arg(long, default_value_t = umh_link::device::DEFAULT_FREQUENCY_HZ)]
        frequency: f32,
    },
    /// Switch the output stage on or off
    Enable { state: Switch },
    /// Poll and print status for a while
    Monitor {
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
        /// Status requests per second
        #[arg(long, default_value_t = 2.0)]
        rate: f32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn opener(simulate: bool) -> Arc<dyn PortOpener> {
    if simulate {
        let ports = SimulatedPorts::new();
        ports.add_silent("SIM0");
        ports.add_device("SIM1");
        ports.add_silent("Bluetooth-Incoming-Port");
        Arc::new(ports)
    } else {
        Arc::new(SystemPorts)
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = LinkConfig {
        baud_rate: args.baud,
        status_poll_hz: 0.0,
        ..LinkConfig::default()
    };
    let link = HapticsLink::new(opener(args.simulate), config.clone())
        .context("invalid link configuration")?;

    match args.command {
        Cmd::Ports => {
            let ports = link.available_ports().context("listing serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                if is_denied(&port, &config.port_denylist) {
                    println!("{port}  (skipped by scan)");
                } else {
                    println!("{port}");
                }
            }
        }
        Cmd::Scan => {
            if !link.scan() {
                bail!("no device answered");
            }
            println!("Device found on {}", link.port_name().unwrap_or_default());
        }
        Cmd::Status => {
            connect(&link, args.port.as_deref(), args.baud)?;
            link.get_status();
            let snapshot = await_reply(&link, |s| s.status.is_some())?;
            if let Some(status) = snapshot.status {
                println!("{status:#?}");
            }
        }
        Cmd::Config => {
            connect(&link, args.port.as_deref(), args.baud)?;
            link.get_config();
            let snapshot = await_reply(&link, |s| s.config.is_some())?;
            if let Some(config) = snapshot.config {
                println!("{config:#?}");
            }
        }
        Cmd::Point {
            x,
            y,
            z,
            strength,
            frequency,
        } => {
            connect(&link, args.port.as_deref(), args.baud)?;
            let stimulation = Stimulation::point(Vec3::new(x, y, z))
                .with_strength(strength)
                .with_frequency(frequency);
            if !link.set_stimulation(&stimulation) {
                bail!("failed to send stimulation");
            }
            println!("Sent {stimulation:?}");
        }
        Cmd::Enable { state } => {
            connect(&link, args.port.as_deref(), args.baud)?;
            let enable = matches!(state, Switch::On);
            if !link.set_enable(enable) {
                bail!("failed to send enable command");
            }
            println!("Output {}", if enable { "enabled" } else { "disabled" });
        }
        Cmd::Monitor { seconds, rate } => {
            connect(&link, args.port.as_deref(), args.baud)?;
            link.set_refresh_rate(rate)?;
            let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
            while Instant::now() < deadline {
                for event in link.pump() {
                    if let umh_link::DeviceEvent::StatusReceived(s) = event {
                        println!(
                            "vdda {:.2} V | 3v3 {:.2} V | 5v0 {:.2} V | {:.1} C | loop {:.1} Hz",
                            s.voltage_vdda, s.voltage_3v3, s.voltage_5v0, s.temperature, s.loop_freq
                        );
                    }
                }
                if !link.is_connected() {
                    bail!("connection lost");
                }
                thread::sleep(PUMP_INTERVAL);
            }
        }
    }

    link.shutdown();
    Ok(())
}

fn connect(link: &HapticsLink, port: Option<&str>, baud: u32) -> Result<()> {
    match port {
        Some(port) => {
            if !link.manual_connect(port, baud) {
                bail!("could not open {port}");
            }
        }
        None => {
            if !link.scan() {
                bail!("no device answered; pass --port to skip scanning");
            }
        }
    }
    Ok(())
}

fn await_reply(link: &HapticsLink, done: impl Fn(&DeviceSnapshot) -> bool) -> Result<DeviceSnapshot> {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    loop {
        link.pump();
        let snapshot = link.snapshot();
        if done(&snapshot) {
            return Ok(snapshot);
        }
        if Instant::now() >= deadline {
            bail!("no reply within {:?}", REPLY_TIMEOUT);
        }
        thread::sleep(PUMP_INTERVAL);
    }
}
