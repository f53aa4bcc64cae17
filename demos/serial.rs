use std::env;
use std::path::Path;
use std::time::Duration;

use est_link::board::{Card, PhaseLabel, names};
use est_link::config::load_config;
use est_link::diagnostics::Diagnostics;
use inquire::Select;

// How long to watch the measure record
const SAMPLING_TIME_MS: u64 = 3000;

fn main() -> est_link::Result<()> {
    // Settings from ./est-link.toml when present, then EST_LINK_* variables
    let file = Path::new("est-link.toml");
    let mut config = load_config(file.exists().then_some(file))?;
    let diagnostics = Diagnostics::init(&config.log)?;

    // Port from command line arg, configuration, or interactive selection
    if let Some(port) = env::args().nth(1) {
        config.port = Some(port);
    }
    if config.port.is_none() {
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");
        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }
        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();
        let port = Select::new("Select a serial port:", port_names)
            .prompt()
            .expect("Failed to select port");
        config.port = Some(port);
    }
    println!("Using port: {}", config.port.as_deref().unwrap_or_default());

    let card = Card::open(&config)?.with_console(diagnostics.console());
    println!("{}", card.identity());
    println!("{:>18} : {}", "Firmware", card.model());

    println!("\n--- Parameters ---");
    for name in card.parameter_names() {
        if name.starts_with("EEPROM") {
            continue;
        }
        match card.get(name) {
            Ok(value) => println!("{name:>32} : {value}"),
            Err(e) => println!("{name:>32} : <{e}>"),
        }
    }

    println!("\n--- Calibration ---");
    println!("{:>32} : {}", names::SCALE, card.scale()?);
    for label in [PhaseLabel::Ln, PhaseLabel::Uv] {
        println!("{:>32} : {}", format!("Gain {label}"), card.phase(label).gain()?);
    }
    match card.thresholds() {
        Ok(thresholds) => {
            for threshold in thresholds {
                let (upper, lower) = threshold.read(&card)?;
                println!("{:>29} {:2} : {upper} / {lower}", "Tap", threshold.tap);
            }
        }
        Err(e) => println!("Thresholds unavailable: {e}"),
    }

    println!("\n--- Measurement ---");
    let sampler = card.start_measure()?;
    std::thread::sleep(Duration::from_millis(SAMPLING_TIME_MS));
    let (ln, uv) = sampler.stats();
    println!("{} samples, last {:?}", ln.count(), sampler.last());
    println!("LN {ln}");
    println!("UV {uv}");
    println!("Sampler: {:?}", sampler.status());

    card.close()
}
