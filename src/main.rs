//! rigol-comm - send SCPI commands to USB bench instruments from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use rigol_comm::{list_devices, InstrumentClient, Registry, Response};

/// rigol-comm - talk to USB bench instruments.
#[derive(Parser)]
#[command(name = "rigol-comm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Device registry (TOML) replacing the built-in instrument table.
    #[arg(long, global = true, value_name = "PATH", env = "RIGOL_COMM_REGISTRY")]
    registry: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe attached instruments and their endpoints.
    Scan,
    /// Print the instrument table.
    Devices,
    /// Run a `;` separated command batch, e.g. ":FUNC:RES;DLY1;:MEAS:RES?".
    Run {
        /// Instrument name or model, e.g. DM3058.
        device: String,
        /// Commands to send.
        command: String,
        /// Where to write a screen capture (defaults to capture.bmp / capture.jpg).
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    debug!("rigol-comm v{}", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Err: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let registry = match &cli.registry {
        Some(path) => Registry::load(path)?,
        None => Registry::default(),
    };

    match cli.command {
        Commands::Scan => {
            let devices = list_devices(&registry)?;
            if devices.is_empty() {
                println!("No matching devices detected");
            }
            for device in devices {
                println!("{device}");
            }
        }
        Commands::Devices => {
            for device in registry.devices() {
                println!(
                    "{:<30} {:04X}:{:04X}",
                    device.name, device.vendor_id, device.product_id
                );
            }
        }
        Commands::Run {
            device,
            command,
            output,
        } => {
            let mut client = InstrumentClient::from_registry(&registry, &device)?;
            println!("Snd: {command}");
            if let Some(response) = client.execute(&command)? {
                report(response, output)?;
            }
        }
    }

    Ok(())
}

fn report(response: Response, output: Option<PathBuf>) -> Result<()> {
    match response {
        Response::Text(text) => match text.parse::<f64>() {
            Ok(value) => println!("Rsp: {text}  ({})", format_number(value)),
            Err(_) => println!("Rsp: {text}"),
        },
        Response::Image { kind, header, data } => {
            let path = output.unwrap_or_else(|| PathBuf::from(format!("capture.{}", kind.extension())));
            std::fs::write(&path, &data)
                .with_context(|| format!("unable to write {}", path.display()))?;
            println!("Rsp: {kind:?} image received: {header} -> {}", path.display());
        }
        Response::Waveform { header, samples } => {
            let (min, max, mean) = summarize(&samples[..]);
            println!(
                "Rsp: Waveform received: {header} ({} samples, min {min}, max {max}, mean {mean:.1})",
                samples.len()
            );
        }
        Response::OversizedWaveform {
            header,
            declared,
            received,
        } => {
            println!(
                "Rsp: Waveform received: {header} but too large to display ({received} of {declared} bytes)"
            );
        }
    }

    Ok(())
}

/// Up to nine decimals, trailing zeros dropped
fn format_number(value: f64) -> String {
    let text = format!("{value:.9}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" => "0".to_string(),
        text => text.to_string(),
    }
}

fn summarize(samples: &[u8]) -> (u8, u8, f64) {
    let min = samples.iter().copied().min().unwrap_or(0);
    let max = samples.iter().copied().max().unwrap_or(0);
    let mean = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|s| f64::from(*s)).sum::<f64>() / samples.len() as f64
    };
    (min, max, mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_normalised() {
        assert_eq!(format_number(2.5e-1), "0.25");
        assert_eq!(format_number(1.234), "1.234");
        assert_eq!(format_number(1.0e3), "1000");
        assert_eq!(format_number(1.23456789012e-2), "0.012345679");
        assert_eq!(format_number(-0.0000000001), "0");
    }

    #[test]
    fn waveform_summary() {
        assert_eq!(summarize(&[10, 20, 30]), (10, 30, 20.0));
        assert_eq!(summarize(&[]), (0, 0, 0.0));
    }

    #[test]
    fn parses_run() {
        let cli = Cli::try_parse_from(["rigol-comm", "-v", "run", "DS4024", ":DISP:DATA?", "-o", "s.bmp"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                device,
                command,
                output,
            } => {
                assert_eq!(device, "DS4024");
                assert_eq!(command, ":DISP:DATA?");
                assert_eq!(output, Some(PathBuf::from("s.bmp")));
            }
            _ => panic!("expected run"),
        }
    }
}
