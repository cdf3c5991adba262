use std::path::PathBuf;

use anyhow::Context;
use vidcast::config::SignalingModeKind;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "./config/vidcast.toml";

#[derive(Debug)]
pub(crate) struct Args {
    pub config_path: PathBuf,
    pub port: Option<u16>,
    pub mode: Option<SignalingModeKind>,
    pub input: Option<PathBuf>,
    pub fps: Option<u32>,
}

pub(crate) enum Parsed {
    Run(Args),
    Help,
    Version,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    match parse_from(&args)? {
        Parsed::Run(args) => Ok(args),
        Parsed::Version => {
            println!("vidcast {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Parsed::Help => {
            print_help();
            std::process::exit(0);
        }
    }
}

fn print_help() {
    println!("vidcast - one-to-many real-time video publisher");
    println!();
    println!("USAGE:");
    println!("    vidcast [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>          Config file [default: {DEFAULT_CONFIG_PATH}]");
    println!("    -p, --port <PORT>            WebSocket signaling port (0 = any free port)");
    println!("    --mode <MODE>                Signaling mode: websocket or custom");
    println!("    --input <PATH>               H.264 Annex B file to loop as the video source");
    println!("    --fps <FPS>                  Maximum framerate [default: from config]");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
    println!();
    println!("In custom mode the offer and local candidates are printed to stdout and");
    println!("answers and remote candidates are read from stdin, one JSON message per line.");
}

/// `args[0]` is the program name.
pub(crate) fn parse_from(args: &[String]) -> anyhow::Result<Parsed> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut port = None;
    let mut mode = None;
    let mut input = None;
    let mut fps = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => return Ok(Parsed::Version),
            "-h" | "--help" => return Ok(Parsed::Help),
            "-c" | "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "-p" | "--port" => {
                i += 1;
                port = Some(
                    args.get(i)
                        .context("Missing --port value")?
                        .parse::<u16>()
                        .context("Invalid --port value")?,
                );
            }
            "--mode" => {
                i += 1;
                mode = Some(
                    args.get(i)
                        .context("Missing --mode value")?
                        .parse::<SignalingModeKind>()
                        .map_err(anyhow::Error::msg)?,
                );
            }
            "--input" => {
                i += 1;
                input = Some(PathBuf::from(args.get(i).context("Missing --input value")?));
            }
            "--fps" => {
                i += 1;
                fps = Some(
                    args.get(i)
                        .context("Missing --fps value")?
                        .parse::<u32>()
                        .context("Invalid --fps value")?,
                );
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Parsed::Run(Args {
        config_path,
        port,
        mode,
        input,
        fps,
    }))
}
