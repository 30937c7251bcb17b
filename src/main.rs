use bittorrent_client::control::ControlState;
use bittorrent_client::{coordinator, peer_id};
use clap::Parser;
use crossbeam::channel;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

/// A BitTorrent client: downloads and seeds the torrents given on the
/// command line, driving one coordinator thread per torrent.
#[derive(Parser, Debug)]
#[command(name = "bittorrent")]
struct Cli {
    /// One or more .torrent files to download.
    #[arg(required = true)]
    source: Vec<PathBuf>,

    /// Directory to save downloaded content under.
    #[arg(short, long, default_value = ".")]
    destination: PathBuf,

    /// Port to listen on for incoming peer connections.
    #[arg(long, default_value_t = 6889)]
    port: u16,

    /// Path to the log file.
    #[arg(long, default_value = "bittorrent.log")]
    log_file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_target = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.log_file)
    {
        Ok(file) => Box::new(file) as Box<dyn std::io::Write + Send>,
        Err(e) => {
            eprintln!("failed to open log file {}: {e}", cli.log_file.display());
            return ExitCode::FAILURE;
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(log_target))
        .init();

    let control = Arc::new(ControlState::new());
    let our_peer_id = peer_id::generate();

    let (key_tx, key_rx) = channel::unbounded();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            if stdin.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            if key_tx.send(line.trim().to_string()).is_err() {
                break;
            }
        }
    });
    {
        let control = control.clone();
        thread::spawn(move || {
            while let Ok(cmd) = key_rx.recv() {
                match cmd.as_str() {
                    "p" => {
                        log::info!("pausing");
                        control.pause();
                    }
                    "r" => {
                        log::info!("resuming");
                        control.resume();
                    }
                    "q" => {
                        log::info!("stopping");
                        control.stop();
                        break;
                    }
                    other => log::warn!("unrecognized command: {other:?}"),
                }
            }
        });
    }

    let mut handles = Vec::new();
    for source in cli.source {
        let destination = cli.destination.clone();
        let port = cli.port;
        let control = control.clone();
        handles.push(thread::spawn(move || {
            coordinator::run(source, destination, port, our_peer_id, control)
        }));
    }

    let mut had_error = false;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("torrent failed: {e}");
                had_error = true;
            }
            Err(_) => {
                log::error!("coordinator thread panicked");
                had_error = true;
            }
        }
    }

    if had_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
