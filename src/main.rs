use clap::Parser;
use midi::MidiReader;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bus::{EngineEvent, EventBus};
use config::RackConfig;
use engine::{Engine, EngineSettings};
use host::{BuiltinHost, SharedHost};
use remote::RemoteUpdate;
use restore::Restorer;
use stage::Stage;

pub mod audio;
pub mod bus;
pub mod channel;
pub mod config;
pub mod engine;
pub mod host;
pub mod mapping;
pub mod midi;
pub mod music;
pub mod remote;
pub mod restore;
pub mod router;
pub mod stage;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
const MIDI_SLOTS: usize = 16;
const METER_PERIOD: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(about = "Live MIDI router and instrument rack.")]
pub struct Args {
    #[arg(short, long, help = "Rack file to restore at startup")]
    rack: Option<PathBuf>,

    #[arg(
        short = 'i',
        long = "midi-input",
        help = "MIDI input port to connect, can be given several times"
    )]
    midi_inputs: Vec<String>,

    #[arg(long, default_value_t = 44100)]
    sample_rate: u32,

    #[arg(long, default_value_t = 512, help = "Output buffer size in frames")]
    buffer_size: usize,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    #[arg(long, help = "Print the available MIDI input ports and exit")]
    list_midi_ports: bool,

    #[arg(long, help = "Run without opening an audio device")]
    no_audio: bool,

    #[arg(long, help = "Write the live rack back to the rack file on exit")]
    save_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.list_midi_ports {
        for port in MidiReader::get_available_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    info!("Starting stagerack > version: {}", VERSION.unwrap_or("?"));

    let config = match &args.rack {
        Some(path) => {
            info!("| Rack file: {path:?}");
            RackConfig::load(path)?
        }
        None => RackConfig::default(),
    };

    info!("| Available MIDI ports:");
    for port in MidiReader::get_available_ports() {
        info!("| - {port}");
    }

    let bus = EventBus::default();
    tokio::spawn(run_event_logger(bus.subscribe()));
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    tokio::spawn(remote::run_update_forwarder(bus.subscribe(), remote_tx));
    tokio::spawn(run_remote_logger(remote_rx));

    let host: SharedHost = Arc::new(BuiltinHost::new(args.sample_rate));
    let settings = EngineSettings {
        output: audio::output::OutputParams {
            sample_rate: args.sample_rate,
            buffer_size: args.buffer_size,
        },
        audio: !args.no_audio,
    };
    let mut engine = Engine::new(host, settings, bus.clone());
    if let Err(e) = engine.start() {
        warn!("Continuing without audio: {e}");
    }

    let mut stage = Stage::new(engine);
    stage.apply_settings(&config);
    let stage = stage.shared();

    let restorer = Restorer::new();
    restorer
        .restore(&stage, config.channels.clone(), |summary| {
            info!(
                "Rack ready: {} plugins loaded, {} failed",
                summary.succeeded, summary.failed
            )
        })
        .await?;

    let (midi_tx, midi_rx) = midi::create_channel();
    let mut midi_reader = MidiReader::with_slots(midi_tx, MIDI_SLOTS);
    for port in &args.midi_inputs {
        match midi_reader.connect_next(port) {
            Ok(slot) => debug!("MIDI port connected to slot {slot}: {port}"),
            Err(e) => warn!("Failed to connect MIDI port {port}: {e}"),
        }
    }

    tokio::spawn(stage::run_midi_dispatcher(midi_rx, Arc::clone(&stage)));
    tokio::spawn(stage::run_meter_sampler(Arc::clone(&stage), METER_PERIOD));
    let watchdog = tokio::spawn(run_midi_port_watchdog(midi_reader, args.midi_inputs.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    watchdog.abort();
    let _ = watchdog.await;

    let mut stage = stage.lock().await;
    stage.panic();
    if args.save_on_exit {
        if let Some(path) = &args.rack {
            stage.snapshot_config().save(path)?;
            info!("Rack saved to {path:?}");
        }
    }
    stage.engine.stop();
    Ok(())
}

async fn run_event_logger(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Meters(meters)) => trace!("CPU load: {:.2}", meters.cpu_load),
            Ok(event) => debug!("{event:?}"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event logger lagged, {n} events skipped")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn run_remote_logger(mut updates: mpsc::UnboundedReceiver<RemoteUpdate>) {
    while let Some(update) = updates.recv().await {
        match serde_json::to_string(&update) {
            Ok(json) => debug!("Remote update: {json}"),
            Err(e) => warn!("Failed to encode remote update: {e}"),
        }
    }
}

/// Owns the MIDI reader: frees the slots of vanished ports and reconnects the
/// requested ones when they come back.
async fn run_midi_port_watchdog(mut reader: MidiReader, wanted: Vec<String>) {
    let mut known = MidiReader::get_available_ports();
    loop {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let ports = MidiReader::get_available_ports();
        for port in ports.iter().filter(|port| !known.contains(port)) {
            info!("MIDI port appeared: {port}");
        }
        for port in known.iter().filter(|port| !ports.contains(port)) {
            info!("MIDI port disappeared: {port}");
        }

        let connected = reader.connected_input_names();
        for (slot, name) in connected.iter().enumerate() {
            if let Some(name) = name.as_ref().filter(|name| !ports.contains(name)) {
                debug!("Releasing slot {slot} of {name}");
                if let Err(e) = reader.disconnect_input(slot) {
                    warn!("Failed to release MIDI slot {slot}: {e}");
                }
            }
        }
        for port in wanted.iter().filter(|port| ports.contains(port)) {
            if connected.iter().flatten().any(|name| name == port) {
                continue;
            }
            match reader.connect_next(port) {
                Ok(slot) => info!("MIDI port reconnected to slot {slot}: {port}"),
                Err(e) => warn!("Failed to reconnect MIDI port {port}: {e}"),
            }
        }
        known = ports;
    }
}
