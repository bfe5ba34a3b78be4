use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueHint};
use log::LevelFilter;
use tokio::io::{AsyncBufReadExt, BufReader};

use resonate::{
    client::{Client, ClientHandler, NullHandler},
    config::{Config, DEFAULT_PATH, DEFAULT_PORT},
    discovery::{Discovery, CLIENT_SERVICE, SERVER_SERVICE},
    error::{Error, ErrorKind, Result},
    group::AppAdapter,
    protocol::controller::ControllerCommand,
    protocol::messages::{ClientHello, DeviceInfo, StreamRequestFormat},
    protocol::metadata::Metadata,
    protocol::player::{AudioFormat, FormatRequest},
    protocol::types::{AudioCodec, MediaCommand, Role},
    server::Server,
    stream::{AudioSource, PcmEncoderFactory},
};

/// Exit code for protocol-level failures.
const EXIT_PROTOCOL: i32 = 1;

/// Exit code for discovery failures.
const EXIT_DISCOVERY: i32 = 2;

/// How long client mode waits for a server advertisement.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run as a server instead of a client
    ///
    /// The server listens for WebSocket upgrades, advertises itself
    /// over mDNS, dials advertised clients, and reads line commands
    /// from stdin (`help` lists them).
    #[arg(long, default_value_t = false, env = "RESONATE_SERVE")]
    serve: bool,

    /// Name shown to peers
    ///
    /// If not specified, a generic name derived from the mode is used.
    #[arg(short, long, env = "RESONATE_NAME")]
    name: Option<String>,

    /// Address to bind the server listener to
    #[arg(long, default_value = "0.0.0.0", env = "RESONATE_BIND")]
    bind: IpAddr,

    /// WebSocket port
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "RESONATE_PORT")]
    port: u16,

    /// WebSocket path
    #[arg(long, default_value_t = String::from(DEFAULT_PATH), env = "RESONATE_PATH")]
    path: String,

    /// Server URL to connect to, bypassing discovery
    #[arg(long, value_hint = ValueHint::Url, env = "RESONATE_SERVER_URL")]
    server_url: Option<String>,

    /// One-shot controller command to send
    ///
    /// One of: play, pause, stop, next, previous, volume, mute,
    /// unmute, switch. Implies client mode.
    #[arg(short, long)]
    command: Option<String>,

    /// Volume for the volume command (0-100)
    #[arg(long)]
    volume: Option<u8>,

    /// Request this audio codec after connecting (opus, flac, pcm)
    #[arg(long)]
    request_format: Option<String>,

    /// Stay connected and log state updates instead of exiting
    #[arg(long, default_value_t = false)]
    listen: bool,

    /// Suppress all output except warnings and errors
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING, env = "RESONATE_QUIET")]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Use -v for debug logging
    /// Use -vv for trace logging
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING, env = "RESONATE_VERBOSE")]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined, in order of precedence, by the
/// command line arguments, the `RUST_LOG` environment variable, and the
/// hard-coded default.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        logger.filter_module("resonate", level);
    }
    logger.filter_module("mdns_sd", LevelFilter::Warn);
    logger.init();
}

/// A steady 440 Hz sine at 48 kHz stereo, so a freshly built server has
/// something audible to stream.
struct ToneSource {
    phase: f32,
}

impl ToneSource {
    fn new() -> Self {
        Self { phase: 0.0 }
    }
}

impl AudioSource for ToneSource {
    fn format(&self) -> AudioFormat {
        AudioFormat {
            codec: AudioCodec::Pcm,
            channels: 2,
            sample_rate: 48_000,
            bit_depth: 16,
        }
    }

    #[expect(clippy::cast_possible_truncation)]
    fn read(&mut self, buf: &mut [u8]) -> usize {
        const STEP: f32 = 440.0 * std::f32::consts::TAU / 48_000.0;
        for frame in buf.chunks_exact_mut(4) {
            let sample = (self.phase.sin() * 8192.0) as i16;
            let bytes = sample.to_le_bytes();
            frame[0] = bytes[0];
            frame[1] = bytes[1];
            frame[2] = bytes[0];
            frame[3] = bytes[1];
            self.phase = (self.phase + STEP) % std::f32::consts::TAU;
        }
        buf.len()
    }
}

/// Server-mode application: serves the tone source and logs forwarded
/// media commands.
struct ToneApp;

impl AppAdapter for ToneApp {
    fn capabilities(&self) -> Vec<MediaCommand> {
        vec![
            MediaCommand::Play,
            MediaCommand::Pause,
            MediaCommand::Stop,
            MediaCommand::Volume,
            MediaCommand::Mute,
            MediaCommand::Switch,
        ]
    }

    fn open_source(&self, _group_id: &str) -> Option<Box<dyn AudioSource>> {
        Some(Box::new(ToneSource::new()))
    }

    fn media_command(&self, group_id: &str, command: MediaCommand) {
        log::debug!("group {group_id}: {command}");
    }
}

/// Client-mode handler that logs what arrives.
struct LoggingHandler;

impl ClientHandler for LoggingHandler {
    fn on_group_update(&self, update: &resonate::protocol::controller::GroupUpdate) {
        if let Some(state) = update.playback_state {
            log::info!("group playback: {state}");
        }
    }

    fn on_metadata(&self, metadata: &Metadata) {
        if let (Some(artist), Some(title)) = (&metadata.artist, &metadata.title) {
            log::info!("now playing: {artist} - {title}");
        }
    }

    fn on_controller_state(&self, state: &resonate::protocol::controller::ControllerState) {
        log::info!(
            "group volume {}{}, commands: {:?}",
            state.volume,
            if state.muted { " (muted)" } else { "" },
            state.supported_commands
        );
    }
}

fn config_from(args: &Args, name: String) -> Config {
    Config {
        name,
        bind_addr: args.bind,
        port: args.port,
        path: args.path.clone(),
        ..Config::default()
    }
}

/// Runs the server until interrupted, with a line-based control surface
/// on stdin for grouping and playback.
async fn run_server(args: Args) -> Result<()> {
    let name = args.name.clone().unwrap_or_else(|| "Resonate Server".to_string());
    let config = config_from(&args, name.clone());
    let (server, mut events) = Server::new(config, Arc::new(ToneApp), Arc::new(PcmEncoderFactory));

    // Both discovery modes: advertise ourselves for client-initiated
    // connections, dial clients that advertise themselves.
    let discovery = Discovery::new()?;
    let advertise_addr = if args.bind.is_unspecified() {
        local_address()?
    } else {
        args.bind
    };
    discovery.advertise(SERVER_SERVICE, &name, advertise_addr, args.port, &args.path)?;
    discovery.browse(CLIENT_SERVICE, server.dialer())?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log::debug!("event: {event:?}");
        }
    });

    let listener = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down gracefully");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_control_line(&server, line.trim()) {
                            break;
                        }
                    }
                    _ => {
                        // stdin closed (daemonized); keep serving.
                        tokio::signal::ctrl_c().await.ok();
                        break;
                    }
                }
            }
        }
    }

    listener.abort();
    discovery.shutdown();
    Ok(())
}

/// One stdin control line; returns `false` to quit.
fn handle_control_line(server: &Arc<Server>, line: &str) -> bool {
    let engine = server.engine();
    let mut words = line.split_whitespace();
    match words.next() {
        Some("help") => {
            println!("commands:");
            println!("  join <client_id> <group_id>   move a client into a group");
            println!("  play|pause|stop <group_id>    control playback");
            println!("  volume <group_id> <0-100>     set group volume");
            println!("  mute|unmute <group_id>        set group mute");
            println!("  quit                          stop the server");
        }
        Some("join") => {
            if let (Some(client), Some(group)) = (words.next(), words.next()) {
                engine.join_group(client, group);
            } else {
                println!("usage: join <client_id> <group_id>");
            }
        }
        Some(verb @ ("play" | "pause" | "stop")) => {
            let Some(group) = words.next().and_then(|id| engine.group_of(id)) else {
                println!("unknown group");
                return true;
            };
            match verb {
                "play" => engine.play(&group),
                "pause" => engine.pause(&group),
                _ => engine.stop(&group),
            }
        }
        Some("volume") => {
            let group = words.next().and_then(|id| engine.group_of(id));
            let volume = words.next().and_then(|v| v.parse::<u8>().ok());
            match (group, volume) {
                (Some(group), Some(volume)) if volume <= 100 => {
                    engine.set_group_volume(&group, volume);
                }
                _ => println!("usage: volume <group_id> <0-100>"),
            }
        }
        Some(verb @ ("mute" | "unmute")) => {
            if let Some(group) = words.next().and_then(|id| engine.group_of(id)) {
                engine.set_group_mute(&group, verb == "mute");
            } else {
                println!("unknown group");
            }
        }
        Some("quit") => return false,
        Some(other) => println!("unknown command {other} (try help)"),
        None => {}
    }
    true
}

/// Best-effort local address for mDNS advertisement when bound to
/// 0.0.0.0: the kernel picks the outbound interface for us.
fn local_address() -> Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("224.0.0.251:5353")?;
    Ok(socket.local_addr()?.ip())
}

/// Parses the one-shot command line into a controller command.
fn parse_command(args: &Args) -> Result<Option<ControllerCommand>> {
    let Some(command) = &args.command else {
        return Ok(None);
    };
    let command = match command.as_str() {
        "mute" => ControllerCommand::mute(true),
        "unmute" => ControllerCommand::mute(false),
        "volume" => {
            let volume = args
                .volume
                .ok_or_else(|| Error::invalid_argument("volume command needs --volume"))?;
            ControllerCommand::volume(volume)
        }
        other => ControllerCommand::simple(other.parse::<MediaCommand>()?),
    };
    command.validate()?;
    Ok(Some(command))
}

/// Runs client mode: discover or dial the server, send the one-shot
/// command, optionally stay listening.
async fn run_client(args: Args) -> Result<()> {
    let command = parse_command(&args)?;
    let name = args.name.clone().unwrap_or_else(|| "Resonate CLI".to_string());

    let url = match &args.server_url {
        Some(url) => url.clone(),
        None => {
            let discovery = Discovery::new()?;
            let record = discovery.wait_for(SERVER_SERVICE, DISCOVERY_TIMEOUT).await?;
            discovery.shutdown();
            record.ws_url()
        }
    };
    log::info!("connecting to {url}");

    let hello = ClientHello {
        client_id: uuid::Uuid::new_v4().to_string(),
        name,
        version: resonate::protocol::VERSION,
        supported_roles: vec![Role::Controller, Role::Metadata],
        device_info: Some(DeviceInfo {
            product_name: Some(env!("CARGO_PKG_NAME").to_string()),
            manufacturer: None,
            software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        player_support: None,
        artwork_support: None,
        visualizer_support: None,
    };
    let handler: Arc<dyn ClientHandler> = if args.listen {
        Arc::new(LoggingHandler)
    } else {
        Arc::new(NullHandler)
    };
    let client = Client::new(hello, handler);
    let config = config_from(&args, String::new());
    let driver = client.driver(&config);
    driver.connect(&url);

    // Wait for the handshake before issuing commands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !client.connected() {
        if tokio::time::Instant::now() > deadline {
            driver.disconnect(&url);
            return Err(Error::deadline_exceeded("handshake timed out"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if let Some(command) = command {
        log::info!("sending {}", command.command);
        client.send_command(command)?;
    }
    if let Some(codec) = &args.request_format {
        client.request_format(StreamRequestFormat {
            player: Some(FormatRequest {
                codec: Some(codec.parse::<AudioCodec>()?),
                ..FormatRequest::default()
            }),
            artwork: None,
        })?;
    }

    if args.listen {
        tokio::signal::ctrl_c().await.ok();
    } else {
        // Let the writer flush the command before tearing down.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    driver.disconnect(&url);
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    if args.serve {
        run_server(args).await
    } else {
        run_client(args).await
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);
    log::debug!("command {args:#?}");

    if let Err(e) = run(args).await {
        log::error!("{e}");
        let code = match e.kind {
            ErrorKind::NotFound => EXIT_DISCOVERY,
            _ => EXIT_PROTOCOL,
        };
        process::exit(code);
    }
}
