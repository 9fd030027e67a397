use clap::{App, Arg};
use plcsim::config::{self, AppConfig, Protocol};
use plcsim::history::{HistoryStore, MemoryHistoryStore};
use plcsim::protocol::ProtocolHandler;
use plcsim::telemetry::StreamMessage;
use plcsim::{Simulator, SymbolBridge};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const BATCH_BROADCAST_BUFFER_SIZE: usize = 256;

/// A running listener plus the bridge it serves, if any.
struct Transport {
    task: JoinHandle<()>,
    bridge: Option<Arc<SymbolBridge>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("plcsim-simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("PLC sensor simulator daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (YAML or JSON); falls back to PLC_CONFIG")
                .takes_value(true),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = config::resolve_path(matches.value_of("config"));
    let config = config::load_config(&path)?;
    info!(
        path = %path.display(),
        modules = config.modules.len(),
        sensors = config.sensor_count(),
        "configuration loaded"
    );

    let simulator = Arc::new(build_simulator(&config));
    for (module_id, period) in simulator.module_periods() {
        info!(module_id, period_ms = period.as_millis() as u64, "module scheduled");
    }

    let transport = match config.server.protocol {
        Protocol::Stream => spawn_stream_server(&config, &simulator).await?,
        Protocol::Symbol => spawn_symbol_server(&config, &simulator).await?,
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    simulator.stop();
    transport.task.abort();
    if let Some(bridge) = &transport.bridge {
        bridge.set_connected(false);
    }

    let stats = simulator.stats();
    info!(
        ticks = stats.ticks_completed,
        generator_faults = stats.generator_faults,
        subscriber_faults = stats.subscriber_faults,
        "simulator stopped"
    );
    Ok(())
}

fn build_simulator(config: &AppConfig) -> Simulator {
    let history = &config.server.history;
    if !history.enabled {
        return Simulator::new(config);
    }

    let store: Arc<dyn HistoryStore> = match history.max_records {
        Some(max) => Arc::new(MemoryHistoryStore::with_capacity_limit(max)),
        None => Arc::new(MemoryHistoryStore::new()),
    };
    Simulator::with_history(config, store)
}

async fn spawn_stream_server(
    config: &AppConfig,
    simulator: &Arc<Simulator>,
) -> Result<Transport, Box<dyn std::error::Error>> {
    let (batch_tx, _) = broadcast::channel::<String>(BATCH_BROADCAST_BUFFER_SIZE);

    let subscriber_tx = batch_tx.clone();
    simulator.on_batch(move |batch| {
        match StreamMessage::Batch(batch.to_vec()).to_json_line() {
            // No receivers is normal while no client is connected.
            Ok(line) => {
                let _ = subscriber_tx.send(line);
            }
            Err(e) => warn!(error = %e, "failed to encode batch"),
        }
    });

    simulator.start()?;

    let listener = TcpListener::bind(("0.0.0.0", config.server.port)).await?;
    info!(port = config.server.port, "stream server listening");

    let simulator = Arc::clone(simulator);
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "stream client connected");
                    let rx = batch_tx.subscribe();
                    let snapshot = StreamMessage::Snapshot(simulator.snapshot());

                    tokio::spawn(async move {
                        if let Err(e) = serve_stream_client(stream, snapshot, rx).await {
                            warn!(%addr, error = %e, "stream client error");
                        }
                        info!(%addr, "stream client disconnected");
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    });
    Ok(Transport { task, bridge: None })
}

async fn serve_stream_client(
    mut stream: TcpStream,
    snapshot: StreamMessage,
    mut rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    stream.write_all(snapshot.to_json_line()?.as_bytes()).await?;

    loop {
        match rx.recv().await {
            Ok(line) => stream.write_all(line.as_bytes()).await?,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "stream client lagging, batches dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn spawn_symbol_server(
    config: &AppConfig,
    simulator: &Arc<Simulator>,
) -> Result<Transport, Box<dyn std::error::Error>> {
    let symbol_config = &config.server.symbol;
    let bridge = SymbolBridge::start_primed(simulator, symbol_config).await?;
    info!(symbols = bridge.symbol_count(), "symbol table primed");

    let listener = TcpListener::bind(("0.0.0.0", config.server.port)).await?;
    bridge.set_connected(true);
    info!(
        port = config.server.port,
        local_ads_port = symbol_config.local_ads_port,
        ams_net_id = %symbol_config.local_ams_net_id,
        "symbol server listening"
    );

    let device_name = symbol_config.device_name.clone();
    let served = Arc::clone(&bridge);
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "symbol client connected");
                    let handler = ProtocolHandler::new(Arc::clone(&served), device_name.clone());

                    tokio::spawn(async move {
                        if let Err(e) = serve_symbol_client(stream, handler).await {
                            warn!(%addr, error = %e, "symbol client error");
                        }
                        info!(%addr, "symbol client disconnected");
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    });
    Ok(Transport {
        task,
        bridge: Some(bridge),
    })
}

async fn serve_symbol_client(
    stream: TcpStream,
    mut handler: ProtocolHandler,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = handler.process_line(trimmed)?.to_string();
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}
