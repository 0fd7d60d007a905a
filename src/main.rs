use anyhow::Context;
use clap::Parser;
use counter_gatewayd::buffer::DurableBuffer;
use counter_gatewayd::config::GatewayConfig;
use counter_gatewayd::events::EventBus;
use counter_gatewayd::mes::{MesClient, MesOutcome};
use counter_gatewayd::model::Station;
use counter_gatewayd::orchestrator::{GatewayOrchestrator, OrchestratorCommand};
use counter_gatewayd::replicator::Replicator;
use counter_gatewayd::transport::Rs485Transport;
use log::{error, info, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};

const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "counter-gatewayd")]
#[command(about = "Shop-floor RS-485 production counter gateway")]
struct Args {
    /// Path to the gateway config file. Overrides GATEWAY_CONFIG_PATH.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Load config and open the serial port, then exit without running.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("[counter-gatewayd] fatal during startup: {e:?}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    if let Some(path) = &args.config {
        std::env::set_var("GATEWAY_CONFIG_PATH", path);
    }

    let config = GatewayConfig::load();
    info!("[counter-gatewayd] starting with MES base_url={}", config.mes.base_url);

    let buffer = DurableBuffer::new(&config.buffer.path)
        .await
        .with_context(|| format!("opening durable buffer at {}", config.buffer.path))?;
    let buffer = Arc::new(buffer);

    let transport = Rs485Transport::open(&config.rs485.port, config.rs485.baud)
        .with_context(|| format!("opening RS-485 port {}", config.rs485.port))?;
    let transport = Arc::new(Mutex::new(transport));

    let events = Arc::new(EventBus::new());

    let mes = Arc::new(MesClient::new(
        config.mes.base_url.clone(),
        config.mes.company_id,
        config.mes.username.clone(),
        config.mes.password.clone(),
    ));
    match mes.authenticate().await {
        MesOutcome::Ok(()) => info!("[counter-gatewayd] authenticated with MES"),
        other => {
            warn!("[counter-gatewayd] initial MES authentication failed: {other:?}, continuing offline");
        }
    }

    let station = config.station.id.map(|id| Station {
        id,
        name: format!("station-{id}"),
        description: None,
    });
    if let Some(station) = &station {
        if let Err(e) = buffer.save_station(station).await {
            warn!("[counter-gatewayd] failed to persist selected station: {e}");
        }
    }

    if args.dry_run {
        println!("[counter-gatewayd] dry run requested, exiting after startup checks.");
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = Arc::new(Mutex::new(GatewayOrchestrator::new(
        Arc::clone(&buffer),
        Arc::clone(&transport),
        Arc::clone(&events),
        config.mes.user_id,
    )));

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<OrchestratorCommand>(32);
    let (sync_now_tx, mut sync_now_rx) = mpsc::channel::<()>(4);

    // Transport reader: turns inbound frames into orchestrator mutations.
    // This is the only task that calls handle_frame, so frame processing
    // order matches physical arrival order (spec §5). On a lost port it
    // reopens with exponential backoff capped at 30 s and clears stale
    // buffered bytes before resuming reads (spec §4.2).
    {
        let transport = Arc::clone(&transport);
        let orchestrator = Arc::clone(&orchestrator);
        let timeout = Duration::from_millis(config.rs485.timeout_ms);
        let port = config.rs485.port.clone();
        let baud = config.rs485.baud;
        const MAX_REOPEN_BACKOFF: Duration = Duration::from_secs(30);
        tokio::spawn(async move {
            let mut reopen_backoff = Duration::from_secs(1);
            loop {
                let frame = {
                    let mut t = transport.lock().await;
                    t.read_frame(timeout).await
                };
                match frame {
                    Ok(frame) => {
                        reopen_backoff = Duration::from_secs(1);
                        orchestrator.lock().await.handle_frame(frame).await;
                    }
                    Err(counter_gatewayd::TransportError::Timeout) => continue,
                    Err(counter_gatewayd::TransportError::ParseError(line)) => {
                        warn!("[counter-gatewayd] dropping malformed frame: {line}");
                    }
                    Err(counter_gatewayd::TransportError::PortLost(reason)) => {
                        error!(
                            "[counter-gatewayd] RS-485 port lost ({reason}), reopening in {reopen_backoff:?}"
                        );
                        tokio::time::sleep(reopen_backoff).await;
                        match Rs485Transport::open(&port, baud) {
                            Ok(mut reopened) => {
                                if let Err(e) = reopened.clear_buffers() {
                                    warn!("[counter-gatewayd] failed to clear buffers after reopen: {e}");
                                }
                                *transport.lock().await = reopened;
                                reopen_backoff = Duration::from_secs(1);
                                info!("[counter-gatewayd] RS-485 port {port} reopened");
                            }
                            Err(e) => {
                                warn!("[counter-gatewayd] failed to reopen RS-485 port: {e}");
                                reopen_backoff = (reopen_backoff * 2).min(MAX_REOPEN_BACKOFF);
                            }
                        }
                    }
                    Err(e) => {
                        error!("[counter-gatewayd] transport read failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    // Command intake: the operator GUI/TUI that drives this surface is out
    // of scope here, so this binary accepts the same commands as newline
    // JSON on stdin for manual operation and scripting.
    {
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<OrchestratorCommandPayload>(&line) {
                            Ok(payload) => {
                                if cmd_tx.send(payload.into()).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("[counter-gatewayd] ignoring malformed command: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        warn!("[counter-gatewayd] stdin read failed: {e}");
                        break;
                    }
                }
            }
        });
    }

    // Orchestrator command loop.
    {
        let orchestrator = Arc::clone(&orchestrator);
        let sync_now_tx = sync_now_tx.clone();
        let mes = Arc::clone(&mes);
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                let requests_sync = matches!(
                    &command,
                    OrchestratorCommand::RequestOrderChange { .. }
                );
                let recipe_lookup = match &command {
                    OrchestratorCommand::SelectStationAndOrder { order, .. } => {
                        Some(order.code.clone())
                    }
                    _ => None,
                };

                let mut guard = orchestrator.lock().await;
                if let Err(e) = guard.handle_command(command).await {
                    warn!("[counter-gatewayd] command rejected: {e:?}");
                }
                drop(guard);

                if requests_sync {
                    let _ = sync_now_tx.send(()).await;
                }
                // Recipe lookup is advisory (spec §4.4, §4.6): fetched
                // fire-and-forget on order selection and never gates the
                // ORDER_SELECTED -> AWAITING_UPC transition, which the
                // orchestrator has already performed synchronously above.
                if let Some(order_code) = recipe_lookup {
                    let mes = Arc::clone(&mes);
                    tokio::spawn(async move {
                        match mes.get_order_recipe(&order_code).await {
                            MesOutcome::Ok(_) => {
                                info!("[counter-gatewayd] loaded recipe for order {order_code}");
                            }
                            other => {
                                warn!(
                                    "[counter-gatewayd] advisory recipe lookup failed for {order_code}: {other:?}"
                                );
                            }
                        }
                    });
                }
            }
        });
    }

    // Replicator: periodic timer plus on-demand signal (spec §4.5).
    {
        let buffer = Arc::clone(&buffer);
        let mes = Arc::clone(&mes);
        let events = Arc::clone(&events);
        let orchestrator = Arc::clone(&orchestrator);
        let interval = Duration::from_secs(config.sync.interval_sec);
        let batch_max = config.buffer.batch_max;
        let max_passes_per_trigger = config.sync.max_attempts_per_pass;
        tokio::spawn(async move {
            let mut replicator = Replicator::new(buffer, mes, events, batch_max, max_passes_per_trigger);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    signal = sync_now_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                    }
                }
                let guard = orchestrator.lock().await;
                let order = guard.current_order().cloned();
                let station_id = guard.current_station_id().unwrap_or(0);
                drop(guard);
                replicator
                    .run_until_idle_or_retry(order.as_ref(), station_id)
                    .await;

                // Once DRAINING has nothing left to upload, close the loop
                // back to IDLE and, if requested, tell the MES the order is
                // done (spec §4.6 DRAINING -> IDLE).
                let mut guard = orchestrator.lock().await;
                let draining = guard.phase() == counter_gatewayd::model::SessionPhase::Draining;
                if draining && buffer.pending_count().await.unwrap_or(-1) == 0 {
                    let close = guard.close_requested();
                    let order_code = guard.current_order().map(|o| o.code.clone());
                    guard.complete_drain();
                    drop(guard);
                    if close {
                        if let Some(order_code) = order_code {
                            if let MesOutcome::Permanent(reason)
                            | MesOutcome::Transient(reason) =
                                mes.close_order(&order_code, station_id).await
                            {
                                warn!("[counter-gatewayd] close_order failed for {order_code}: {reason}");
                            }
                        }
                    }
                }
            }
        });
    }

    // Housekeeper: stale-device sweep and durable-buffer retention (spec §5).
    {
        let buffer = Arc::clone(&buffer);
        let events = Arc::clone(&events);
        let orchestrator = Arc::clone(&orchestrator);
        let retention = chrono::Duration::days(config.buffer.retention_days as i64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                // The spec's closed event enumeration (§4.7) has no
                // dedicated disconnect event; stale devices are logged
                // rather than misreported as a counter reset.
                for device_id in orchestrator.lock().await.sweep_stale_devices() {
                    warn!("[counter-gatewayd] device {device_id} went quiet past the heartbeat timeout");
                }
                if let Err(e) = buffer.vacuum(retention).await {
                    warn!("[counter-gatewayd] buffer vacuum failed: {e}");
                }
            }
        });
    }

    info!("[counter-gatewayd] running, press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[counter-gatewayd] failed to install Ctrl+C handler: {e}");
    }
    info!("[counter-gatewayd] shutting down, draining pending increments");

    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    loop {
        match buffer.pending_count().await {
            Ok(0) => break,
            Ok(_) if tokio::time::Instant::now() >= deadline => {
                warn!("[counter-gatewayd] drain grace period elapsed with increments still pending");
                break;
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            Err(e) => {
                error!("[counter-gatewayd] storage error during shutdown drain: {e}");
                return Ok(ExitCode::from(3));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Wire shape for operator commands accepted on stdin, matching
/// `OrchestratorCommand`'s cases without pulling `Station`/`Order` JSON
/// shapes into this binary's own schema.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum OrchestratorCommandPayload {
    SelectOrder {
        station_id: u64,
        station_name: String,
        order_id: u64,
        order_code: String,
        product_code: String,
        product_upc: String,
        quantity_target: i64,
        quantity_pending: i64,
    },
    ValidateUpc {
        device_id: String,
        code: String,
    },
    KeepCounter,
    RequireManualReset,
    ChangeOrder {
        device_id: String,
    },
    CloseOrder {
        device_id: String,
    },
}

impl From<OrchestratorCommandPayload> for OrchestratorCommand {
    fn from(payload: OrchestratorCommandPayload) -> Self {
        use counter_gatewayd::model::Order;
        use counter_gatewayd::orchestrator::StaleCounterDecision;

        match payload {
            OrchestratorCommandPayload::SelectOrder {
                station_id,
                station_name,
                order_id,
                order_code,
                product_code,
                product_upc,
                quantity_target,
                quantity_pending,
            } => OrchestratorCommand::SelectStationAndOrder {
                station: Station {
                    id: station_id,
                    name: station_name,
                    description: None,
                },
                order: Order {
                    id: order_id,
                    code: order_code,
                    product_code,
                    product_upc,
                    quantity_target,
                    quantity_pending,
                    closed: false,
                    priority: None,
                },
            },
            OrchestratorCommandPayload::ValidateUpc { device_id, code } => {
                OrchestratorCommand::ValidateUpc { device_id, code }
            }
            OrchestratorCommandPayload::KeepCounter => {
                OrchestratorCommand::ResolveStaleCounter(StaleCounterDecision::KeepCounter)
            }
            OrchestratorCommandPayload::RequireManualReset => {
                OrchestratorCommand::ResolveStaleCounter(StaleCounterDecision::RequireManualReset)
            }
            OrchestratorCommandPayload::ChangeOrder { device_id } => {
                OrchestratorCommand::RequestOrderChange {
                    device_id,
                    close: false,
                }
            }
            OrchestratorCommandPayload::CloseOrder { device_id } => {
                OrchestratorCommand::RequestOrderChange {
                    device_id,
                    close: true,
                }
            }
        }
    }
}
