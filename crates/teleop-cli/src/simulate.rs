//! `teleop simulate` – one complete control session against an in-process
//! robot.
//!
//! The simulated robot announces its cameras, reports telemetry, counts the
//! control frames it receives and acknowledges the disconnect request. The
//! run ends with a graceful disconnect, so every stage of the session
//! lifecycle is exercised over the loopback transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use teleop_hal::{ChannelCodec, InputFilter, LatchedInput};
use teleop_middleware::{
    DataChannel, EventBus, LoopbackDataChannel, LoopbackMediaChannel, Notifier, Topic,
    TopicReceiver, TracingNotifier, loopback_pair,
};
use teleop_runtime::{
    BridgeStats, ControlLoop, ControlLoopConfig, DATA_CHANNEL_LABEL, LoopExit, TransportBridge,
};
use teleop_store::{Database, Stores, SystemClock};
use teleop_types::{EventPayload, SessionStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;

/// Outcome of a simulated session.
#[derive(Debug)]
pub struct SimReport {
    pub robot_id: String,
    pub exit: LoopExit,
    pub stats: BridgeStats,
    pub frames_received: u64,
    pub final_status: Option<SessionStatus>,
    pub cameras: usize,
    pub online: bool,
}

/// Run a session for `duration`, or until `shutdown` flips.
pub async fn run(
    cfg: &Config,
    robot_id: &str,
    duration: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<SimReport, String> {
    let filter = InputFilter::new(cfg.deadzone, cfg.smoothing)
        .and_then(|f| f.with_axis_map(cfg.axis_map.clone()))
        .map_err(|e| e.to_string())?;
    let codec = ChannelCodec::new(cfg.channel_count);

    let bus = Arc::new(EventBus::default());
    let db = Database::open_in_memory().map_err(|e| e.to_string())?;
    let stores = Stores::with_parts(
        db,
        Arc::new(SystemClock),
        cfg.offline_timeout(),
        Some(Arc::clone(&bus)),
    );
    let err = |e: teleop_store::StoreError| e.to_string();

    stores.telemetry.register(robot_id, Some("Simulated robot")).map_err(err)?;
    let session = stores.sessions.create_session(robot_id, 0).map_err(err)?;
    info!(robot_id, session = %session.id, "simulation started");

    let (core, robot) = loopback_pair(DATA_CHANNEL_LABEL, 16);
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let bridge = Arc::new(TransportBridge::new(
        &session,
        Arc::new(core),
        Arc::new(LoopbackMediaChannel::new("video")),
        stores.clone(),
        Arc::clone(&notifier),
    ));
    let pump = bridge.pump_inbound();
    let supervisor = bridge.supervise(bus.subscribe_to(Topic::Sessions));

    let robot_task = spawn_robot(
        robot,
        robot_id.to_string(),
        codec,
        bus.subscribe_to(Topic::Sessions),
    );
    bridge.on_media_connected().map_err(err)?;

    let input = LatchedInput::new("simulated-stick");
    let poller = spawn_input_poller(input.clone(), Duration::from_millis(cfg.input_poll_ms.max(1)));

    let control = ControlLoop::new(Box::new(input), Arc::clone(&bridge), Arc::clone(&notifier))
        .with_filter(filter)
        .with_codec(codec)
        .with_config(ControlLoopConfig {
            tick: cfg.control_tick(),
        });
    let control_task = tokio::spawn(control.run(bus.subscribe_to(Topic::Sessions)));

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stopped(shutdown) => debug!("simulation interrupted"),
    }

    stores
        .sessions
        .disconnect_session(robot_id, Some("simulation finished"), "operator", false)
        .map_err(err)?;
    let exit = control_task.await.map_err(|e| e.to_string())?;

    let frames_received = tokio::time::timeout(Duration::from_secs(2), robot_task)
        .await
        .map_err(|_| "simulated robot did not acknowledge the disconnect".to_string())?
        .map_err(|e| e.to_string())?;
    poller.abort();
    // Both exit on their own once the bridge is torn down.
    let _ = pump.await;
    let _ = supervisor.await;

    let final_status = stores.sessions.history(robot_id).map_err(err)?.first().map(|s| s.status);
    Ok(SimReport {
        robot_id: robot_id.to_string(),
        exit,
        stats: bridge.stats(),
        frames_received,
        final_status,
        cameras: stores.cameras.list(robot_id).map_err(err)?.len(),
        online: stores.telemetry.is_online(robot_id).map_err(err)?,
    })
}

/// Resolves once `shutdown` turns `true`. Never resolves if the sender is
/// gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A slow sweep on the first axis; the other channels rest.
fn spawn_input_poller(input: LatchedInput, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut phase = 0.0_f64;
        loop {
            ticker.tick().await;
            phase += period.as_secs_f64();
            let mut sample = vec![0.0; 12];
            sample[0] = phase.sin();
            input.set(sample);
        }
    })
}

fn spawn_robot(
    channel: LoopbackDataChannel,
    robot_id: String,
    codec: ChannelCodec,
    mut sessions: TopicReceiver,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let hello = [
            json!({"type": "cameras", "cameras": [
                {"name": "front", "port": "5000"},
                {"name": "rear", "port": "5001"}
            ]}),
            json!({"type": "telemetry", "robot_id": robot_id, "status": "armed",
                   "battery": 97.0, "position": {"lat": 40.4168, "lng": -3.7038}}),
        ];
        for frame in hello {
            let _ = channel.try_send(frame.to_string().as_bytes());
        }

        let mut frames = 0u64;
        loop {
            tokio::select! {
                received = channel.recv() => match received {
                    Some(bytes) => {
                        if codec.decode(&bytes).is_ok() {
                            frames += 1;
                        }
                    }
                    None => break,
                },
                event = sessions.recv() => {
                    if let Ok(event) = event
                        && let EventPayload::SessionTransition {
                            to: SessionStatus::DisconnectRequested | SessionStatus::RebootDisconnectRequested,
                            ..
                        } = event.payload
                    {
                        let _ = channel.try_send(json!({"type": "disconnect_ack"}).to_string().as_bytes());
                    }
                }
            }
        }
        debug!(robot_id, frames, "simulated robot finished");
        frames
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_session_ends_with_acknowledged_disconnect() {
        let mut cfg = Config::default();
        cfg.control_tick_ms = 20;
        cfg.input_poll_ms = 5;
        let (_tx, rx) = watch::channel(false);

        let report = run(&cfg, "SIM-1", Duration::from_millis(200), rx).await.unwrap();

        assert_eq!(report.exit, LoopExit::Halted(SessionStatus::DisconnectRequested));
        assert_eq!(report.final_status, Some(SessionStatus::Disconnected));
        assert!(report.stats.sent > 0);
        assert!(report.frames_received > 0);
        assert!(report.frames_received <= report.stats.sent);
        assert_eq!(report.cameras, 2);
        assert!(report.online);
    }

    #[tokio::test]
    async fn shutdown_signal_cuts_the_run_short() {
        let cfg = Config::default();
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);

        let started = std::time::Instant::now();
        let report = run(&cfg, "SIM-2", Duration::from_secs(60), rx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.final_status, Some(SessionStatus::Disconnected));
    }

    #[tokio::test]
    async fn invalid_deadzone_is_rejected_up_front() {
        let mut cfg = Config::default();
        cfg.deadzone = 1.5;
        let (_tx, rx) = watch::channel(false);
        assert!(run(&cfg, "SIM-3", Duration::from_millis(10), rx).await.is_err());
    }

    #[tokio::test]
    async fn axis_map_is_checked_before_the_session_opens() {
        let mut cfg = Config::default();
        cfg.axis_map = vec![1, 0];
        let (_tx, rx) = watch::channel(false);
        let err = run(&cfg, "SIM-4", Duration::from_millis(10), rx).await.unwrap_err();
        assert!(err.contains("axis map"), "{err}");
    }

    #[tokio::test]
    async fn remapped_axes_still_drive_the_robot() {
        let mut cfg = Config::default();
        cfg.control_tick_ms = 20;
        cfg.input_poll_ms = 5;
        cfg.axis_map = vec![7, 6, 5, 4, 3, 2, 1, 0];
        let (_tx, rx) = watch::channel(false);

        let report = run(&cfg, "SIM-5", Duration::from_millis(150), rx).await.unwrap();
        assert!(report.stats.sent > 0);
        assert_eq!(report.final_status, Some(SessionStatus::Disconnected));
    }
}
