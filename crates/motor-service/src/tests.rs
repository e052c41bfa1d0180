//! End-to-end: host client -> link -> router -> controller -> CAN -> simulated servos.

use crate::{spawn_liveness, MotorService};
use can_transport::MockBus;
use frame_protocol::commands::*;
use frame_protocol::{be, ClientTasks, ErrorCode, Frame, FrameType, Link, LinkClient, LinkError, ReplySink, Router};
use motor_registry::{
    registers, CanDriver, CanHandle, ConfirmPolicy, Confirmer, DriverOptions, LivenessMonitor,
    LivenessPolicy, MetricsHub, MotorConfig, MotorController, MotorRegistry, ServoSim,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

struct Rig {
    client: LinkClient,
    notes: mpsc::Receiver<Frame>,
    sim: ServoSim,
    registry: Arc<MotorRegistry>,
    can: CanHandle,
    replies: ReplySink,
    _driver: CanDriver,
    _tasks: ClientTasks,
}

fn rig() -> anyhow::Result<Rig> {
    let configs = [
        MotorConfig::new(1).with_master_id(0x11),
        MotorConfig::new(2).with_master_id(0x12),
    ];
    let registry = Arc::new(MotorRegistry::from_configs(&configs)?);
    let sim = ServoSim::new(&configs);
    let hub = MetricsHub::new()?;
    let bus = MockBus::with_responder("mock0", sim.responder());
    let (driver, can) = CanDriver::spawn(
        bus,
        Arc::clone(&registry),
        Some(hub.motors.clone()),
        DriverOptions::default(),
    )?;
    let policy = ConfirmPolicy {
        timeout: Duration::from_millis(200),
        poll: Duration::from_millis(5),
    };
    let confirm = Confirmer::new(Arc::clone(&registry), can.clone(), policy).with_metrics(hub.motors.clone());
    let controller = MotorController::new(Arc::clone(&registry), confirm);

    let mut router = Router::new();
    MotorService::new(controller).with_metrics(hub).install(&mut router)?;
    let mut link = Link::new(router, 32);
    let replies = link.replies();

    let (host, device) = duplex(8192);
    tokio::spawn(async move {
        let (r, w) = split(device);
        link.serve(r, w).await
    });
    let (r, w) = split(host);
    let (client, notes, tasks) = LinkClient::spawn(r, w);
    Ok(Rig {
        client,
        notes,
        sim,
        registry,
        can,
        replies,
        _driver: driver,
        _tasks: tasks,
    })
}

fn with_floats(head: &[u8], floats: &[f32]) -> Vec<u8> {
    let mut out = head.to_vec();
    for &f in floats {
        be::put_f32(&mut out, f);
    }
    out
}

fn nack_of(result: Result<Frame, LinkError>) -> Option<ErrorCode> {
    match result {
        Err(LinkError::Nack(code)) => Some(code),
        _ => None,
    }
}

#[tokio::test]
async fn enable_rotate_and_read_position() -> anyhow::Result<()> {
    let rig = rig()?;
    let ack = rig.client.call(MOTOR_ENABLE, vec![1], WAIT).await?;
    assert_eq!(ack.frame_type, FrameType::Ack);

    rig.client
        .call(MOTOR_ROTATE, with_floats(&[1], &[90.0, 30.0]), WAIT)
        .await?;
    let rad = rig.sim.position(1).unwrap_or_default();
    assert!((rad - std::f32::consts::FRAC_PI_2).abs() < 1e-5);

    let reply = rig.client.call(MOTOR_GET_POS, vec![1], WAIT).await?;
    assert_eq!(reply.frame_type, FrameType::Response);
    assert_eq!(reply.payload[0], 1);
    let deg = be::f32_at(&reply.payload, 1).unwrap_or_default();
    assert!((deg - 90.0).abs() < 0.05, "got {deg}");

    rig.client
        .call(MOTOR_ROTATE_REL, with_floats(&[1], &[-45.0, 30.0]), WAIT)
        .await?;
    let rad = rig.sim.position(1).unwrap_or_default();
    assert!((rad.to_degrees() - 45.0).abs() < 0.05);
    Ok(())
}

#[tokio::test]
async fn failures_map_to_nack_codes() -> anyhow::Result<()> {
    let rig = rig()?;
    let rotate = with_floats(&[1], &[10.0, 10.0]);
    assert_eq!(
        nack_of(rig.client.call(MOTOR_ROTATE, rotate, WAIT).await),
        Some(ErrorCode::NotReady)
    );
    assert_eq!(
        nack_of(rig.client.call(MOTOR_ENABLE, vec![9], WAIT).await),
        Some(ErrorCode::InvalidParam)
    );
    assert_eq!(
        nack_of(rig.client.call(MOTOR_ROTATE, vec![1, 0x42], WAIT).await),
        Some(ErrorCode::InvalidParam)
    );
    rig.sim.set_silent(2, true);
    assert_eq!(
        nack_of(rig.client.call(MOTOR_ENABLE, vec![2], WAIT).await),
        Some(ErrorCode::Timeout)
    );
    assert_eq!(
        nack_of(rig.client.call(MOTOR_SET_MODE, vec![1, 7], WAIT).await),
        Some(ErrorCode::InvalidParam)
    );
    Ok(())
}

#[tokio::test]
async fn one_motor_timing_out_does_not_stall_another() -> anyhow::Result<()> {
    let rig = rig()?;
    rig.sim.set_silent(2, true);
    let slow = rig.client.call(MOTOR_ENABLE, vec![2], WAIT);
    let fast = rig.client.call(MOTOR_ENABLE, vec![1], WAIT);
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(fast?.frame_type, FrameType::Ack);
    assert_eq!(nack_of(slow), Some(ErrorCode::Timeout));
    Ok(())
}

#[tokio::test]
async fn get_all_lists_every_motor() -> anyhow::Result<()> {
    let rig = rig()?;
    rig.client.call(MOTOR_ENABLE, vec![2], WAIT).await?;
    let reply = rig.client.call(MOTOR_GET_ALL, Vec::new(), WAIT).await?;
    assert_eq!(reply.payload.len(), 1 + 2 * crate::payload::MOTOR_RECORD_LEN);
    assert_eq!(reply.payload[0], 2);
    let second = &reply.payload[1 + crate::payload::MOTOR_RECORD_LEN..];
    assert_eq!(&second[..3], &[2, 1, 1]);
    Ok(())
}

#[tokio::test]
async fn register_read_write_over_the_link() -> anyhow::Result<()> {
    let rig = rig()?;
    let reply = rig
        .client
        .call(MOTOR_READ_REG, vec![1, registers::PMAX], WAIT)
        .await?;
    assert_eq!(&reply.payload[..2], &[1, registers::PMAX]);
    assert_eq!(be::f32_at(&reply.payload, 2), Some(12.5));

    let reply = rig
        .client
        .call(MOTOR_WRITE_REG, with_floats(&[1, registers::VMAX], &[20.0]), WAIT)
        .await?;
    assert_eq!(reply.payload, vec![1, registers::VMAX]);
    assert_eq!(rig.registry.snapshot(1)?.vmax, 20.0);

    let negative_mode = with_floats(&[1, registers::CTRL_MODE], &[-1.0]);
    assert_eq!(
        nack_of(rig.client.call(MOTOR_WRITE_REG, negative_mode, WAIT).await),
        Some(ErrorCode::InvalidParam)
    );
    assert_eq!(
        nack_of(rig.client.call(MOTOR_READ_REG, vec![1, 200], WAIT).await),
        Some(ErrorCode::InvalidParam)
    );

    rig.client.call(MOTOR_SAVE_PARAMS, vec![1], WAIT).await?;
    assert_eq!(rig.sim.saves(1), 1);
    let reply = rig.client.call(MOTOR_REFRESH, vec![1], WAIT).await?;
    assert_eq!(reply.payload.len(), crate::payload::MOTOR_RECORD_LEN);
    Ok(())
}

#[tokio::test]
async fn stop_all_reports_silent_motor() -> anyhow::Result<()> {
    let rig = rig()?;
    let ack = rig.client.call(MOTOR_STOP, vec![MOTOR_ID_ALL], WAIT).await?;
    assert_eq!(ack.frame_type, FrameType::Ack);
    rig.sim.set_silent(1, true);
    assert_eq!(
        nack_of(rig.client.call(MOTOR_STOP, vec![MOTOR_ID_ALL], WAIT).await),
        Some(ErrorCode::Timeout)
    );
    Ok(())
}

#[tokio::test]
async fn metrics_are_served_as_text() -> anyhow::Result<()> {
    let rig = rig()?;
    rig.client.call(MOTOR_ENABLE, vec![1], WAIT).await?;
    let reply = rig.client.call(DEBUG_METRICS, Vec::new(), WAIT).await?;
    let text = String::from_utf8(reply.payload)?;
    assert!(text.contains("mc_can_tx_frames 1"), "{text}");
    assert!(text.contains("mc_motor_confirm_ok 1"), "{text}");
    Ok(())
}

async fn next_state(notes: &mut mpsc::Receiver<Frame>, want: [u8; 3]) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let frame = tokio::time::timeout_at(deadline, notes.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("notification channel closed"))?;
        if frame.command == MOTOR_STATE_CHANGED && frame.payload == want {
            return Ok(());
        }
    }
}

#[tokio::test]
async fn liveness_pushes_online_and_offline() -> anyhow::Result<()> {
    let mut rig = rig()?;
    let policy = LivenessPolicy {
        offline_after_misses: 3,
        stale_after: Duration::from_millis(100),
    };
    let monitor = LivenessMonitor::new(Arc::clone(&rig.registry), policy);
    let sweep = spawn_liveness(monitor, rig.can.clone(), rig.replies.clone(), Duration::from_millis(10));

    next_state(&mut rig.notes, [1, 1, 0]).await?;
    next_state(&mut rig.notes, [2, 1, 0]).await?;
    rig.sim.set_silent(2, true);
    next_state(&mut rig.notes, [2, 0, 0]).await?;
    sweep.abort();
    Ok(())
}
