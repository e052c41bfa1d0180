//! MOTOR (0x30xx), MOTOR_REGISTER (0x31xx) and DEBUG (0xF0xx) command handlers.
//!
//! Every motor command needs at least one CAN round trip, so handlers return
//! [`HandlerResult::Deferred`] and answer from a spawned task once the motor has replied.

use crate::error::{Result, ServiceError};
use crate::payload::{self, Args};
use frame_protocol::commands::{self, providers};
use frame_protocol::{be, CommandHandler, ErrorCode, HandlerResult, ProtocolError, Request, Router};
use motor_registry::{registers, ControlMode, MetricsHub, MotorController, MotorError, RegisterValue};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Runs an async motor operation per request and completes the reply when it finishes.
struct Deferred<F> {
    controller: MotorController,
    op: F,
}

impl<F, Fut> CommandHandler for Deferred<F>
where
    F: Fn(MotorController, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerResult>> + Send + 'static,
{
    fn handle(&self, request: Request<'_>) -> HandlerResult {
        let Ok(runtime) = Handle::try_current() else {
            warn!(command = request.command, "no async runtime for motor command");
            return HandlerResult::Nack(ErrorCode::NotReady);
        };
        let reply = request.detach();
        let work = (self.op)(self.controller.clone(), request.payload.to_vec());
        runtime.spawn(async move {
            let result = match work.await {
                Ok(result) => result,
                Err(e) => {
                    let code = e.code();
                    warn!(seq = reply.seq, command = reply.command, error = %e, %code, "motor command failed");
                    HandlerResult::Nack(code)
                }
            };
            reply.complete(result).await;
        });
        HandlerResult::Deferred
    }
}

struct MetricsHandler(MetricsHub);

impl CommandHandler for MetricsHandler {
    fn handle(&self, _request: Request<'_>) -> HandlerResult {
        HandlerResult::Response(self.0.encode_text().into_bytes())
    }
}

/// Motor command surface of the host link.
pub struct MotorService {
    controller: MotorController,
    metrics: Option<MetricsHub>,
}

impl MotorService {
    pub fn new(controller: MotorController) -> Self {
        Self {
            controller,
            metrics: None,
        }
    }

    /// Serve `DEBUG_METRICS` from this hub.
    pub fn with_metrics(mut self, hub: MetricsHub) -> Self {
        self.metrics = Some(hub);
        self
    }

    pub fn controller(&self) -> &MotorController {
        &self.controller
    }

    fn defer<F, Fut>(&self, router: &mut Router, command: u16, op: F) -> Result<(), ProtocolError>
    where
        F: Fn(MotorController, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResult>> + Send + 'static,
    {
        router.register(
            command,
            Deferred {
                controller: self.controller.clone(),
                op,
            },
        )
    }

    /// Register every motor command, the "motors" provider and, with a hub, the metrics dump.
    pub fn install(&self, router: &mut Router) -> Result<(), ProtocolError> {
        self.defer(router, commands::MOTOR_ROTATE, rotate)?;
        self.defer(router, commands::MOTOR_ENABLE, enable)?;
        self.defer(router, commands::MOTOR_DISABLE, disable)?;
        self.defer(router, commands::MOTOR_STOP, stop)?;
        self.defer(router, commands::MOTOR_SET_ORIGIN, set_origin)?;
        self.defer(router, commands::MOTOR_GET_POS, get_position)?;
        self.defer(router, commands::MOTOR_SET_VEL, set_velocity)?;
        self.defer(router, commands::MOTOR_ROTATE_REL, rotate_relative)?;
        self.defer(router, commands::MOTOR_MIT, mit)?;
        self.defer(router, commands::MOTOR_CLEAR_ERROR, clear_error)?;
        self.defer(router, commands::MOTOR_SET_MODE, set_mode)?;
        self.defer(router, commands::MOTOR_READ_REG, read_register)?;
        self.defer(router, commands::MOTOR_WRITE_REG, write_register)?;
        self.defer(router, commands::MOTOR_SAVE_PARAMS, save_params)?;
        self.defer(router, commands::MOTOR_REFRESH, refresh)?;

        let registry = Arc::clone(self.controller.registry());
        router.register_provider(providers::MOTORS, move || {
            payload::all_motors(&registry.snapshot_all())
        })?;
        if let Some(hub) = &self.metrics {
            router.register(commands::DEBUG_METRICS, MetricsHandler(hub.clone()))?;
        }
        debug!("motor commands installed");
        Ok(())
    }
}

async fn rotate(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let (id, angle, velocity) = (args.u8()?, args.angle()?, args.angle()?);
    ctl.rotate_to(id, angle, velocity).await?;
    Ok(HandlerResult::Ack)
}

async fn rotate_relative(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let (id, delta, velocity) = (args.u8()?, args.angle()?, args.angle()?);
    ctl.rotate_by(id, delta, velocity).await?;
    Ok(HandlerResult::Ack)
}

async fn enable(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    ctl.enable(Args::new(&p).u8()?).await?;
    Ok(HandlerResult::Ack)
}

async fn disable(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    ctl.disable(Args::new(&p).u8()?).await?;
    Ok(HandlerResult::Ack)
}

async fn stop(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let id = Args::new(&p).u8()?;
    if id != commands::MOTOR_ID_ALL {
        ctl.stop(id).await?;
        return Ok(HandlerResult::Ack);
    }
    let mut first_failure = None;
    for (can_id, outcome) in ctl.stop_all().await {
        if let Err(e) = outcome {
            warn!(can_id, error = %e, "stop-all: motor did not confirm");
            first_failure.get_or_insert(e);
        }
    }
    match first_failure {
        Some(e) => Err(e.into()),
        None => Ok(HandlerResult::Ack),
    }
}

async fn set_origin(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    ctl.set_origin(Args::new(&p).u8()?).await?;
    Ok(HandlerResult::Ack)
}

async fn clear_error(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    ctl.clear_error(Args::new(&p).u8()?).await?;
    Ok(HandlerResult::Ack)
}

async fn get_position(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let id = Args::new(&p).u8()?;
    let position = ctl.position(id).await?;
    Ok(HandlerResult::Response(payload::position_reply(id, position)))
}

async fn set_velocity(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let (id, velocity) = (args.u8()?, args.angle()?);
    ctl.set_velocity(id, velocity).await?;
    Ok(HandlerResult::Ack)
}

async fn mit(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let id = args.u8()?;
    let cmd = payload::mit_command(&mut args)?;
    ctl.mit(id, cmd).await?;
    Ok(HandlerResult::Ack)
}

async fn set_mode(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let (id, raw) = (args.u8()?, args.u8()?);
    let mode = ControlMode::from_register(u32::from(raw))
        .ok_or(ServiceError::BadPayload("unknown control mode"))?;
    ctl.set_mode(id, mode).await?;
    Ok(HandlerResult::Ack)
}

async fn read_register(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let (id, register) = (args.u8()?, args.u8()?);
    let value = ctl.read_register(id, register).await?;
    let mut out = vec![id, register];
    be::put_f32(&mut out, value.as_f32());
    Ok(HandlerResult::Response(out))
}

async fn write_register(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let mut args = Args::new(&p);
    let (id, register, raw) = (args.u8()?, args.u8()?, args.f32()?);
    let desc = registers::lookup(register).ok_or(MotorError::UnknownRegister(register))?;
    let value = RegisterValue::from_f32(desc, raw)
        .ok_or(MotorError::InvalidValue("register value out of range"))?;
    ctl.write_register(id, register, value).await?;
    Ok(HandlerResult::Response(vec![id, register]))
}

async fn save_params(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    ctl.save_params(Args::new(&p).u8()?).await?;
    Ok(HandlerResult::Ack)
}

async fn refresh(ctl: MotorController, p: Vec<u8>) -> Result<HandlerResult> {
    let motor = ctl.refresh(Args::new(&p).u8()?).await?;
    let mut out = Vec::with_capacity(payload::MOTOR_RECORD_LEN);
    payload::motor_record(&mut out, &motor);
    Ok(HandlerResult::Response(out))
}
