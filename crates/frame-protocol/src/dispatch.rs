use crate::commands::{self, providers};
use crate::error::ProtocolError;
use crate::frame::{ErrorCode, Frame, FrameType, PROTOCOL_VERSION};
use crate::link::ReplySink;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What a handler wants sent back for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Ack,
    Nack(ErrorCode),
    Response(Vec<u8>),
    /// No immediate reply. The handler answers later through [`Request::replies`] using
    /// the request's `seq` and `command`.
    Deferred,
}

/// A request as seen by a handler.
pub struct Request<'a> {
    pub seq: u8,
    pub command: u16,
    pub payload: &'a [u8],
    pub replies: &'a ReplySink,
}

impl Request<'_> {
    /// Owned copy of the fields a deferred task needs.
    pub fn detach(&self) -> DeferredReply {
        DeferredReply {
            seq: self.seq,
            command: self.command,
            replies: self.replies.clone(),
        }
    }
}

/// Everything needed to answer a request after its handler has returned.
#[derive(Clone, Debug)]
pub struct DeferredReply {
    pub seq: u8,
    pub command: u16,
    pub replies: ReplySink,
}

impl DeferredReply {
    pub async fn respond(&self, payload: Vec<u8>) {
        if let Err(e) = self.replies.send_response(self.seq, self.command, payload).await {
            warn!(seq = self.seq, command = self.command, error = %e, "deferred response lost");
        }
    }

    pub async fn nack(&self, code: ErrorCode) {
        if let Err(e) = self.replies.send_nack(self.seq, self.command, code).await {
            warn!(seq = self.seq, command = self.command, error = %e, "deferred nack lost");
        }
    }

    pub async fn ack(&self) {
        if let Err(e) = self.replies.send_ack(self.seq, self.command).await {
            warn!(seq = self.seq, command = self.command, error = %e, "deferred ack lost");
        }
    }

    /// Send a handler result; `Deferred` is meaningless here and is dropped.
    pub async fn complete(&self, result: HandlerResult) {
        match result {
            HandlerResult::Ack => self.ack().await,
            HandlerResult::Nack(code) => self.nack(code).await,
            HandlerResult::Response(payload) => self.respond(payload).await,
            HandlerResult::Deferred => {
                warn!(seq = self.seq, command = self.command, "deferred reply completed as deferred")
            }
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn handle(&self, request: Request<'_>) -> HandlerResult;
}

impl<F> CommandHandler for F
where
    F: Fn(Request<'_>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, request: Request<'_>) -> HandlerResult {
        self(request)
    }
}

/// Named source of a status blob for the aggregate query commands.
pub trait StatusProvider: Send + Sync {
    fn status(&self) -> Vec<u8>;
}

impl<F> StatusProvider for F
where
    F: Fn() -> Vec<u8> + Send + Sync,
{
    fn status(&self) -> Vec<u8> {
        self()
    }
}

pub type PassthroughSink = Box<dyn Fn(&Frame) + Send + Sync>;

/// Command dispatch table plus the built-in aggregate commands.
pub struct Router {
    handlers: HashMap<u16, Arc<dyn CommandHandler>>,
    providers: HashMap<String, Arc<dyn StatusProvider>>,
    passthrough: Option<PassthroughSink>,
    firmware: [u8; 3],
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            providers: HashMap::new(),
            passthrough: None,
            firmware: [
                parse_version(env!("CARGO_PKG_VERSION_MAJOR")),
                parse_version(env!("CARGO_PKG_VERSION_MINOR")),
                parse_version(env!("CARGO_PKG_VERSION_PATCH")),
            ],
        }
    }

    /// Version triple reported by `SYS_VERSION` after the protocol byte.
    pub fn with_firmware_version(mut self, major: u8, minor: u8, patch: u8) -> Self {
        self.firmware = [major, minor, patch];
        self
    }

    pub fn register<H>(&mut self, command: u16, handler: H) -> Result<(), ProtocolError>
    where
        H: CommandHandler + 'static,
    {
        if self.handlers.contains_key(&command) {
            return Err(ProtocolError::DuplicateCommand(command));
        }
        self.handlers.insert(command, Arc::new(handler));
        Ok(())
    }

    pub fn register_provider<P>(&mut self, name: &str, provider: P) -> Result<(), ProtocolError>
    where
        P: StatusProvider + 'static,
    {
        if self.providers.contains_key(name) {
            return Err(ProtocolError::DuplicateProvider(name.to_string()));
        }
        self.providers.insert(name.to_string(), Arc::new(provider));
        Ok(())
    }

    pub fn set_passthrough<F>(&mut self, sink: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.passthrough = Some(Box::new(sink));
    }

    pub fn handles(&self, command: u16) -> bool {
        self.handlers.contains_key(&command)
            || builtin_provider(command).is_some()
            || matches!(command, commands::SYS_PING | commands::SYS_VERSION)
    }

    /// Dispatch one inbound frame, returning the immediate reply if there is one.
    pub fn route(&self, frame: &Frame, replies: &ReplySink) -> Option<Frame> {
        match frame.frame_type {
            FrameType::Request => {}
            FrameType::Passthrough(kind) => {
                match &self.passthrough {
                    Some(sink) => sink(frame),
                    None => debug!(kind, len = frame.payload.len(), "passthrough frame dropped"),
                }
                return None;
            }
            other => {
                debug!(?other, seq = frame.seq, command = frame.command, "ignoring inbound non-request");
                return None;
            }
        }

        if frame.version != PROTOCOL_VERSION {
            warn!(version = frame.version, seq = frame.seq, "unsupported protocol version");
            return Some(Frame::nack(frame.seq, frame.command, ErrorCode::VersionUnsupported));
        }

        let result = match self.handlers.get(&frame.command) {
            Some(handler) => handler.handle(Request {
                seq: frame.seq,
                command: frame.command,
                payload: &frame.payload,
                replies,
            }),
            None => self.builtin(frame.command),
        };
        trace!(seq = frame.seq, command = frame.command, ?result, "request handled");
        self.reply_for(frame, result)
    }

    fn builtin(&self, command: u16) -> HandlerResult {
        match command {
            commands::SYS_PING => HandlerResult::Ack,
            commands::SYS_VERSION => {
                let [major, minor, patch] = self.firmware;
                HandlerResult::Response(vec![PROTOCOL_VERSION, major, minor, patch])
            }
            _ => match builtin_provider(command) {
                Some(name) => match self.providers.get(name) {
                    Some(provider) => HandlerResult::Response(provider.status()),
                    None => {
                        debug!(provider = name, "status provider not registered");
                        HandlerResult::Nack(ErrorCode::NotReady)
                    }
                },
                None => {
                    debug!(command = format_args!("0x{command:04X}"), "unknown command");
                    HandlerResult::Nack(ErrorCode::UnknownCommand)
                }
            },
        }
    }

    fn reply_for(&self, request: &Frame, result: HandlerResult) -> Option<Frame> {
        let (seq, command) = (request.seq, request.command);
        match result {
            HandlerResult::Ack => Some(Frame::ack(seq, command)),
            HandlerResult::Nack(code) => Some(Frame::nack(seq, command, code)),
            HandlerResult::Response(payload) => match Frame::response(seq, command, payload) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!(seq, command, error = %e, "handler response does not fit a frame");
                    Some(Frame::nack(seq, command, ErrorCode::ExecFailed))
                }
            },
            HandlerResult::Deferred => None,
        }
    }
}

fn builtin_provider(command: u16) -> Option<&'static str> {
    match command {
        commands::SENSOR_READ_ALL => Some(providers::SENSORS),
        commands::MOTOR_GET_ALL => Some(providers::MOTORS),
        commands::QUERY_POWER => Some(providers::POWER),
        commands::QUERY_STATUS => Some(providers::STATUS),
        commands::QUERY_NETWORK => Some(providers::NETWORK),
        _ => None,
    }
}

fn parse_version(part: &str) -> u8 {
    part.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(seq: u8, command: u16, payload: Vec<u8>) -> Frame {
        Frame::request(seq, command, payload).unwrap()
    }

    #[test]
    fn ping_and_version_are_built_in() {
        let (sink, _rx) = ReplySink::channel(4);
        let router = Router::new().with_firmware_version(1, 2, 3);

        let reply = router.route(&request(5, SYS_PING, vec![]), &sink).unwrap();
        assert_eq!(reply.frame_type, FrameType::Ack);
        assert_eq!(reply.seq, 5);

        let reply = router.route(&request(6, SYS_VERSION, vec![]), &sink).unwrap();
        assert_eq!(reply.frame_type, FrameType::Response);
        assert_eq!(reply.payload, vec![PROTOCOL_VERSION, 1, 2, 3]);
    }

    #[test]
    fn unknown_command_is_nacked_with_request_seq() {
        let (sink, _rx) = ReplySink::channel(4);
        let router = Router::new();
        let reply = router.route(&request(77, 0x5A5A, vec![1, 2]), &sink).unwrap();
        assert_eq!(reply.seq, 77);
        assert_eq!(reply.command, 0x5A5A);
        assert_eq!(reply.nack_code(), Some(ErrorCode::UnknownCommand));
    }

    #[test]
    fn version_check_precedes_lookup() {
        let (sink, _rx) = ReplySink::channel(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut router = Router::new();
        router
            .register(MOTOR_ENABLE, move |_req: Request<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                HandlerResult::Ack
            })
            .unwrap();
        let frame = Frame::with_version(0x20, FrameType::Request, 3, MOTOR_ENABLE, vec![1]).unwrap();
        let reply = router.route(&frame, &sink).unwrap();
        assert_eq!(reply.nack_code(), Some(ErrorCode::VersionUnsupported));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_results_map_to_frame_types() {
        let (sink, _rx) = ReplySink::channel(4);
        let mut router = Router::new();
        router.register(0x3001, |_: Request<'_>| HandlerResult::Ack).unwrap();
        router
            .register(0x3002, |_: Request<'_>| HandlerResult::Nack(ErrorCode::DeviceBusy))
            .unwrap();
        router
            .register(0x3003, |req: Request<'_>| HandlerResult::Response(req.payload.to_vec()))
            .unwrap();
        router.register(0x3004, |_: Request<'_>| HandlerResult::Deferred).unwrap();

        assert_eq!(
            router.route(&request(1, 0x3001, vec![]), &sink).map(|f| f.frame_type),
            Some(FrameType::Ack)
        );
        assert_eq!(
            router.route(&request(2, 0x3002, vec![]), &sink).and_then(|f| f.nack_code()),
            Some(ErrorCode::DeviceBusy)
        );
        assert_eq!(
            router.route(&request(3, 0x3003, vec![9, 8]), &sink).map(|f| f.payload),
            Some(vec![9, 8])
        );
        assert_eq!(router.route(&request(4, 0x3004, vec![]), &sink), None);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut router = Router::new();
        router.register(0x3001, |_: Request<'_>| HandlerResult::Ack).unwrap();
        assert_eq!(
            router.register(0x3001, |_: Request<'_>| HandlerResult::Ack),
            Err(ProtocolError::DuplicateCommand(0x3001))
        );
        router.register_provider("motors", Vec::<u8>::new).unwrap();
        assert_eq!(
            router.register_provider("motors", Vec::<u8>::new),
            Err(ProtocolError::DuplicateProvider("motors".into()))
        );
    }

    #[test]
    fn aggregate_queries_use_providers() {
        let (sink, _rx) = ReplySink::channel(4);
        let mut router = Router::new();
        router.register_provider(providers::MOTORS, || vec![0]).unwrap();

        let reply = router.route(&request(1, MOTOR_GET_ALL, vec![]), &sink).unwrap();
        assert_eq!(reply.frame_type, FrameType::Response);
        assert_eq!(reply.payload, vec![0]);

        let reply = router.route(&request(2, SENSOR_READ_ALL, vec![]), &sink).unwrap();
        assert_eq!(reply.nack_code(), Some(ErrorCode::NotReady));
        assert!(router.handles(QUERY_POWER));
        assert!(!router.handles(0x3001));
    }

    #[test]
    fn registered_handler_overrides_builtin() {
        let (sink, _rx) = ReplySink::channel(4);
        let mut router = Router::new();
        router
            .register(SYS_PING, |_: Request<'_>| HandlerResult::Response(b"pong".to_vec()))
            .unwrap();
        let reply = router.route(&request(1, SYS_PING, vec![]), &sink).unwrap();
        assert_eq!(reply.payload, b"pong".to_vec());
    }

    #[test]
    fn non_requests_are_dropped_and_passthrough_forwarded() {
        let (sink, _rx) = ReplySink::channel(4);
        let forwarded = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&forwarded);
        let mut router = Router::new();
        router.set_passthrough(move |frame: &Frame| {
            count.fetch_add(frame.payload.len(), Ordering::SeqCst);
        });

        assert_eq!(router.route(&Frame::ack(1, SYS_PING), &sink), None);
        assert_eq!(router.route(&Frame::notify(0x3020, vec![1]).unwrap(), &sink), None);
        let raw = Frame::new(FrameType::Passthrough(0x85), 0, 0, vec![1, 2, 3]).unwrap();
        assert_eq!(router.route(&raw, &sink), None);
        assert_eq!(forwarded.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deferred_handler_replies_through_sink() -> anyhow::Result<()> {
        let (sink, mut rx) = ReplySink::channel(4);
        let mut router = Router::new();
        router.register(MOTOR_GET_POS, |req: Request<'_>| {
            let reply = req.detach();
            let id = req.payload.first().copied().unwrap_or(0);
            tokio::spawn(async move { reply.respond(vec![id, 0, 0, 0, 0]).await });
            HandlerResult::Deferred
        })?;

        assert_eq!(router.route(&request(9, MOTOR_GET_POS, vec![3]), &sink), None);
        let late = rx.recv().await.ok_or_else(|| anyhow::anyhow!("no deferred reply"))?;
        assert_eq!(late.seq, 9);
        assert_eq!(late.command, MOTOR_GET_POS);
        assert_eq!(late.frame_type, FrameType::Response);
        assert_eq!(late.payload[0], 3);
        Ok(())
    }
}
