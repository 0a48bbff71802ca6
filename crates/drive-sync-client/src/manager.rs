//! Connection manager: owns the single websocket and drives the
//! [`ConnectionMachine`] from one task, so heartbeat, reconnect and inbound
//! dispatch never race each other.

use crate::backoff::ReconnectPolicy;
use crate::config::transport_url;
use crate::machine::{ConnectionMachine, Effect, Input, Phase};
use drive_sync_core::context::AppContext;
use drive_sync_core::protocol::{
    encode_frame, OutboundCommand, AUTH_FAILURE_CLOSE_CODE, DEFAULT_MAX_FRAME_BYTES,
};
use drive_sync_core::router::EventRouter;
use drive_sync_core::ui::{NoticeLevel, NOT_CONNECTED_NOTICE};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type DialFuture = BoxFuture<'static, Result<WsStream, tungstenite::Error>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub const SESSION_REJECTED_NOTICE: &str = "Session rejected by the server. Please sign in again.";

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Realtime endpoint without the token query.
    pub endpoint: Url,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_frame_bytes: usize,
}

impl ConnectionSettings {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: Phase,
    pub attempt: u32,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }
}

enum Control {
    Connect,
    Send {
        command: OutboundCommand,
        reply: oneshot::Sender<bool>,
    },
    Disconnect,
    Teardown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the connection task. Clones share the task; it tears itself
/// down once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    ctx: Arc<AppContext>,
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionManager {
    /// Spawns the connection task on the current runtime. Nothing is dialed
    /// until [`ConnectionManager::connect`].
    pub fn spawn(ctx: Arc<AppContext>, settings: ConnectionSettings) -> Self {
        let machine = ConnectionMachine::new(settings.reconnect);
        let initial = ConnectionStatus {
            phase: machine.phase(),
            attempt: machine.attempt(),
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let router = EventRouter::new(ctx.clone()).with_max_frame_bytes(settings.max_frame_bytes);
        let driver = Driver {
            ctx: ctx.clone(),
            router,
            settings,
            machine,
            status: status_tx,
            socket: None,
            dial: None,
            heartbeat: None,
            reconnect: None,
        };
        tokio::spawn(driver.run(control_rx));
        Self {
            ctx,
            control: control_tx,
            status: status_rx,
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Dials if idle and a session token exists; otherwise a no-op.
    pub fn connect(&self) {
        let _ = self.control.send(Control::Connect);
    }

    /// Transmits immediately when open. Otherwise the command is dropped,
    /// a "not connected" notice is raised and `false` is returned.
    pub async fn send(&self, command: OutboundCommand) -> bool {
        let (reply, rx) = oneshot::channel();
        let kind = command.kind();
        if self.control.send(Control::Send { command, reply }).is_err() {
            warn!(event = "ws_send_dropped", kind, reason = "unmounted");
            self.ctx.ui.push_notice(NoticeLevel::Warning, NOT_CONNECTED_NOTICE);
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Closes the link without scheduling a reconnect; `connect` reopens it.
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    /// Stops both timers, closes the transport and ends the task. Later calls
    /// on any handle are no-ops.
    pub async fn teardown(&self) {
        let (done, rx) = oneshot::channel();
        if self.control.send(Control::Teardown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Resolves once the status satisfies `pred`, or with the last status if
    /// the task has ended.
    pub async fn wait_until(&self, pred: impl Fn(&ConnectionStatus) -> bool) -> ConnectionStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|status| pred(status)).await {
            return *status;
        }
        let last = *rx.borrow();
        last
    }
}

struct Driver {
    ctx: Arc<AppContext>,
    router: EventRouter,
    settings: ConnectionSettings,
    machine: ConnectionMachine,
    status: watch::Sender<ConnectionStatus>,
    socket: Option<WsStream>,
    dial: Option<DialFuture>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) {
        loop {
            tokio::select! {
                msg = control.recv() => match msg {
                    Some(Control::Connect) => {
                        let has_token = self.ctx.auth.access_token().is_some();
                        self.feed(Input::Connect { has_token }).await;
                    }
                    Some(Control::Send { command, reply }) => {
                        let sent = self.send(&command).await;
                        let _ = reply.send(sent);
                    }
                    Some(Control::Disconnect) => self.feed(Input::Disconnect).await,
                    Some(Control::Teardown { done }) => {
                        self.feed(Input::Teardown).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.feed(Input::Teardown).await;
                        break;
                    }
                },
                result = dial(&mut self.dial) => {
                    self.dial = None;
                    match result {
                        Ok(ws) => {
                            self.socket = Some(ws);
                            self.feed(Input::Opened).await;
                        }
                        Err(err) => {
                            warn!(event = "ws_connect_error", error = %err, attempt = self.machine.attempt());
                            self.feed(Input::DialFailed).await;
                        }
                    }
                }
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                _ = tick(&mut self.heartbeat) => self.feed(Input::HeartbeatTick).await,
                _ = fire(&mut self.reconnect) => {
                    self.reconnect = None;
                    let has_token = self.ctx.auth.access_token().is_some();
                    self.feed(Input::ReconnectFired { has_token }).await;
                }
            }
        }
        info!(event = "ws_manager_stopped");
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.router.dispatch_text(&text);
            }
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => {
                    self.router.dispatch_text(&text);
                }
                Err(_) => warn!(event = "ws_frame_dropped", reason = "binary_not_utf8"),
            },
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                self.closed(code, frame.as_ref()).await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(err)) => {
                warn!(event = "ws_read_error", error = %err);
                self.closed(None, None).await;
            }
            None => self.closed(None, None).await,
        }
    }

    async fn closed(&mut self, code: Option<u16>, frame: Option<&CloseFrame<'_>>) {
        self.socket = None;
        info!(
            event = "ws_closed",
            code = code.unwrap_or(1006),
            reason = frame.map(|f| f.reason.as_ref()).unwrap_or(""),
            phase = self.machine.phase().as_str()
        );
        if code == Some(AUTH_FAILURE_CLOSE_CODE) {
            self.ctx.ui.push_notice(NoticeLevel::Error, SESSION_REJECTED_NOTICE);
        }
        self.feed(Input::Closed { code }).await;
    }

    async fn send(&mut self, command: &OutboundCommand) -> bool {
        if !self.machine.can_send() || self.socket.is_none() {
            warn!(
                event = "ws_send_dropped",
                kind = command.kind(),
                phase = self.machine.phase().as_str()
            );
            self.ctx.ui.push_notice(NoticeLevel::Warning, NOT_CONNECTED_NOTICE);
            return false;
        }
        self.transmit(command).await
    }

    async fn transmit(&mut self, command: &OutboundCommand) -> bool {
        let text = match encode_frame(command, self.settings.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "ws_encode_error", kind = command.kind(), error = %err);
                return false;
            }
        };
        let Some(ws) = self.socket.as_mut() else {
            return false;
        };
        let result = ws.send(Message::Text(text)).await;
        match result {
            Ok(()) => {
                if matches!(command, OutboundCommand::Ping) {
                    debug!(event = "heartbeat_sent");
                } else {
                    debug!(event = "ws_sent", kind = command.kind());
                }
                true
            }
            Err(err) => {
                warn!(event = "ws_write_error", kind = command.kind(), error = %err);
                self.closed(None, None).await;
                false
            }
        }
    }

    /// Feeds one input through the machine and applies its effects. Effects
    /// that fail feed follow-up inputs, hence the boxing.
    fn feed(&mut self, input: Input) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let before = self.machine.phase();
            let effects = self.machine.handle(input);
            for effect in effects {
                self.apply(effect).await;
            }
            let status = ConnectionStatus {
                phase: self.machine.phase(),
                attempt: self.machine.attempt(),
            };
            if before != status.phase {
                debug!(event = "ws_phase", from = before.as_str(), to = status.phase.as_str());
            }
            self.status.send_if_modified(|current| {
                if *current == status {
                    return false;
                }
                *current = status;
                true
            });
            self.ctx.ui.set_connection(self.machine.banner());
        })
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Dial => {
                let Some(token) = self.ctx.auth.access_token() else {
                    self.feed(Input::DialFailed).await;
                    return;
                };
                let url = transport_url(&self.settings.endpoint, &token);
                info!(
                    event = "ws_connecting",
                    endpoint = %self.settings.endpoint,
                    attempt = self.machine.attempt()
                );
                self.dial = Some(Box::pin(async move {
                    connect_async(url.as_str()).await.map(|(ws, _)| ws)
                }));
            }
            Effect::AbortDial => self.dial = None,
            Effect::StartHeartbeat => {
                info!(event = "ws_open");
                let period = self.settings.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::SendPing => {
                self.transmit(&OutboundCommand::Ping).await;
            }
            Effect::ScheduleReconnect(delay) => {
                info!(
                    event = "ws_reconnect_scheduled",
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.machine.attempt() + 1
                );
                self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Effect::CancelReconnect => self.reconnect = None,
            Effect::CloseTransport => {
                let unmounted = self.machine.phase() == Phase::Unmounted;
                if let Some(ws) = self.socket.as_mut() {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                }
                // A closing link keeps reading until the peer acknowledges.
                if unmounted {
                    self.socket = None;
                }
            }
            Effect::RecoverStream => {
                if self.ctx.chat.force_finalize() {
                    warn!(event = "stream_recovered", reason = "connection_lost");
                }
            }
        }
    }
}

async fn dial(slot: &mut Option<DialFuture>) -> Result<WsStream, tungstenite::Error> {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(slot: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match slot {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn tick(slot: &mut Option<Interval>) {
    match slot {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn fire(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
