use crate::backoff::ReconnectPolicy;
use drive_sync_core::protocol::AUTH_FAILURE_CLOSE_CODE;
use drive_sync_core::ui::ConnectionBanner;
use std::time::Duration;

/// Lifecycle of the realtime link. A reconnect timer can only be armed in
/// `Idle`, and the heartbeat only runs in `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle { reconnect_in: Option<Duration> },
    Connecting,
    Open,
    Closing,
    Unmounted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle { .. } => "idle",
            Phase::Connecting => "connecting",
            Phase::Open => "open",
            Phase::Closing => "closing",
            Phase::Unmounted => "unmounted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Connect { has_token: bool },
    Opened,
    DialFailed,
    Closed { code: Option<u16> },
    HeartbeatTick,
    ReconnectFired { has_token: bool },
    Disconnect,
    Teardown,
}

/// Side effects the driver performs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Dial,
    AbortDial,
    StartHeartbeat,
    StopHeartbeat,
    SendPing,
    ScheduleReconnect(Duration),
    CancelReconnect,
    CloseTransport,
    RecoverStream,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    phase: Phase,
    attempt: u32,
    policy: ReconnectPolicy,
    last_delay: Duration,
    auth_rejected: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            phase: Phase::Idle { reconnect_in: None },
            attempt: 0,
            policy,
            last_delay: Duration::ZERO,
            auth_rejected: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn can_send(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn banner(&self) -> ConnectionBanner {
        match self.phase {
            Phase::Open => ConnectionBanner::Connected,
            Phase::Connecting if self.attempt == 0 => ConnectionBanner::Connecting,
            Phase::Connecting => ConnectionBanner::Reconnecting {
                attempt: self.attempt,
                delay: self.last_delay,
            },
            Phase::Idle {
                reconnect_in: Some(delay),
            } => ConnectionBanner::Reconnecting {
                attempt: self.attempt + 1,
                delay,
            },
            Phase::Idle { reconnect_in: None } if self.auth_rejected => {
                ConnectionBanner::AuthRejected
            }
            Phase::Idle { reconnect_in: None } | Phase::Closing | Phase::Unmounted => {
                ConnectionBanner::Offline
            }
        }
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.phase == Phase::Unmounted {
            return Vec::new();
        }
        match input {
            Input::Connect { has_token } => self.connect(has_token),
            Input::ReconnectFired { has_token } => match self.phase {
                Phase::Idle {
                    reconnect_in: Some(_),
                } => {
                    self.attempt = self.attempt.saturating_add(1);
                    self.phase = Phase::Idle { reconnect_in: None };
                    self.connect(has_token)
                }
                _ => Vec::new(),
            },
            Input::Opened => match self.phase {
                Phase::Connecting => {
                    self.phase = Phase::Open;
                    self.attempt = 0;
                    self.auth_rejected = false;
                    vec![Effect::StartHeartbeat]
                }
                _ => vec![Effect::CloseTransport],
            },
            Input::DialFailed => match self.phase {
                Phase::Connecting => self.lost(None),
                _ => Vec::new(),
            },
            Input::Closed { code } => match self.phase {
                Phase::Open | Phase::Connecting => self.lost(code),
                Phase::Closing => {
                    self.phase = Phase::Idle { reconnect_in: None };
                    vec![Effect::RecoverStream]
                }
                Phase::Idle { .. } | Phase::Unmounted => Vec::new(),
            },
            Input::HeartbeatTick => match self.phase {
                Phase::Open => vec![Effect::SendPing],
                _ => Vec::new(),
            },
            Input::Disconnect => match self.phase {
                Phase::Open => {
                    self.phase = Phase::Closing;
                    vec![Effect::StopHeartbeat, Effect::CloseTransport]
                }
                Phase::Connecting => {
                    self.phase = Phase::Idle { reconnect_in: None };
                    vec![Effect::AbortDial, Effect::RecoverStream]
                }
                Phase::Idle {
                    reconnect_in: Some(_),
                } => {
                    self.phase = Phase::Idle { reconnect_in: None };
                    vec![Effect::CancelReconnect]
                }
                Phase::Idle { reconnect_in: None } | Phase::Closing | Phase::Unmounted => {
                    Vec::new()
                }
            },
            Input::Teardown => {
                let effects = match self.phase {
                    Phase::Open => vec![
                        Effect::StopHeartbeat,
                        Effect::CloseTransport,
                        Effect::RecoverStream,
                    ],
                    Phase::Closing => vec![Effect::CloseTransport, Effect::RecoverStream],
                    Phase::Connecting => vec![Effect::AbortDial, Effect::RecoverStream],
                    Phase::Idle {
                        reconnect_in: Some(_),
                    } => vec![Effect::CancelReconnect],
                    Phase::Idle { reconnect_in: None } | Phase::Unmounted => Vec::new(),
                };
                self.phase = Phase::Unmounted;
                effects
            }
        }
    }

    fn connect(&mut self, has_token: bool) -> Vec<Effect> {
        match self.phase {
            Phase::Idle { reconnect_in } if has_token => {
                self.phase = Phase::Connecting;
                self.auth_rejected = false;
                let mut effects = Vec::with_capacity(2);
                if reconnect_in.is_some() {
                    effects.push(Effect::CancelReconnect);
                }
                effects.push(Effect::Dial);
                effects
            }
            _ => Vec::new(),
        }
    }

    fn lost(&mut self, code: Option<u16>) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(3);
        if self.phase == Phase::Open {
            effects.push(Effect::StopHeartbeat);
        }
        effects.push(Effect::RecoverStream);
        if code == Some(AUTH_FAILURE_CLOSE_CODE) {
            self.auth_rejected = true;
            self.phase = Phase::Idle { reconnect_in: None };
            return effects;
        }
        let delay = self.policy.delay(self.attempt);
        self.last_delay = delay;
        self.phase = Phase::Idle {
            reconnect_in: Some(delay),
        };
        effects.push(Effect::ScheduleReconnect(delay));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::default())
    }

    fn open(m: &mut ConnectionMachine) {
        assert_eq!(m.handle(Input::Connect { has_token: true }), vec![Effect::Dial]);
        assert_eq!(m.handle(Input::Opened), vec![Effect::StartHeartbeat]);
        assert_eq!(m.phase(), Phase::Open);
    }

    #[test]
    fn connect_without_token_is_silent() {
        let mut m = machine();
        assert!(m.handle(Input::Connect { has_token: false }).is_empty());
        assert_eq!(m.phase(), Phase::Idle { reconnect_in: None });
    }

    #[test]
    fn sending_needs_an_open_link() {
        let mut m = machine();
        assert!(!m.can_send());
        m.handle(Input::Connect { has_token: true });
        assert_eq!(m.phase(), Phase::Connecting);
        assert!(!m.can_send());
        m.handle(Input::Opened);
        assert!(m.can_send());
    }

    #[test]
    fn connect_is_idempotent_while_connecting_or_open() {
        let mut m = machine();
        m.handle(Input::Connect { has_token: true });
        assert!(m.handle(Input::Connect { has_token: true }).is_empty());
        m.handle(Input::Opened);
        assert!(m.handle(Input::Connect { has_token: true }).is_empty());
    }

    #[test]
    fn close_schedules_backoff_and_attempts_grow_until_open() {
        let mut m = machine();
        open(&mut m);
        let effects = m.handle(Input::Closed { code: Some(1006) });
        assert_eq!(
            effects,
            vec![
                Effect::StopHeartbeat,
                Effect::RecoverStream,
                Effect::ScheduleReconnect(Duration::from_millis(1000)),
            ]
        );

        let mut delays = vec![];
        for _ in 0..4 {
            assert_eq!(m.handle(Input::ReconnectFired { has_token: true }), vec![Effect::Dial]);
            let effects = m.handle(Input::DialFailed);
            let Some(Effect::ScheduleReconnect(delay)) = effects.last().copied() else {
                panic!("expected reconnect, got {effects:?}")
            };
            delays.push(delay.as_millis());
        }
        assert_eq!(delays, vec![2000, 4000, 8000, 15000]);
        assert_eq!(m.attempt(), 4);

        m.handle(Input::ReconnectFired { has_token: true });
        m.handle(Input::Opened);
        assert_eq!(m.attempt(), 0);
        let effects = m.handle(Input::Closed { code: None });
        assert_eq!(
            effects.last(),
            Some(&Effect::ScheduleReconnect(Duration::from_millis(1000)))
        );
    }

    #[test]
    fn scheduling_a_retry_does_not_reset_the_counter() {
        let mut m = machine();
        open(&mut m);
        m.handle(Input::Closed { code: None });
        m.handle(Input::ReconnectFired { has_token: true });
        m.handle(Input::DialFailed);
        assert_eq!(m.attempt(), 1);
        assert_eq!(
            m.banner(),
            ConnectionBanner::Reconnecting {
                attempt: 2,
                delay: Duration::from_millis(2000)
            }
        );
    }

    #[test]
    fn auth_close_code_stops_reconnecting() {
        let mut m = machine();
        open(&mut m);
        let effects = m.handle(Input::Closed {
            code: Some(AUTH_FAILURE_CLOSE_CODE),
        });
        assert_eq!(effects, vec![Effect::StopHeartbeat, Effect::RecoverStream]);
        assert_eq!(m.phase(), Phase::Idle { reconnect_in: None });
        assert_eq!(m.banner(), ConnectionBanner::AuthRejected);
        assert!(m.handle(Input::ReconnectFired { has_token: true }).is_empty());
    }

    #[test]
    fn manual_connect_cancels_pending_retry() {
        let mut m = machine();
        open(&mut m);
        m.handle(Input::Closed { code: None });
        assert_eq!(
            m.handle(Input::Connect { has_token: true }),
            vec![Effect::CancelReconnect, Effect::Dial]
        );
        assert_eq!(m.phase(), Phase::Connecting);
    }

    #[test]
    fn heartbeat_only_pings_when_open() {
        let mut m = machine();
        assert!(m.handle(Input::HeartbeatTick).is_empty());
        open(&mut m);
        assert_eq!(m.handle(Input::HeartbeatTick), vec![Effect::SendPing]);
        m.handle(Input::Closed { code: None });
        assert!(m.handle(Input::HeartbeatTick).is_empty());
    }

    #[test]
    fn disconnect_closes_without_reconnect() {
        let mut m = machine();
        open(&mut m);
        assert_eq!(
            m.handle(Input::Disconnect),
            vec![Effect::StopHeartbeat, Effect::CloseTransport]
        );
        assert_eq!(m.phase(), Phase::Closing);
        assert!(!m.can_send());
        assert_eq!(m.handle(Input::Closed { code: Some(1000) }), vec![Effect::RecoverStream]);
        assert_eq!(m.phase(), Phase::Idle { reconnect_in: None });
    }

    #[test]
    fn teardown_is_terminal() {
        let mut m = machine();
        open(&mut m);
        m.handle(Input::Closed { code: None });
        assert_eq!(m.handle(Input::Teardown), vec![Effect::CancelReconnect]);
        assert_eq!(m.phase(), Phase::Unmounted);
        for input in [
            Input::Connect { has_token: true },
            Input::ReconnectFired { has_token: true },
            Input::Closed { code: None },
            Input::Opened,
            Input::Teardown,
        ] {
            assert!(m.handle(input).is_empty(), "{input:?}");
        }
    }

    #[test]
    fn teardown_while_open_stops_everything() {
        let mut m = machine();
        open(&mut m);
        assert_eq!(
            m.handle(Input::Teardown),
            vec![
                Effect::StopHeartbeat,
                Effect::CloseTransport,
                Effect::RecoverStream
            ]
        );
    }

    #[test]
    fn fired_retry_without_token_goes_quiet() {
        let mut m = machine();
        open(&mut m);
        m.handle(Input::Closed { code: None });
        assert!(m.handle(Input::ReconnectFired { has_token: false }).is_empty());
        assert_eq!(m.phase(), Phase::Idle { reconnect_in: None });
        assert_eq!(m.attempt(), 1);
    }
}
