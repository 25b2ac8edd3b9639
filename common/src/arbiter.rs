//! Access point / station arbitration.
//!
//! The access point is always up. The station role is added only while no
//! configuration client is attached and credentials are stored; an attaching
//! client tears the station down at once. Reconnects go through a single
//! delay timer so a client that shows up during the delay wins.

use std::fmt;

use serde::Serialize;

use crate::{config::AccessPointConfig, timer::TimerSlot, types::StationCredentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArbiterState {
    ApOnly,
    ReconnectPending,
    StaConnecting,
    StaConnected,
}

impl ArbiterState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApOnly => "ap_only",
            Self::ReconnectPending => "reconnect_pending",
            Self::StaConnecting => "sta_connecting",
            Self::StaConnected => "sta_connected",
        }
    }
}

impl fmt::Display for ArbiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub station_connected: bool,
    pub ap_client_count: u32,
    pub reconnect_timer_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Boot,
    ReconnectTimerFired,
    StationConnected,
    StationDisconnected,
    ApClientAttached,
    ApClientDetached,
    IpAcquired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterAction {
    StartAccessPoint,
    StartStation,
    DisconnectStation,
    ArmReconnectTimer,
    CancelReconnectTimer,
    /// Sync now and keep the periodic resync running.
    StartTimeSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterSnapshot {
    pub state: ArbiterState,
    pub connectivity: ConnectivityState,
}

impl Default for ArbiterSnapshot {
    fn default() -> Self {
        Self {
            state: ArbiterState::ApOnly,
            connectivity: ConnectivityState::default(),
        }
    }
}

/// Radio roles as the arbiter sees them.
pub trait NetworkTransport {
    type Error: fmt::Display;

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;
    fn start_station(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;
    fn disconnect_station(&mut self) -> Result<(), Self::Error>;
}

/// Pure transition function. Side effects are returned in execution order.
pub fn transition(
    current: ArbiterSnapshot,
    event: TransportEvent,
    has_credentials: bool,
) -> (ArbiterSnapshot, Vec<ArbiterAction>) {
    let mut state = current.state;
    let mut conn = current.connectivity;
    let mut actions = Vec::new();

    match event {
        TransportEvent::Boot => {
            conn = ConnectivityState::default();
            actions.push(ArbiterAction::StartAccessPoint);
            state = ArbiterState::ApOnly;
            if has_credentials {
                arm_reconnect(&mut conn, &mut actions);
                state = ArbiterState::ReconnectPending;
            }
        }
        TransportEvent::ReconnectTimerFired => {
            conn.reconnect_timer_active = false;
            if conn.ap_client_count > 0 || !has_credentials {
                state = ArbiterState::ApOnly;
            } else if !conn.station_connected {
                actions.push(ArbiterAction::StartStation);
                state = ArbiterState::StaConnecting;
            }
        }
        TransportEvent::StationConnected => {
            if conn.ap_client_count > 0 {
                // Raced with an attach; the attach wins.
                actions.push(ArbiterAction::DisconnectStation);
                conn.station_connected = false;
                state = ArbiterState::ApOnly;
            } else {
                conn.station_connected = true;
                state = ArbiterState::StaConnected;
            }
        }
        TransportEvent::StationDisconnected => {
            conn.station_connected = false;
            if conn.ap_client_count == 0 && has_credentials {
                arm_reconnect(&mut conn, &mut actions);
                state = ArbiterState::ReconnectPending;
            } else {
                state = ArbiterState::ApOnly;
            }
        }
        TransportEvent::ApClientAttached => {
            conn.ap_client_count = conn.ap_client_count.saturating_add(1);
            if conn.reconnect_timer_active {
                actions.push(ArbiterAction::CancelReconnectTimer);
                conn.reconnect_timer_active = false;
            }
            if conn.station_connected
                || matches!(
                    state,
                    ArbiterState::StaConnecting | ArbiterState::StaConnected
                )
            {
                actions.push(ArbiterAction::DisconnectStation);
                conn.station_connected = false;
            }
            state = ArbiterState::ApOnly;
        }
        TransportEvent::ApClientDetached => {
            conn.ap_client_count = conn.ap_client_count.saturating_sub(1);
            if conn.ap_client_count == 0
                && has_credentials
                && !conn.reconnect_timer_active
                && !conn.station_connected
            {
                arm_reconnect(&mut conn, &mut actions);
                state = ArbiterState::ReconnectPending;
            }
        }
        TransportEvent::IpAcquired => {
            if matches!(
                state,
                ArbiterState::StaConnecting | ArbiterState::StaConnected
            ) {
                conn.station_connected = true;
                state = ArbiterState::StaConnected;
                actions.push(ArbiterAction::StartTimeSync);
            }
        }
    }

    (
        ArbiterSnapshot {
            state,
            connectivity: conn,
        },
        actions,
    )
}

fn arm_reconnect(conn: &mut ConnectivityState, actions: &mut Vec<ArbiterAction>) {
    conn.reconnect_timer_active = true;
    actions.push(ArbiterAction::ArmReconnectTimer);
}

/// Owns the arbiter snapshot. Callers serialize [`ConnectivityArbiter::handle`]
/// through a single event context.
#[derive(Debug, Clone)]
pub struct ConnectivityArbiter {
    snapshot: ArbiterSnapshot,
    has_credentials: bool,
}

impl ConnectivityArbiter {
    pub fn new(has_credentials: bool) -> Self {
        Self {
            snapshot: ArbiterSnapshot::default(),
            has_credentials,
        }
    }

    pub fn state(&self) -> ArbiterState {
        self.snapshot.state
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.snapshot.connectivity
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        self.snapshot
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    pub fn set_has_credentials(&mut self, has_credentials: bool) {
        self.has_credentials = has_credentials;
    }

    pub fn handle(&mut self, event: TransportEvent) -> Vec<ArbiterAction> {
        let (next, actions) = transition(self.snapshot, event, self.has_credentials);
        self.snapshot = next;
        actions
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub sync_requested: bool,
    pub failures: Vec<(ArbiterAction, String)>,
}

/// Everything [`dispatch`] needs to carry out radio actions.
pub struct DispatchContext<'a> {
    pub access_point: &'a AccessPointConfig,
    pub credentials: &'a StationCredentials,
    pub reconnect_delay_ms: u64,
}

/// Applies radio and timer actions. Sync requests are handed back to the caller.
pub fn dispatch<T, S>(
    actions: &[ArbiterAction],
    transport: &mut T,
    timer: &mut S,
    ctx: &DispatchContext<'_>,
) -> DispatchOutcome
where
    T: NetworkTransport + ?Sized,
    S: TimerSlot + ?Sized,
{
    let mut outcome = DispatchOutcome::default();
    for action in actions {
        let result = match action {
            ArbiterAction::StartAccessPoint => transport
                .start_access_point(&ctx.access_point.ssid, &ctx.access_point.password),
            ArbiterAction::StartStation => transport
                .start_station(&ctx.credentials.ssid, ctx.credentials.effective_password()),
            ArbiterAction::DisconnectStation => transport.disconnect_station(),
            ArbiterAction::ArmReconnectTimer => {
                timer.arm(ctx.reconnect_delay_ms);
                Ok(())
            }
            ArbiterAction::CancelReconnectTimer => {
                timer.cancel();
                Ok(())
            }
            ArbiterAction::StartTimeSync => {
                outcome.sync_requested = true;
                Ok(())
            }
        };
        if let Err(err) = result {
            outcome.failures.push((*action, err.to_string()));
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::timer::DeadlineTimer;

    #[derive(Default)]
    struct RecordingRadio {
        calls: Vec<String>,
        fail_station: bool,
    }

    impl NetworkTransport for RecordingRadio {
        type Error = String;

        fn start_access_point(&mut self, ssid: &str, _password: &str) -> Result<(), String> {
            self.calls.push(format!("ap:{ssid}"));
            Ok(())
        }

        fn start_station(&mut self, ssid: &str, password: &str) -> Result<(), String> {
            if self.fail_station {
                return Err("radio busy".to_string());
            }
            self.calls.push(format!("sta:{ssid}:{password}"));
            Ok(())
        }

        fn disconnect_station(&mut self) -> Result<(), String> {
            self.calls.push("sta_off".to_string());
            Ok(())
        }
    }

    struct Rig {
        arbiter: ConnectivityArbiter,
        radio: RecordingRadio,
        timer: DeadlineTimer,
        ap: AccessPointConfig,
        creds: StationCredentials,
        now_ms: u64,
        syncs: u32,
    }

    impl Rig {
        fn new(with_credentials: bool) -> Self {
            let creds = if with_credentials {
                StationCredentials::new("Home", "0123456789", "ESP32_Clock").unwrap()
            } else {
                StationCredentials::default()
            };
            Self {
                arbiter: ConnectivityArbiter::new(creds.is_present()),
                radio: RecordingRadio::default(),
                timer: DeadlineTimer::new(),
                ap: AccessPointConfig::default(),
                creds,
                now_ms: 0,
                syncs: 0,
            }
        }

        fn send(&mut self, event: TransportEvent) -> Vec<ArbiterAction> {
            let actions = self.arbiter.handle(event);
            let ctx = DispatchContext {
                access_point: &self.ap,
                credentials: &self.creds,
                reconnect_delay_ms: 10_000,
            };
            let outcome = dispatch(&actions, &mut self.radio, &mut self.timer, &ctx);
            if outcome.sync_requested {
                self.syncs += 1;
            }
            actions
        }

        fn advance(&mut self, ms: u64) {
            let target = self.now_ms + ms;
            while self.now_ms < target {
                self.now_ms += 100;
                if self.timer.fire_if_due(self.now_ms) {
                    self.send(TransportEvent::ReconnectTimerFired);
                }
            }
        }

        fn station_attempts(&self) -> usize {
            self.radio.calls.iter().filter(|c| c.starts_with("sta:")).count()
        }
    }

    #[test]
    fn boot_without_credentials_stays_ap_only() {
        let mut rig = Rig::new(false);
        assert_eq!(rig.send(TransportEvent::Boot), vec![ArbiterAction::StartAccessPoint]);
        rig.advance(120_000);
        rig.send(TransportEvent::ApClientAttached);
        rig.send(TransportEvent::ApClientDetached);
        rig.advance(120_000);

        assert_eq!(rig.arbiter.state(), ArbiterState::ApOnly);
        assert_eq!(rig.radio.calls, vec!["ap:ESP32_Clock".to_string()]);
    }

    #[test]
    fn boot_with_credentials_connects_after_delay() {
        let mut rig = Rig::new(true);
        rig.send(TransportEvent::Boot);
        assert_eq!(rig.arbiter.state(), ArbiterState::ReconnectPending);

        rig.advance(9_900);
        assert_eq!(rig.station_attempts(), 0);
        rig.advance(100);
        assert_eq!(rig.arbiter.state(), ArbiterState::StaConnecting);
        assert_eq!(rig.radio.calls.last().unwrap(), "sta:Home:0123456789");

        rig.send(TransportEvent::StationConnected);
        rig.send(TransportEvent::IpAcquired);
        assert_eq!(rig.arbiter.state(), ArbiterState::StaConnected);
        assert_eq!(rig.syncs, 1);
    }

    #[test]
    fn attach_during_delay_cancels_reconnect() {
        let mut rig = Rig::new(true);
        rig.send(TransportEvent::Boot);
        rig.advance(5_000);

        let actions = rig.send(TransportEvent::ApClientAttached);
        assert_eq!(actions, vec![ArbiterAction::CancelReconnectTimer]);
        assert!(!rig.timer.is_armed());

        rig.advance(60_000);
        assert_eq!(rig.station_attempts(), 0);
        assert_eq!(rig.arbiter.state(), ArbiterState::ApOnly);

        let actions = rig.send(TransportEvent::ApClientDetached);
        assert_eq!(actions, vec![ArbiterAction::ArmReconnectTimer]);
        rig.advance(10_000);
        assert_eq!(rig.station_attempts(), 1);
    }

    #[test]
    fn attach_tears_down_connected_station() {
        let mut rig = Rig::new(true);
        rig.send(TransportEvent::Boot);
        rig.advance(10_000);
        rig.send(TransportEvent::StationConnected);
        rig.send(TransportEvent::IpAcquired);

        let actions = rig.send(TransportEvent::ApClientAttached);
        assert_eq!(actions, vec![ArbiterAction::DisconnectStation]);
        assert_eq!(rig.arbiter.state(), ArbiterState::ApOnly);
        assert!(!rig.arbiter.connectivity().station_connected);

        // The radio confirms the teardown; a client is still attached.
        assert!(rig.send(TransportEvent::StationDisconnected).is_empty());
        assert_eq!(rig.arbiter.state(), ArbiterState::ApOnly);
    }

    #[test]
    fn no_station_attempt_while_clients_attached() {
        let mut rig = Rig::new(true);
        rig.send(TransportEvent::Boot);

        for _ in 0..3 {
            rig.send(TransportEvent::ApClientAttached);
            rig.send(TransportEvent::ApClientAttached);
            rig.advance(15_000);
            rig.send(TransportEvent::ApClientDetached);
            rig.advance(15_000);
            assert_eq!(rig.station_attempts(), 0);
            rig.send(TransportEvent::ApClientDetached);
            assert_eq!(rig.arbiter.connectivity().ap_client_count, 0);
            assert!(rig.timer.is_armed());
            rig.send(TransportEvent::ApClientAttached);
            assert!(!rig.timer.is_armed());
            rig.send(TransportEvent::ApClientDetached);
        }
        assert_eq!(rig.station_attempts(), 0);

        rig.advance(10_000);
        assert_eq!(rig.station_attempts(), 1);
    }

    #[test]
    fn station_loss_schedules_retry() {
        let mut rig = Rig::new(true);
        rig.send(TransportEvent::Boot);
        rig.advance(10_000);
        rig.send(TransportEvent::StationConnected);

        let actions = rig.send(TransportEvent::StationDisconnected);
        assert_eq!(actions, vec![ArbiterAction::ArmReconnectTimer]);
        assert_eq!(rig.arbiter.state(), ArbiterState::ReconnectPending);

        // A failed attempt reports another disconnect; the timer restarts.
        rig.advance(10_000);
        assert_eq!(rig.station_attempts(), 2);
        rig.send(TransportEvent::StationDisconnected);
        rig.advance(10_000);
        assert_eq!(rig.station_attempts(), 3);
    }

    #[test]
    fn detach_below_zero_is_clamped() {
        let (next, actions) = transition(
            ArbiterSnapshot::default(),
            TransportEvent::ApClientDetached,
            false,
        );
        assert_eq!(next.connectivity.ap_client_count, 0);
        assert!(actions.is_empty());
    }

    #[test]
    fn ip_without_station_is_ignored() {
        let (next, actions) = transition(ArbiterSnapshot::default(), TransportEvent::IpAcquired, true);
        assert_eq!(next.state, ArbiterState::ApOnly);
        assert!(actions.is_empty());
    }

    #[test]
    fn dispatch_reports_radio_failures() {
        let mut radio = RecordingRadio {
            fail_station: true,
            ..RecordingRadio::default()
        };
        let mut timer = DeadlineTimer::new();
        let ap = AccessPointConfig::default();
        let creds = StationCredentials::new("Home", "short", "ESP32_Clock").unwrap();
        let ctx = DispatchContext {
            access_point: &ap,
            credentials: &creds,
            reconnect_delay_ms: 10_000,
        };

        let outcome = dispatch(
            &[ArbiterAction::StartStation, ArbiterAction::StartTimeSync],
            &mut radio,
            &mut timer,
            &ctx,
        );
        assert!(outcome.sync_requested);
        assert_eq!(
            outcome.failures,
            vec![(ArbiterAction::StartStation, "radio busy".to_string())]
        );
    }
}
