//! Network time synchronization logic.
//!
//! Offsets are stored UTC+ throughout; [`posix_tz`] is the one place where
//! the inverted POSIX sign appears.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{config::ClockConfig, error::SyncError, types::TimezoneOffset};

/// POSIX `TZ` string for an offset. POSIX counts west as positive, so
/// UTC+05:30 becomes `UTC-05:30`.
pub fn posix_tz(offset: TimezoneOffset) -> String {
    let sign = if offset.total_seconds() > 0 { '-' } else { '+' };
    format!("UTC{sign}{:02}:{:02}", offset.hours.abs(), offset.minutes)
}

/// Platform time service driven by [`sync_now`].
pub trait TimeServer {
    fn apply_timezone(&mut self, posix_tz: &str) -> Result<(), SyncError>;
    fn start(&mut self, servers: &[String]) -> Result<(), SyncError>;
    /// Whether the service reports a completed exchange.
    fn sync_completed(&mut self) -> bool;
    /// Year of the wall clock in local time.
    fn current_year(&mut self) -> i32;
    fn wait(&mut self, ms: u64);
}

/// Runs one blocking sync. Returns the number of polls it took.
pub fn sync_now<S: TimeServer + ?Sized>(
    server: &mut S,
    offset: TimezoneOffset,
    config: &ClockConfig,
) -> Result<u32, SyncError> {
    server.apply_timezone(&posix_tz(offset))?;
    server.start(&config.ntp_servers)?;

    let attempts = config.sync_retry_count.max(1);
    for attempt in 1..=attempts {
        if server.sync_completed() && server.current_year() >= config.min_plausible_year {
            return Ok(attempt);
        }
        if attempt < attempts {
            server.wait(config.sync_retry_interval_ms);
        }
    }
    Err(SyncError::Exhausted { attempts })
}

/// Decides when syncs run: immediately on IP, hourly after, and on request.
#[derive(Debug, Clone, Default)]
pub struct SyncScheduler {
    periodic_started: bool,
    synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    pub run_now: bool,
    pub start_periodic: bool,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn periodic_started(&self) -> bool {
        self.periodic_started
    }

    /// The periodic task is started once and never stopped.
    pub fn on_ip_acquired(&mut self) -> SyncPlan {
        let start_periodic = !self.periodic_started;
        self.periodic_started = true;
        SyncPlan {
            run_now: true,
            start_periodic,
        }
    }

    pub fn periodic_tick(&self, station_connected: bool) -> bool {
        self.periodic_started && station_connected
    }

    pub fn request_manual(&self, station_connected: bool) -> Result<(), SyncError> {
        if station_connected {
            Ok(())
        } else {
            Err(SyncError::Unavailable)
        }
    }

    pub fn record(&mut self, outcome: &Result<u32, SyncError>) {
        if outcome.is_ok() {
            self.synced = true;
        }
    }
}

/// Allows at most one sync in flight; extra requests are coalesced.
#[derive(Debug, Clone, Default)]
pub struct SyncGuard {
    running: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct SyncPermit {
    running: Arc<AtomicBool>,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn try_begin(&self) -> Result<SyncPermit, SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::InProgress)?;
        Ok(SyncPermit {
            running: Arc::clone(&self.running),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::arbiter::{ArbiterAction, ConnectivityArbiter, TransportEvent};

    struct FakeServer {
        tz: Option<String>,
        servers: Vec<String>,
        plausible_after: u32,
        polls: u32,
        waited_ms: u64,
    }

    impl FakeServer {
        fn new(plausible_after: u32) -> Self {
            Self {
                tz: None,
                servers: Vec::new(),
                plausible_after,
                polls: 0,
                waited_ms: 0,
            }
        }
    }

    impl TimeServer for FakeServer {
        fn apply_timezone(&mut self, posix_tz: &str) -> Result<(), SyncError> {
            self.tz = Some(posix_tz.to_string());
            Ok(())
        }

        fn start(&mut self, servers: &[String]) -> Result<(), SyncError> {
            self.servers = servers.to_vec();
            Ok(())
        }

        fn sync_completed(&mut self) -> bool {
            self.polls += 1;
            self.polls >= self.plausible_after
        }

        fn current_year(&mut self) -> i32 {
            if self.polls >= self.plausible_after {
                2026
            } else {
                1970
            }
        }

        fn wait(&mut self, ms: u64) {
            self.waited_ms += ms;
        }
    }

    #[test]
    fn posix_sign_is_inverted() {
        let tz = |h, m| posix_tz(TimezoneOffset::new(h, m).unwrap());
        assert_eq!(tz(5, 30), "UTC-05:30");
        assert_eq!(tz(-3, 30), "UTC+03:30");
        assert_eq!(tz(0, 0), "UTC+00:00");
        assert_eq!(tz(14, 0), "UTC-14:00");
    }

    #[test]
    fn sync_polls_until_plausible() {
        let config = ClockConfig::default();
        let mut server = FakeServer::new(3);
        let offset = TimezoneOffset::new(1, 0).unwrap();

        assert_eq!(sync_now(&mut server, offset, &config), Ok(3));
        assert_eq!(server.tz.as_deref(), Some("UTC-01:00"));
        assert_eq!(server.servers, config.ntp_servers.to_vec());
        assert_eq!(server.waited_ms, 2 * config.sync_retry_interval_ms);
    }

    #[test]
    fn sync_gives_up_after_retry_budget() {
        let config = ClockConfig::default();
        let mut server = FakeServer::new(u32::MAX);

        let result = sync_now(&mut server, TimezoneOffset::default(), &config);
        assert_eq!(result, Err(SyncError::Exhausted { attempts: 15 }));
        assert_eq!(server.polls, 15);
        assert_eq!(server.waited_ms, 14 * 2_000);
    }

    #[test]
    fn manual_sync_needs_station() {
        let scheduler = SyncScheduler::new();
        assert_eq!(scheduler.request_manual(false), Err(SyncError::Unavailable));
        assert_eq!(scheduler.request_manual(true), Ok(()));
    }

    #[test]
    fn guard_coalesces_overlapping_syncs() {
        let guard = SyncGuard::new();
        let permit = guard.try_begin().unwrap();
        assert_eq!(guard.clone().try_begin().unwrap_err(), SyncError::InProgress);
        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_begin().is_ok());
    }

    #[test]
    fn no_credentials_means_no_sync() {
        let mut arbiter = ConnectivityArbiter::new(false);
        let scheduler = SyncScheduler::new();
        arbiter.handle(TransportEvent::Boot);

        assert_eq!(
            scheduler.request_manual(arbiter.connectivity().station_connected),
            Err(SyncError::Unavailable)
        );
        assert!(!scheduler.periodic_tick(arbiter.connectivity().station_connected));
    }

    #[test]
    fn periodic_sync_follows_station_connectivity() {
        let mut arbiter = ConnectivityArbiter::new(true);
        let mut scheduler = SyncScheduler::new();
        let mut runs = 0;
        let mut periodic_tasks = 0;

        arbiter.handle(TransportEvent::Boot);
        arbiter.handle(TransportEvent::ReconnectTimerFired);
        arbiter.handle(TransportEvent::StationConnected);
        let actions = arbiter.handle(TransportEvent::IpAcquired);
        assert_eq!(actions, vec![ArbiterAction::StartTimeSync]);

        let plan = scheduler.on_ip_acquired();
        runs += u32::from(plan.run_now);
        periodic_tasks += u32::from(plan.start_periodic);
        assert_eq!(runs, 1);

        for _hour in 0..2 {
            runs += u32::from(scheduler.periodic_tick(arbiter.connectivity().station_connected));
        }
        assert_eq!(runs, 3);

        arbiter.handle(TransportEvent::StationDisconnected);
        for _hour in 0..3 {
            runs += u32::from(scheduler.periodic_tick(arbiter.connectivity().station_connected));
        }
        assert_eq!(runs, 3);

        arbiter.handle(TransportEvent::ReconnectTimerFired);
        arbiter.handle(TransportEvent::StationConnected);
        arbiter.handle(TransportEvent::IpAcquired);
        let plan = scheduler.on_ip_acquired();
        runs += u32::from(plan.run_now);
        periodic_tasks += u32::from(plan.start_periodic);

        assert_eq!(runs, 4);
        assert_eq!(periodic_tasks, 1);
    }
}
