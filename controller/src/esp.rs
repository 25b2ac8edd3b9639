use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, Utc};
use embedded_svc::{
    http::{Headers, Method},
    io::Write,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, IOPin, Input, Output, OutputPin, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    netif::IpEvent,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, OperatingMode, SntpConf, SyncMode, SyncStatus},
    timer::{EspTaskTimerService, EspTimer},
    wifi::{EspWifi, WifiEvent},
};
use log::{debug, info, warn};
use serde::Serialize;

use alarmclock_common::{
    apply_actions, dispatch, retarget_wall_clock, sync_now, AccessPointConfig, ArbiterSnapshot,
    ClockAction, ClockEngine, ClockOutputs, ClockStatus, ClockTime, ConfigError,
    ConnectivityArbiter, DispatchContext, DisplayDriver, NetworkTransport, PersistedSettings,
    PinLevel, RuntimeConfig, StationCredentials, SyncError, SyncGuard, SyncScheduler, TimeServer,
    TimerSlot, TimezoneOffset, TransportEvent, KEY_ALARM_HOUR, KEY_ALARM_MINUTE, KEY_TZ_HOURS,
    KEY_TZ_MINUTES, KEY_WIFI_HAS_PASS, KEY_WIFI_PASS, KEY_WIFI_SSID,
};

use crate::{
    max7219::Max7219Display,
    web::{self, int_param, str_param, u8_param, RequestError, SettingsError, INDEX_HTML},
};

const NVS_NAMESPACE: &str = "alarmclock";
const NVS_STR_BUFFER: usize = 96;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;

#[derive(Clone)]
struct SharedState {
    config: Arc<RuntimeConfig>,
    engine: Arc<Mutex<ClockEngine>>,
    panel: Arc<Mutex<EspPanel>>,
    settings: Arc<Mutex<PersistedSettings>>,
    network_view: Arc<Mutex<ArbiterSnapshot>>,
    scheduler: Arc<Mutex<SyncScheduler>>,
    sync_guard: SyncGuard,
    sntp: Arc<Mutex<Option<EspSntp<'static>>>>,
    restart_pending: Arc<AtomicBool>,
    store: NvsStore,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
enum NetEvent {
    Transport(TransportEvent),
    ReconnectTimerFired { generation: u64 },
    PeriodicSyncDue,
}

#[derive(Debug, Serialize)]
struct WifiUpdateResponse {
    restarting: bool,
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    sync: &'static str,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = RuntimeConfig::default();
    runtime.settings = store.load_settings().unwrap_or_else(|err| {
        warn!("failed to load settings from NVS: {err:#}");
        PersistedSettings::default()
    });
    ensure_wifi_defaults(&mut runtime.settings);
    runtime.sanitize();

    info!(
        "settings loaded: ssid=`{}`, alarm={}:{}, tz={}",
        runtime.settings.wifi_ssid,
        runtime.settings.alarm_hour,
        runtime.settings.alarm_minute,
        runtime.settings.timezone().label(),
    );

    let Peripherals {
        modem, spi2, pins, ..
    } = Peripherals::take()?;

    let display = match Max7219Display::new(spi2, pins.gpio18, pins.gpio23, pins.gpio5) {
        Ok(display) => {
            info!("MAX7219 display initialized on SPI2 (CLK 18, MOSI 23, CS 5)");
            display
        }
        Err(err) => {
            warn!("failed to initialize display, running without it: {err:#}");
            Max7219Display::disabled()
        }
    };
    let mut panel = EspPanel {
        display,
        buzzer: PinDriver::output(pins.gpio4.downgrade_output())?,
        seconds_led: PinDriver::output(pins.gpio2.downgrade_output())?,
        pm_led: PinDriver::output(pins.gpio19.downgrade_output())?,
        chime_pulse_ms: runtime.clock.chime_pulse_ms,
    };
    panel.set_buzzer(false);
    panel.render_text("------");

    let mut button = PinDriver::input(pins.gpio0.downgrade())?;
    button.set_pull(Pull::Up)?;

    let state = SharedState {
        engine: Arc::new(Mutex::new(ClockEngine::new(&runtime))),
        panel: Arc::new(Mutex::new(panel)),
        settings: Arc::new(Mutex::new(runtime.settings.clone())),
        network_view: Arc::new(Mutex::new(ArbiterSnapshot::default())),
        scheduler: Arc::new(Mutex::new(SyncScheduler::new())),
        sync_guard: SyncGuard::new(),
        sntp: Arc::new(Mutex::new(None)),
        restart_pending: Arc::new(AtomicBool::new(false)),
        config: Arc::new(runtime),
        store,
    };

    let (network_tx, network_rx) = mpsc::channel();
    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let subscriptions = subscribe_radio_events(&sys_loop, &network_tx)?;
    let timer_service = EspTaskTimerService::new()?;

    spawn_network_loop(
        state.clone(),
        EspRadio::new(wifi, state.config.access_point.clone()),
        timer_service,
        network_tx,
        network_rx,
    )?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    spawn_control_loop(state.clone(), button)?;

    let server = create_http_server(state)?;

    // Keep services alive for the program lifetime.
    let _subscriptions = subscriptions;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(settings: &mut PersistedSettings) {
    if settings.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            settings.wifi_ssid = ssid.to_string();
            settings.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_control_loop(
    state: SharedState,
    button: PinDriver<'static, AnyIOPin, Input>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("clock-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register clock loop with watchdog: {err:#}");
            }

            let poll = Duration::from_millis(state.config.clock.poll_interval_ms);
            loop {
                feed_watchdog();

                let offset = lock(&state.settings).timezone();
                let now = ClockTime::from_datetime(&Utc::now().with_timezone(&offset.fixed()));
                let level = PinLevel::from_high(button.is_high());

                let actions = lock(&state.engine).tick(now, level, monotonic_ms());
                execute_clock_actions(&state, &actions);

                thread::sleep(poll);
            }
        })
        .context("failed to spawn clock loop thread")?;
    Ok(())
}

fn execute_clock_actions(state: &SharedState, actions: &[ClockAction]) {
    if actions.is_empty() {
        return;
    }
    let mut panel = lock(&state.panel);
    apply_actions(&mut *panel, actions);
}

fn subscribe_radio_events(
    sys_loop: &EspSystemEventLoop,
    events: &mpsc::Sender<NetEvent>,
) -> anyhow::Result<Vec<EspSubscription<'static, System>>> {
    let wifi_events = events.clone();
    let wifi = sys_loop.subscribe::<WifiEvent, _>(move |event| {
        let mapped = match event {
            WifiEvent::StaConnected(_) => TransportEvent::StationConnected,
            WifiEvent::StaDisconnected(_) => TransportEvent::StationDisconnected,
            WifiEvent::ApStaConnected(_) => TransportEvent::ApClientAttached,
            WifiEvent::ApStaDisconnected(_) => TransportEvent::ApClientDetached,
            _ => return,
        };
        let _ = wifi_events.send(NetEvent::Transport(mapped));
    })?;

    let ip_events = events.clone();
    let ip = sys_loop.subscribe::<IpEvent, _>(move |event| {
        if let IpEvent::DhcpIpAssigned(_) = event {
            let _ = ip_events.send(NetEvent::Transport(TransportEvent::IpAcquired));
        }
    })?;

    Ok(vec![wifi, ip])
}

fn spawn_network_loop(
    state: SharedState,
    radio: EspRadio,
    timer_service: EspTaskTimerService,
    events_tx: mpsc::Sender<NetEvent>,
    events: mpsc::Receiver<NetEvent>,
) -> anyhow::Result<()> {
    let credentials = lock(&state.settings).credentials();
    let mut link = NetworkLink {
        arbiter: ConnectivityArbiter::new(credentials.is_present()),
        radio,
        timer: EspReconnectTimer::new(timer_service.clone(), events_tx.clone()),
        periodic_sync: None,
        timer_service,
        events: events_tx,
        credentials,
    };

    thread::Builder::new()
        .name("network".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            link.apply(&state, TransportEvent::Boot);

            while let Ok(event) = events.recv() {
                match event {
                    NetEvent::Transport(event) => link.apply(&state, event),
                    NetEvent::ReconnectTimerFired { generation } => {
                        if link.timer.expire(generation) {
                            link.apply(&state, TransportEvent::ReconnectTimerFired);
                        } else {
                            debug!("ignoring stale reconnect timer #{generation}");
                        }
                    }
                    NetEvent::PeriodicSyncDue => {
                        let connected = link.arbiter.connectivity().station_connected;
                        if !lock(&state.scheduler).periodic_tick(connected) {
                            debug!("periodic time sync skipped, station offline");
                            continue;
                        }
                        if let Err(err) = trigger_sync(&state, "periodic") {
                            info!("periodic time sync not started: {err}");
                        }
                    }
                }
            }
            warn!("network event channel closed");
        })
        .context("failed to spawn network thread")?;
    Ok(())
}

/// Everything owned by the network thread. Only that thread touches it,
/// which keeps arbiter transitions serialized.
struct NetworkLink {
    arbiter: ConnectivityArbiter,
    radio: EspRadio,
    timer: EspReconnectTimer,
    periodic_sync: Option<EspTimer<'static>>,
    timer_service: EspTaskTimerService,
    events: mpsc::Sender<NetEvent>,
    credentials: StationCredentials,
}

impl NetworkLink {
    fn apply(&mut self, state: &SharedState, event: TransportEvent) {
        let before = self.arbiter.state();
        let actions = self.arbiter.handle(event);
        let after = self.arbiter.state();
        if before != after {
            info!("connectivity {before} -> {after} on {event:?}");
        } else {
            debug!("connectivity event {event:?} in {after}");
        }

        let ctx = DispatchContext {
            access_point: &state.config.access_point,
            credentials: &self.credentials,
            reconnect_delay_ms: state.config.clock.reconnect_delay_ms,
        };
        let outcome = dispatch(&actions, &mut self.radio, &mut self.timer, &ctx);
        for (action, err) in &outcome.failures {
            warn!("radio action {action:?} failed: {err}");
        }

        *lock(&state.network_view) = self.arbiter.snapshot();

        if outcome.sync_requested {
            self.on_station_online(state);
        }
    }

    fn on_station_online(&mut self, state: &SharedState) {
        let plan = lock(&state.scheduler).on_ip_acquired();
        if plan.start_periodic {
            self.start_periodic_sync(state.config.clock.sync_interval_ms);
        }
        if plan.run_now {
            if let Err(err) = trigger_sync(state, "ip acquired") {
                info!("time sync not started: {err}");
            }
        }
    }

    fn start_periodic_sync(&mut self, interval_ms: u64) {
        let events = self.events.clone();
        let period = Duration::from_millis(interval_ms.max(1));
        let started = self
            .timer_service
            .timer(move || {
                let _ = events.send(NetEvent::PeriodicSyncDue);
            })
            .and_then(|timer| {
                timer.every(period)?;
                Ok(timer)
            });

        match started {
            Ok(timer) => {
                info!("periodic time sync every {}s", period.as_secs());
                self.periodic_sync = Some(timer);
            }
            Err(err) => warn!("failed to start periodic time sync: {err}"),
        }
    }
}

fn trigger_sync(state: &SharedState, reason: &'static str) -> Result<(), SyncError> {
    let permit = state.sync_guard.try_begin()?;
    let offset = lock(&state.settings).timezone();
    let config = state.config.clock.clone();
    let sntp = state.sntp.clone();
    let scheduler = state.scheduler.clone();

    info!("starting time sync ({reason})");
    thread::Builder::new()
        .name("time-sync".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            let _permit = permit;
            let mut server = EspTimeServer { sntp, offset };
            let outcome = sync_now(&mut server, offset, &config);
            match &outcome {
                Ok(attempts) => info!("time synchronized after {attempts} polls"),
                Err(err) => warn!("time sync failed: {err}"),
            }
            lock(&scheduler).record(&outcome);
        })
        .map_err(|err| SyncError::Server(err.to_string()))?;
    Ok(())
}

fn schedule_restart(state: &SharedState) {
    if state.restart_pending.swap(true, Ordering::SeqCst) {
        return;
    }

    let delay = Duration::from_millis(state.config.clock.restart_delay_ms);
    let spawned = thread::Builder::new()
        .name("restart".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            thread::sleep(delay);
            warn!("restarting to apply new station credentials");
            unsafe { esp_idf_svc::sys::esp_restart() };
        });

    if let Err(err) = spawned {
        warn!("failed to schedule restart, credentials apply on next boot: {err}");
        state.restart_pending.store(false, Ordering::SeqCst);
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Post, move |req| {
            let parsed = request_params(&req).and_then(|params| {
                Ok((
                    u8_param(&params, "hour")?,
                    u8_param(&params, "minute")?,
                    u8_param(&params, "second")?,
                ))
            });
            let (hour, minute, second) = match parsed {
                Ok(fields) => fields,
                Err(err) => return request_error(req, &err),
            };
            let time = match ClockTime::new(hour, minute, second) {
                Ok(time) => time,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };

            let offset = lock(&state.settings).timezone();
            let Some(target) = retarget_wall_clock(Utc::now(), offset, time) else {
                return write_error(req, 400, "Time does not exist today");
            };
            if let Err(err) = set_system_time(target) {
                warn!("failed to set system time: {err:#}");
                return write_error(req, 500, "Failed to set time");
            }
            info!("wall clock set manually to {hour:02}:{minute:02}:{second:02}");

            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/alarm", Method::Post, move |req| {
            let parsed = request_params(&req)
                .and_then(|params| Ok((int_param(&params, "hour")?, int_param(&params, "minute")?)));
            let (hour, minute) = match parsed {
                Ok(fields) => fields,
                Err(err) => return request_error(req, &err),
            };

            let updated = update_settings(&state, |settings| settings.set_alarm(hour, minute));
            if let Err(err) = updated {
                return settings_error(req, "alarm", &err);
            }

            let result = lock(&state.engine).set_alarm(hour, minute);
            let actions = match result {
                Ok(actions) => actions,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            execute_clock_actions(&state, &actions);
            info!("alarm set to {hour}:{minute}");

            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/timezone", Method::Post, move |req| {
            let parsed = request_params(&req)
                .and_then(|params| Ok((int_param(&params, "hours")?, int_param(&params, "minutes")?)));
            let (hours, minutes) = match parsed {
                Ok(fields) => fields,
                Err(err) => return request_error(req, &err),
            };

            match update_settings(&state, |settings| settings.set_timezone(hours, minutes)) {
                Err(err) => return settings_error(req, "timezone", &err),
                Ok(false) => {}
                Ok(true) => info!("timezone set to {hours}:{minutes:02}"),
            }

            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/wifi", Method::Post, move |req| {
            let parsed = request_params(&req).and_then(|params| {
                let ssid = str_param(&params, "ssid")?.to_string();
                let password = params.get("password").cloned().unwrap_or_default();
                Ok((ssid, password))
            });
            let (ssid, password) = match parsed {
                Ok(fields) => fields,
                Err(err) => return request_error(req, &err),
            };

            let own_ap_ssid = &state.config.access_point.ssid;
            let result = update_settings(&state, |settings| {
                let changed = settings.set_station_credentials(&ssid, &password, own_ap_ssid)?;
                Ok((changed, settings.credentials()))
            });
            let (changed, credentials) = match result {
                Ok(updated) => updated,
                Err(err) => return settings_error(req, "wifi credentials", &err),
            };

            let response = WifiUpdateResponse {
                restarting: changed,
                wifi_ssid: credentials.ssid,
                wifi_pass_set: credentials.has_password,
            };
            write_json(req, &response)?;

            if changed {
                schedule_restart(&state);
            }
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/dismiss", Method::Post, move |req| {
            let actions = lock(&state.engine).dismiss_alarm();
            if !actions.is_empty() {
                info!("alarm dismissed from web");
            }
            execute_clock_actions(&state, &actions);

            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/sync", Method::Post, move |req| {
            let connected = lock(&state.network_view).connectivity.station_connected;
            if let Err(err) = lock(&state.scheduler).request_manual(connected) {
                return write_error(req, 409, &err.to_string());
            }

            let sync = match trigger_sync(&state, "manual") {
                Ok(()) => "started",
                Err(_) => "already_running",
            };
            write_json(req, &SyncResponse { sync })
        })?;
    }

    Ok(server)
}

fn build_status(state: &SharedState) -> ClockStatus {
    let settings = lock(&state.settings).clone();
    let now = ClockTime::from_datetime(&Utc::now().with_timezone(&settings.timezone().fixed()));
    let alarm = lock(&state.engine).alarm_view();
    let network = *lock(&state.network_view);
    let time_synced = lock(&state.scheduler).is_synced();

    ClockStatus::new(now, alarm, &settings, network, time_synced)
}

/// Edits a copy of the settings and commits it only once NVS holds it.
fn update_settings<T>(
    state: &SharedState,
    edit: impl FnOnce(&mut PersistedSettings) -> Result<T, ConfigError>,
) -> Result<T, SettingsError> {
    let mut settings = lock(&state.settings);
    let mut staged = settings.clone();
    let value = edit(&mut staged)?;
    if staged != *settings {
        state
            .store
            .save_settings(&staged)
            .map_err(SettingsError::Persist)?;
        *settings = staged;
    }
    Ok(value)
}

fn settings_error(
    req: Request<&mut EspHttpConnection<'_>>,
    what: &str,
    err: &SettingsError,
) -> anyhow::Result<()> {
    match err {
        SettingsError::Rejected(reason) => warn!("rejected {what} update: {reason}"),
        SettingsError::Persist(reason) => warn!("failed to persist {what} update: {reason:#}"),
    }
    write_error(req, err.status(), &err.to_string())
}

fn request_params(
    req: &Request<&mut EspHttpConnection<'_>>,
) -> Result<web::Params, RequestError> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > web::MAX_REQUEST_BYTES {
        return Err(RequestError::TooLarge { len });
    }
    web::parse_query(web::query_of(req.uri()))
}

fn request_error(
    req: Request<&mut EspHttpConnection<'_>>,
    err: &RequestError,
) -> anyhow::Result<()> {
    write_error(req, err.status(), &err.to_string())
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn set_system_time(target: DateTime<Utc>) -> anyhow::Result<()> {
    let tv = esp_idf_svc::sys::timeval {
        tv_sec: target.timestamp() as _,
        tv_usec: 0,
    };
    let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
    if rc == 0 {
        return Ok(());
    }
    Err(anyhow!("settimeofday failed with code {}", rc))
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn load_settings(&self) -> anyhow::Result<PersistedSettings> {
        let _guard = lock(&self.lock);
        let nvs = self.open()?;
        let defaults = PersistedSettings::default();
        let mut buffer = [0_u8; NVS_STR_BUFFER];

        let wifi_ssid = nvs
            .get_str(KEY_WIFI_SSID, &mut buffer)?
            .map(str::to_string)
            .unwrap_or_default();
        let wifi_pass = nvs
            .get_str(KEY_WIFI_PASS, &mut buffer)?
            .map(str::to_string)
            .unwrap_or_default();

        Ok(PersistedSettings {
            wifi_ssid,
            wifi_pass,
            wifi_has_pass: nvs.get_u8(KEY_WIFI_HAS_PASS)?.is_some_and(|flag| flag != 0),
            alarm_hour: nvs.get_i32(KEY_ALARM_HOUR)?.unwrap_or(defaults.alarm_hour),
            alarm_minute: nvs
                .get_i32(KEY_ALARM_MINUTE)?
                .unwrap_or(defaults.alarm_minute),
            tz_hours: nvs.get_i32(KEY_TZ_HOURS)?.unwrap_or(defaults.tz_hours),
            tz_minutes: nvs.get_i32(KEY_TZ_MINUTES)?.unwrap_or(defaults.tz_minutes),
        })
    }

    fn save_settings(&self, settings: &PersistedSettings) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = self.open()?;
        nvs.set_str(KEY_WIFI_SSID, &settings.wifi_ssid)?;
        nvs.set_str(KEY_WIFI_PASS, &settings.wifi_pass)?;
        nvs.set_u8(KEY_WIFI_HAS_PASS, u8::from(settings.wifi_has_pass))?;
        nvs.set_i32(KEY_ALARM_HOUR, settings.alarm_hour)?;
        nvs.set_i32(KEY_ALARM_MINUTE, settings.alarm_minute)?;
        nvs.set_i32(KEY_TZ_HOURS, settings.tz_hours)?;
        nvs.set_i32(KEY_TZ_MINUTES, settings.tz_minutes)?;
        Ok(())
    }
}

/// The Wi-Fi driver in AP or AP+STA mode. The access point stays up
/// whatever the station does.
struct EspRadio {
    wifi: EspWifi<'static>,
    access_point: AccessPointConfig,
    ap_configuration: AccessPointConfiguration,
}

impl EspRadio {
    fn new(wifi: EspWifi<'static>, access_point: AccessPointConfig) -> Self {
        Self {
            wifi,
            access_point,
            ap_configuration: AccessPointConfiguration::default(),
        }
    }

    fn ensure_started(&mut self) -> anyhow::Result<()> {
        if !self.wifi.is_started()? {
            self.wifi.start()?;
            disable_wifi_power_save();
        }
        Ok(())
    }
}

impl NetworkTransport for EspRadio {
    type Error = anyhow::Error;

    fn start_access_point(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        self.ap_configuration = AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow!("access point ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("access point password too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: self.access_point.channel,
            max_connections: self.access_point.max_clients,
            ..Default::default()
        };
        self.wifi
            .set_configuration(&Configuration::AccessPoint(self.ap_configuration.clone()))?;
        self.ensure_started()?;
        info!("access point `{ssid}` up on channel {}", self.access_point.channel);
        Ok(())
    }

    fn start_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let client = ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };
        self.wifi.set_configuration(&Configuration::Mixed(
            client,
            self.ap_configuration.clone(),
        ))?;
        self.ensure_started()?;
        self.wifi.connect()?;
        info!("station connecting to `{ssid}`");
        Ok(())
    }

    fn disconnect_station(&mut self) -> anyhow::Result<()> {
        self.wifi.disconnect()?;
        self.wifi
            .set_configuration(&Configuration::AccessPoint(self.ap_configuration.clone()))?;
        info!("station role dropped");
        Ok(())
    }
}

/// One-shot reconnect timer. Each arm creates a fresh timer tagged with a
/// generation, so a firing that raced with a re-arm is recognised and dropped.
struct EspReconnectTimer {
    service: EspTaskTimerService,
    events: mpsc::Sender<NetEvent>,
    generation: u64,
    pending: Option<EspTimer<'static>>,
}

impl EspReconnectTimer {
    fn new(service: EspTaskTimerService, events: mpsc::Sender<NetEvent>) -> Self {
        Self {
            service,
            events,
            generation: 0,
            pending: None,
        }
    }

    fn expire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;
        true
    }
}

impl TimerSlot for EspReconnectTimer {
    fn arm(&mut self, delay_ms: u64) {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let events = self.events.clone();
        let armed = self
            .service
            .timer(move || {
                let _ = events.send(NetEvent::ReconnectTimerFired { generation });
            })
            .and_then(|timer| {
                timer.after(Duration::from_millis(delay_ms))?;
                Ok(timer)
            });

        match armed {
            Ok(timer) => self.pending = Some(timer),
            Err(err) => warn!("failed to arm reconnect timer: {err}"),
        }
    }

    fn cancel(&mut self) {
        if let Some(timer) = self.pending.take() {
            if let Err(err) = timer.cancel() {
                debug!("reconnect timer cancel failed: {err}");
            }
        }
    }

    fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

/// SNTP client behind the shared slot. Only one SNTP instance may exist, so
/// `start` drops the previous one before creating the next.
struct EspTimeServer {
    sntp: Arc<Mutex<Option<EspSntp<'static>>>>,
    offset: TimezoneOffset,
}

impl TimeServer for EspTimeServer {
    fn apply_timezone(&mut self, posix_tz: &str) -> Result<(), SyncError> {
        std::env::set_var("TZ", posix_tz);
        unsafe { esp_idf_svc::sys::tzset() };
        Ok(())
    }

    fn start(&mut self, servers: &[String]) -> Result<(), SyncError> {
        let mut slot = lock(&self.sntp);
        slot.take();

        let mut conf = SntpConf {
            sync_mode: SyncMode::Immediate,
            operating_mode: OperatingMode::Poll,
            ..Default::default()
        };
        for (server, configured) in conf.servers.iter_mut().zip(servers) {
            *server = configured.as_str();
        }

        let sntp = EspSntp::new(&conf).map_err(|err| SyncError::Server(err.to_string()))?;
        *slot = Some(sntp);
        Ok(())
    }

    fn sync_completed(&mut self) -> bool {
        lock(&self.sntp)
            .as_ref()
            .is_some_and(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
    }

    fn current_year(&mut self) -> i32 {
        Utc::now().with_timezone(&self.offset.fixed()).year()
    }

    fn wait(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Display, LEDs and buzzer on the clock's GPIOs.
struct EspPanel {
    display: Max7219Display,
    buzzer: PinDriver<'static, AnyOutputPin, Output>,
    seconds_led: PinDriver<'static, AnyOutputPin, Output>,
    pm_led: PinDriver<'static, AnyOutputPin, Output>,
    chime_pulse_ms: u64,
}

fn drive(pin: &mut PinDriver<'static, AnyOutputPin, Output>, on: bool, label: &str) {
    let result = if on { pin.set_high() } else { pin.set_low() };
    if let Err(err) = result {
        warn!("failed to drive {label}: {err}");
    }
}

impl DisplayDriver for EspPanel {
    fn render(&mut self, hour: u8, minute: u8, second: u8) {
        self.display.render(hour, minute, second);
    }

    fn render_text(&mut self, text: &str) {
        self.display.render_text(text);
    }

    fn clear(&mut self) {
        self.display.clear();
    }
}

impl ClockOutputs for EspPanel {
    fn set_buzzer(&mut self, on: bool) {
        drive(&mut self.buzzer, on, "buzzer");
    }

    fn set_seconds_led(&mut self, on: bool) {
        drive(&mut self.seconds_led, on, "seconds LED");
    }

    fn set_pm_led(&mut self, pm: bool) {
        drive(&mut self.pm_led, pm, "AM/PM LED");
    }

    fn chime(&mut self, pulses: u8) {
        let pulse = Duration::from_millis(self.chime_pulse_ms);
        for _ in 0..pulses {
            drive(&mut self.buzzer, true, "buzzer");
            thread::sleep(pulse);
            drive(&mut self.buzzer, false, "buzzer");
            thread::sleep(pulse);
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
