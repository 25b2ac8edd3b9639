use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, RawQuery, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use alarmclock_common::{
    apply_actions, dispatch, retarget_wall_clock, sync_now, ArbiterSnapshot, ClockAction,
    ClockEngine, ClockOutputs, ClockStatus, ClockTime, ConfigError, ConnectivityArbiter,
    DispatchContext,
    DisplayDriver, NetworkTransport, PersistedSettings, PinLevel, RuntimeConfig,
    StationCredentials, SyncError, SyncGuard, SyncScheduler, TimeServer, TimerSlot,
    TimezoneOffset, TransportEvent,
};

use crate::web::{self, int_param, str_param, u8_param, RequestError, SettingsError, INDEX_HTML};

const SIM_ASSOCIATE_MS: u64 = 800;
const SIM_DHCP_MS: u64 = 300;
const SIM_BUTTON_HOLD_MS: u64 = 300;

#[derive(Clone)]
struct AppState {
    config: Arc<RuntimeConfig>,
    engine: Arc<Mutex<ClockEngine>>,
    panel: Arc<Mutex<HostPanel>>,
    settings: Arc<Mutex<PersistedSettings>>,
    network_view: Arc<Mutex<ArbiterSnapshot>>,
    scheduler: Arc<Mutex<SyncScheduler>>,
    sync_guard: SyncGuard,
    wall_clock: HostClock,
    button_low: Arc<AtomicBool>,
    network: mpsc::UnboundedSender<NetEvent>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
enum NetEvent {
    Transport(TransportEvent),
    ReconnectTimerFired { generation: u64 },
    CredentialsChanged(StationCredentials),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
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

#[derive(Debug, Serialize)]
struct SimResponse {
    event: &'static str,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if let Some(poll_ms) = std::env::var("CLOCK_POLL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        runtime.clock.poll_interval_ms = poll_ms;
    }
    runtime.sanitize();

    let mut panel = HostPanel::default();
    panel.render_text("------");

    let (network_tx, network_rx) = mpsc::unbounded_channel();
    let app_state = AppState {
        engine: Arc::new(Mutex::new(ClockEngine::new(&runtime))),
        panel: Arc::new(Mutex::new(panel)),
        settings: Arc::new(Mutex::new(runtime.settings.clone())),
        network_view: Arc::new(Mutex::new(ArbiterSnapshot::default())),
        scheduler: Arc::new(Mutex::new(SyncScheduler::new())),
        sync_guard: SyncGuard::new(),
        wall_clock: HostClock::default(),
        button_low: Arc::new(AtomicBool::new(false)),
        network: network_tx,
        config: Arc::new(runtime),
        store,
    };

    spawn_network_loop(app_state.clone(), network_rx);
    spawn_control_loop(app_state.clone());

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/api/status", get(handle_get_status))
        .route("/api/time", post(handle_set_time))
        .route("/api/alarm", post(handle_set_alarm))
        .route("/api/timezone", post(handle_set_timezone))
        .route("/api/wifi", post(handle_set_wifi))
        .route("/api/dismiss", post(handle_dismiss))
        .route("/api/sync", post(handle_sync))
        .route("/api/sim/ap-client", post(handle_sim_ap_client))
        .route("/api/sim/button", post(handle_sim_button))
        .layer(DefaultBodyLimit::max(web::MAX_REQUEST_BYTES))
        .with_state(app_state);

    let port = std::env::var("CLOCK_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind clock server at {addr}"))?;

    info!("clock listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let poll = Duration::from_millis(app_state.config.clock.poll_interval_ms);
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let offset = app_state.settings.lock().await.timezone();
            let now = ClockTime::from_datetime(&app_state.wall_clock.local(offset));
            let level = PinLevel::from_high(!app_state.button_low.load(Ordering::Relaxed));

            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.tick(now, level, monotonic_ms())
            };

            execute_clock_actions(&app_state, &actions).await;
        }
    });
}

async fn execute_clock_actions(app_state: &AppState, actions: &[ClockAction]) {
    if actions.is_empty() {
        return;
    }
    let mut panel = app_state.panel.lock().await;
    apply_actions(&mut *panel, actions);
}

fn spawn_network_loop(app_state: AppState, mut events: mpsc::UnboundedReceiver<NetEvent>) {
    tokio::spawn(async move {
        let station_fails = std::env::var("CLOCK_SIM_STATION").is_ok_and(|value| value == "fail");
        let mut link = NetworkLink::new(&app_state, station_fails).await;
        link.apply(&app_state, TransportEvent::Boot).await;

        while let Some(event) = events.recv().await {
            link.handle(&app_state, event).await;
        }
    });
}

/// Everything owned by the network event loop. Only that loop touches it,
/// which keeps arbiter transitions serialized.
struct NetworkLink {
    arbiter: ConnectivityArbiter,
    transport: SimulatedTransport,
    timer: TokioTimer,
    credentials: StationCredentials,
}

impl NetworkLink {
    async fn new(app_state: &AppState, station_fails: bool) -> Self {
        let credentials = app_state.settings.lock().await.credentials();
        Self {
            arbiter: ConnectivityArbiter::new(credentials.is_present()),
            transport: SimulatedTransport::new(app_state.network.clone(), station_fails),
            timer: TokioTimer::new(app_state.network.clone()),
            credentials,
        }
    }

    async fn handle(&mut self, app_state: &AppState, event: NetEvent) {
        let event = match event {
            NetEvent::Transport(event) => event,
            NetEvent::ReconnectTimerFired { generation } => {
                if !self.timer.expire(generation) {
                    debug!(generation, "ignoring stale reconnect timer");
                    return;
                }
                TransportEvent::ReconnectTimerFired
            }
            NetEvent::CredentialsChanged(updated) => {
                info!(ssid = %updated.ssid, "station credentials changed, re-initialising network");
                self.reset(updated);
                TransportEvent::Boot
            }
        };
        self.apply(app_state, event).await;
    }

    async fn apply(&mut self, app_state: &AppState, event: TransportEvent) {
        let before = self.arbiter.state();
        let actions = self.arbiter.handle(event);
        let after = self.arbiter.state();
        if before != after {
            info!(%before, %after, ?event, "connectivity transition");
        } else {
            debug!(state = %after, ?event, "connectivity event");
        }

        let ctx = DispatchContext {
            access_point: &app_state.config.access_point,
            credentials: &self.credentials,
            reconnect_delay_ms: app_state.config.clock.reconnect_delay_ms,
        };
        let outcome = dispatch(&actions, &mut self.transport, &mut self.timer, &ctx);
        for (action, err) in &outcome.failures {
            warn!(?action, "radio action failed: {err}");
        }

        *app_state.network_view.lock().await = self.arbiter.snapshot();

        if outcome.sync_requested {
            on_station_online(app_state).await;
        }
    }

    /// Stands in for the firmware restart after a credential change. A join
    /// still in flight for the old network is abandoned as well.
    fn reset(&mut self, credentials: StationCredentials) {
        self.transport.abandon_join();
        if self.arbiter.connectivity().station_connected {
            if let Err(err) = self.transport.disconnect_station() {
                warn!("failed to drop station before re-init: {err:#}");
            }
        }
        self.timer.cancel();
        self.arbiter = ConnectivityArbiter::new(credentials.is_present());
        self.credentials = credentials;
    }
}

async fn on_station_online(app_state: &AppState) {
    let plan = app_state.scheduler.lock().await.on_ip_acquired();
    if plan.start_periodic {
        spawn_periodic_sync(app_state.clone());
    }
    if plan.run_now {
        if let Err(err) = trigger_sync(app_state, "ip acquired").await {
            info!("time sync not started: {err}");
        }
    }
}

fn spawn_periodic_sync(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.clock.sync_interval_ms.max(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            interval.tick().await;

            let connected = app_state
                .network_view
                .lock()
                .await
                .connectivity
                .station_connected;
            if !app_state.scheduler.lock().await.periodic_tick(connected) {
                debug!("periodic time sync skipped, station offline");
                continue;
            }
            if let Err(err) = trigger_sync(&app_state, "periodic").await {
                info!("periodic time sync not started: {err}");
            }
        }
    });
}

async fn trigger_sync(app_state: &AppState, reason: &'static str) -> Result<(), SyncError> {
    let permit = app_state.sync_guard.try_begin()?;
    let offset = app_state.settings.lock().await.timezone();
    let config = app_state.config.clock.clone();
    let clock = app_state.wall_clock.clone();
    let scheduler = app_state.scheduler.clone();

    info!(reason, "starting time sync");
    tokio::spawn(async move {
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut server = HostTimeServer::new(clock);
            sync_now(&mut server, offset, &config)
        })
        .await;

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("time sync task failed: {err}");
                return;
            }
        };
        match &outcome {
            Ok(attempts) => info!(attempts, "time synchronized"),
            Err(err) => warn!("time sync failed: {err}"),
        }
        scheduler.lock().await.record(&outcome);
    });
    Ok(())
}

async fn handle_index() -> impl IntoResponse {
    Html(INDEX_HTML)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn build_status(state: &AppState) -> ClockStatus {
    let settings = state.settings.lock().await.clone();
    let now = ClockTime::from_datetime(&state.wall_clock.local(settings.timezone()));
    let alarm = state.engine.lock().await.alarm_view();
    let network = *state.network_view.lock().await;
    let time_synced = state.scheduler.lock().await.is_synced();

    ClockStatus::new(now, alarm, &settings, network, time_synced)
}

async fn handle_set_time(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> axum::response::Response {
    let parsed = params(query).and_then(|params| {
        Ok((
            u8_param(&params, "hour")?,
            u8_param(&params, "minute")?,
            u8_param(&params, "second")?,
        ))
    });
    let (hour, minute, second) = match parsed {
        Ok(fields) => fields,
        Err(err) => return request_error(&err),
    };
    let time = match ClockTime::new(hour, minute, second) {
        Ok(time) => time,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let offset = state.settings.lock().await.timezone();
    let Some(target) = retarget_wall_clock(state.wall_clock.now_utc(), offset, time) else {
        return error_response(StatusCode::BAD_REQUEST, "Time does not exist today");
    };
    state.wall_clock.set_utc(target);
    info!(hour, minute, second, "wall clock set manually");

    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_alarm(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> axum::response::Response {
    let parsed = params(query)
        .and_then(|params| Ok((int_param(&params, "hour")?, int_param(&params, "minute")?)));
    let (hour, minute) = match parsed {
        Ok(fields) => fields,
        Err(err) => return request_error(&err),
    };

    if let Err(err) = update_settings(&state, |settings| settings.set_alarm(hour, minute)).await {
        return settings_error("alarm", &err);
    }

    let result = state.engine.lock().await.set_alarm(hour, minute);
    let actions = match result {
        Ok(actions) => actions,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    execute_clock_actions(&state, &actions).await;
    info!(hour, minute, "alarm updated");

    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_timezone(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> axum::response::Response {
    let parsed = params(query)
        .and_then(|params| Ok((int_param(&params, "hours")?, int_param(&params, "minutes")?)));
    let (hours, minutes) = match parsed {
        Ok(fields) => fields,
        Err(err) => return request_error(&err),
    };

    match update_settings(&state, |settings| settings.set_timezone(hours, minutes)).await {
        Err(err) => return settings_error("timezone", &err),
        Ok(false) => {}
        Ok(true) => info!(hours, minutes, "timezone updated"),
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_wifi(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> axum::response::Response {
    let parsed = params(query).and_then(|params| {
        let ssid = str_param(&params, "ssid")?.to_string();
        let password = params.get("password").cloned().unwrap_or_default();
        Ok((ssid, password))
    });
    let (ssid, password) = match parsed {
        Ok(fields) => fields,
        Err(err) => return request_error(&err),
    };

    let own_ap_ssid = &state.config.access_point.ssid;
    let result = update_settings(&state, |settings| {
        let changed = settings.set_station_credentials(&ssid, &password, own_ap_ssid)?;
        Ok((changed, settings.credentials()))
    })
    .await;
    let (changed, credentials) = match result {
        Ok(updated) => updated,
        Err(err) => return settings_error("wifi credentials", &err),
    };

    let response = WifiUpdateResponse {
        restarting: changed,
        wifi_ssid: credentials.ssid.clone(),
        wifi_pass_set: credentials.has_password,
    };
    if changed && state.network.send(NetEvent::CredentialsChanged(credentials)).is_err() {
        warn!("network loop is gone, credentials apply on next start");
    }

    Json(response).into_response()
}

async fn handle_dismiss(State(state): State<AppState>) -> impl IntoResponse {
    let actions = state.engine.lock().await.dismiss_alarm();
    if !actions.is_empty() {
        info!("alarm dismissed from web");
    }
    execute_clock_actions(&state, &actions).await;

    handle_get_status(State(state)).await
}

async fn handle_sync(State(state): State<AppState>) -> axum::response::Response {
    let connected = state.network_view.lock().await.connectivity.station_connected;
    if let Err(err) = state.scheduler.lock().await.request_manual(connected) {
        return error_response(StatusCode::CONFLICT, &err.to_string());
    }

    let sync = match trigger_sync(&state, "manual").await {
        Ok(()) => "started",
        Err(_) => "already_running",
    };
    Json(SyncResponse { sync }).into_response()
}

async fn handle_sim_ap_client(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> axum::response::Response {
    let action = match params(query).and_then(|params| Ok(str_param(&params, "action")?.to_string())) {
        Ok(action) => action,
        Err(err) => return request_error(&err),
    };
    let (event, label) = match action.as_str() {
        "attach" => (TransportEvent::ApClientAttached, "ap_client_attached"),
        "detach" => (TransportEvent::ApClientDetached, "ap_client_detached"),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid action. Use 'attach' or 'detach'",
            )
        }
    };

    if state.network.send(NetEvent::Transport(event)).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Network loop stopped");
    }
    Json(SimResponse { event: label }).into_response()
}

async fn handle_sim_button(State(state): State<AppState>) -> impl IntoResponse {
    state.button_low.store(true, Ordering::Relaxed);
    let button_low = state.button_low.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(SIM_BUTTON_HOLD_MS)).await;
        button_low.store(false, Ordering::Relaxed);
    });
    Json(SimResponse {
        event: "button_pressed",
    })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLOCK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.alarmclock"));

        Self {
            runtime_path: Arc::new(data_dir.join("settings.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Edits a copy of the settings and commits it only once it is stored, so a
/// rejected edit or a failed write leaves the live settings as they were.
async fn update_settings<T>(
    state: &AppState,
    edit: impl FnOnce(&mut PersistedSettings) -> Result<T, ConfigError>,
) -> Result<T, SettingsError> {
    let mut settings = state.settings.lock().await;
    let mut staged = settings.clone();
    let value = edit(&mut staged)?;
    if staged != *settings {
        persist_settings(state, &staged)
            .await
            .map_err(SettingsError::Persist)?;
        *settings = staged;
    }
    Ok(value)
}

async fn persist_settings(state: &AppState, settings: &PersistedSettings) -> anyhow::Result<()> {
    let mut runtime = state.store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("stored runtime config unreadable, rewriting it: {err:#}");
        RuntimeConfig::clone(&state.config)
    });
    runtime.settings = settings.clone();
    state.store.save_runtime_config(&runtime).await
}

/// Wall clock with a manual adjustment layered over the host's clock.
#[derive(Clone, Default)]
struct HostClock {
    adjust_ms: Arc<AtomicI64>,
}

impl HostClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.adjust_ms.load(Ordering::Relaxed))
    }

    fn local(&self, offset: TimezoneOffset) -> DateTime<FixedOffset> {
        self.now_utc().with_timezone(&offset.fixed())
    }

    fn set_utc(&self, target: DateTime<Utc>) {
        let delta = target - Utc::now();
        self.adjust_ms
            .store(delta.num_milliseconds(), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.adjust_ms.store(0, Ordering::Relaxed);
    }
}

/// The host OS already disciplines its clock, so a sync drops any manual
/// adjustment and reads the year back.
struct HostTimeServer {
    clock: HostClock,
    posix_tz: String,
    started: bool,
}

impl HostTimeServer {
    fn new(clock: HostClock) -> Self {
        Self {
            clock,
            posix_tz: String::new(),
            started: false,
        }
    }
}

impl TimeServer for HostTimeServer {
    fn apply_timezone(&mut self, posix_tz: &str) -> Result<(), SyncError> {
        self.posix_tz = posix_tz.to_string();
        Ok(())
    }

    fn start(&mut self, servers: &[String]) -> Result<(), SyncError> {
        info!(tz = %self.posix_tz, "syncing against {}", servers.join(", "));
        self.clock.reset();
        self.started = true;
        Ok(())
    }

    fn sync_completed(&mut self) -> bool {
        self.started
    }

    fn current_year(&mut self) -> i32 {
        self.clock.now_utc().year()
    }

    fn wait(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Stands in for the radio: station joins succeed after a short delay
/// unless `CLOCK_SIM_STATION=fail`.
struct SimulatedTransport {
    events: mpsc::UnboundedSender<NetEvent>,
    link: Arc<AtomicU64>,
    station_fails: bool,
}

impl SimulatedTransport {
    fn new(events: mpsc::UnboundedSender<NetEvent>, station_fails: bool) -> Self {
        Self {
            events,
            link: Arc::new(AtomicU64::new(0)),
            station_fails,
        }
    }
}

impl SimulatedTransport {
    /// Any join started before this call never reports back.
    fn abandon_join(&mut self) {
        self.link.fetch_add(1, Ordering::SeqCst);
    }
}

impl NetworkTransport for SimulatedTransport {
    type Error = anyhow::Error;

    fn start_access_point(&mut self, ssid: &str, _password: &str) -> anyhow::Result<()> {
        info!(ssid, "simulated access point up");
        Ok(())
    }

    fn start_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let link = self.link.fetch_add(1, Ordering::SeqCst) + 1;
        info!(ssid, open = password.is_empty(), "simulated station connecting");

        let events = self.events.clone();
        let current = self.link.clone();
        let fails = self.station_fails;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(SIM_ASSOCIATE_MS)).await;
            if current.load(Ordering::SeqCst) != link {
                return;
            }
            if fails {
                let _ = events.send(NetEvent::Transport(TransportEvent::StationDisconnected));
                return;
            }
            let _ = events.send(NetEvent::Transport(TransportEvent::StationConnected));

            tokio::time::sleep(Duration::from_millis(SIM_DHCP_MS)).await;
            if current.load(Ordering::SeqCst) == link {
                let _ = events.send(NetEvent::Transport(TransportEvent::IpAcquired));
            }
        });
        Ok(())
    }

    fn disconnect_station(&mut self) -> anyhow::Result<()> {
        self.abandon_join();
        info!("simulated station disconnecting");
        self.events
            .send(NetEvent::Transport(TransportEvent::StationDisconnected))
            .context("network loop closed")?;
        Ok(())
    }
}

/// Reconnect timer on a tokio task. Each arm gets a new generation so a
/// firing that raced with a re-arm is recognised and dropped.
struct TokioTimer {
    events: mpsc::UnboundedSender<NetEvent>,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl TokioTimer {
    fn new(events: mpsc::UnboundedSender<NetEvent>) -> Self {
        Self {
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

impl TimerSlot for TokioTimer {
    fn arm(&mut self, delay_ms: u64) {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let events = self.events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = events.send(NetEvent::ReconnectTimerFired { generation });
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

/// Display, LEDs and buzzer rendered as log lines.
#[derive(Default)]
struct HostPanel {
    text: String,
    buzzer: bool,
    seconds_led: bool,
    pm: Option<bool>,
}

impl DisplayDriver for HostPanel {
    fn render(&mut self, hour: u8, minute: u8, second: u8) {
        let text = format!("{hour:02}{minute:02}{second:02}");
        if text != self.text {
            debug!(display = %text);
            self.text = text;
        }
    }

    fn render_text(&mut self, text: &str) {
        info!(display = %text);
        self.text = text.to_string();
    }

    fn clear(&mut self) {
        self.text.clear();
    }
}

impl ClockOutputs for HostPanel {
    fn set_buzzer(&mut self, on: bool) {
        if self.buzzer != on {
            if on {
                info!("alarm sounding");
            } else {
                info!("alarm silenced");
            }
        }
        self.buzzer = on;
    }

    fn set_seconds_led(&mut self, on: bool) {
        self.seconds_led = on;
    }

    fn set_pm_led(&mut self, pm: bool) {
        if self.pm != Some(pm) {
            debug!(pm, "am/pm lamp");
        }
        self.pm = Some(pm);
    }

    fn chime(&mut self, pulses: u8) {
        info!(pulses, "chime");
    }
}

fn params(query: Option<String>) -> Result<web::Params, RequestError> {
    web::parse_query(query.as_deref().unwrap_or_default())
}

fn request_error(err: &RequestError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_REQUEST);
    error_response(status, &err.to_string())
}

fn settings_error(what: &str, err: &SettingsError) -> axum::response::Response {
    match err {
        SettingsError::Rejected(reason) => warn!("rejected {what} update: {reason}"),
        SettingsError::Persist(reason) => warn!("failed to persist {what} update: {reason:#}"),
    }
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
