pub mod alarm;
pub mod arbiter;
pub mod button;
pub mod chime;
pub mod clock;
pub mod config;
pub mod display;
pub mod error;
pub mod keys;
pub mod time_sync;
pub mod timer;
pub mod types;

pub use alarm::{AlarmAction, AlarmConfig, AlarmController};
pub use arbiter::{
    dispatch, transition, ArbiterAction, ArbiterSnapshot, ArbiterState, ConnectivityArbiter,
    ConnectivityState, DispatchContext, DispatchOutcome, NetworkTransport, TransportEvent,
};
pub use button::{ButtonEdge, DebouncedButton};
pub use chime::ChimePlanner;
pub use clock::{apply_actions, retarget_wall_clock, ClockAction, ClockEngine, ClockOutputs};
pub use config::{AccessPointConfig, ClockConfig, DisplayConfig, PersistedSettings, RuntimeConfig};
pub use display::{DisplayDriver, DisplayFrame};
pub use error::{ConfigError, SyncError};
pub use keys::*;
pub use time_sync::{posix_tz, sync_now, SyncGuard, SyncPermit, SyncPlan, SyncScheduler, TimeServer};
pub use timer::{DeadlineTimer, TimerSlot};
pub use types::{AlarmView, ClockStatus, ClockTime, PinLevel, StationCredentials, TimezoneOffset};
