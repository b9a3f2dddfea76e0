//! Servable lifecycle observation

pub mod event_bus;
pub mod state_monitor;

pub use event_bus::{EventAndTime, EventBus, Subscription};
pub use state_monitor::{
    ManagerState, ServableMap, ServableRequest, ServableState, ServableStateAndTime,
    ServableStateMonitor, StateMonitorOptions, StatesReached, VersionMap,
};
