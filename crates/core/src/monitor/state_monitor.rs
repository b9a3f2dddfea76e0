//! Tracks the lifecycle state of every servable seen on an event bus

use super::event_bus::{EventAndTime, EventBus, Subscription};
use crate::servable::ServableId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Lifecycle state of a servable version inside a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// The manager is tracking the version but has not begun loading it
    Start,
    Loading,
    /// Ready to serve requests
    Available,
    Unloading,
    /// Unloaded, or failed to load
    End,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Start => "start",
            ManagerState::Loading => "loading",
            ManagerState::Available => "available",
            ManagerState::Unloading => "unloading",
            ManagerState::End => "end",
        };
        f.write_str(name)
    }
}

/// State of one servable version as published by a manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServableState {
    pub id: ServableId,
    pub manager_state: ManagerState,
    /// `Err` carries the error that moved the servable into this state
    pub health: Result<(), String>,
}

impl ServableState {
    /// A healthy state
    pub fn new(id: ServableId, manager_state: ManagerState) -> Self {
        Self {
            id,
            manager_state,
            health: Ok(()),
        }
    }

    /// Attach an error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.health = Err(error.into());
        self
    }
}

/// A state and when it was published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServableStateAndTime {
    pub state: ServableState,
    pub event_time_micros: u64,
}

/// States of one servable keyed by version
pub type VersionMap = BTreeMap<u64, ServableStateAndTime>;

/// States of every servable keyed by name
pub type ServableMap = BTreeMap<String, VersionMap>;

/// A servable to wait for: a specific version, or any version of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServableRequest {
    pub name: String,
    pub version: Option<u64>,
}

impl ServableRequest {
    pub fn specific(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version: Some(version),
        }
    }

    /// Any version of the named servable
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }
}

/// Monitor options
#[derive(Debug, Clone, Default)]
pub struct StateMonitorOptions {
    /// Size of the bounded event log; zero disables it
    pub max_count_log_events: usize,
}

/// States each requested servable ended up in
pub type StatesReached = BTreeMap<ServableId, ManagerState>;

type StateReachedFn = Box<dyn FnOnce(bool, StatesReached) + Send>;
type NotifyFn = Arc<dyn Fn(&ServableState) + Send + Sync>;

struct NotificationRequest {
    servables: Vec<ServableRequest>,
    goal_state: ManagerState,
    notifier: StateReachedFn,
}

#[derive(Default)]
struct MonitorState {
    states: ServableMap,
    live_states: ServableMap,
    log: VecDeque<ServableStateAndTime>,
    requests: Vec<NotificationRequest>,
}

impl MonitorState {
    fn get(&self, id: &ServableId) -> Option<&ServableStateAndTime> {
        self.states.get(&id.name)?.get(&id.version)
    }

    fn update_live_states(&mut self, state_and_time: &ServableStateAndTime) {
        let id = &state_and_time.state.id;
        if state_and_time.state.manager_state != ManagerState::End {
            self.live_states
                .entry(id.name.clone())
                .or_default()
                .insert(id.version, state_and_time.clone());
            return;
        }
        if let Some(versions) = self.live_states.get_mut(&id.name) {
            versions.remove(&id.version);
            if versions.is_empty() {
                self.live_states.remove(&id.name);
            }
        }
    }

    /// `Some((all_reached_goal, states))` once every requested servable has
    /// reached the goal or `End`
    fn check_request(
        &self,
        servables: &[ServableRequest],
        goal: ManagerState,
    ) -> Option<(bool, StatesReached)> {
        let settled = |s: ManagerState| s == goal || s == ManagerState::End;
        let mut reached_goal = true;
        let mut reached = StatesReached::new();
        for request in servables {
            let (id, state) = match request.version {
                Some(version) => {
                    let id = ServableId::new(request.name.clone(), version);
                    let state = self.get(&id)?.state.manager_state;
                    if !settled(state) {
                        return None;
                    }
                    (id, state)
                }
                None => {
                    let versions = self.states.get(&request.name)?;
                    let found = versions
                        .values()
                        .rev()
                        .find(|s| settled(s.state.manager_state))?;
                    (found.state.id.clone(), found.state.manager_state)
                }
            };
            reached_goal &= state == goal;
            reached.insert(id, state);
        }
        Some((reached_goal, reached))
    }

    /// Remove and return the requests that can now be answered
    fn take_ready_requests(&mut self) -> Vec<(StateReachedFn, bool, StatesReached)> {
        let mut ready = Vec::new();
        let mut pending = Vec::with_capacity(self.requests.len());
        for request in std::mem::take(&mut self.requests) {
            match self.check_request(&request.servables, request.goal_state) {
                Some((reached_goal, reached)) => {
                    ready.push((request.notifier, reached_goal, reached))
                }
                None => pending.push(request),
            }
        }
        self.requests = pending;
        ready
    }
}

struct MonitorShared {
    options: StateMonitorOptions,
    state: Mutex<MonitorState>,
    notify_fns: Mutex<Vec<NotifyFn>>,
}

impl MonitorShared {
    fn handle_event(&self, event_and_time: &EventAndTime<ServableState>) {
        let state_and_time = ServableStateAndTime {
            state: event_and_time.event.clone(),
            event_time_micros: event_and_time.event_time_micros,
        };

        let ready = {
            let mut state = self.state.lock();
            let id = &state_and_time.state.id;
            state
                .states
                .entry(id.name.clone())
                .or_default()
                .insert(id.version, state_and_time.clone());
            state.update_live_states(&state_and_time);
            let ready = state.take_ready_requests();

            if self.options.max_count_log_events > 0 {
                while state.log.len() >= self.options.max_count_log_events {
                    state.log.pop_front();
                }
                state.log.push_back(state_and_time.clone());
            }
            ready
        };

        tracing::debug!(
            "Servable {} is now {}",
            state_and_time.state.id,
            state_and_time.state.manager_state
        );
        for (notifier, reached_goal, reached) in ready {
            notifier(reached_goal, reached);
        }

        let notify_fns: Vec<NotifyFn> = self.notify_fns.lock().clone();
        for notify in notify_fns {
            notify(&state_and_time.state);
        }
    }
}

/// Keeps the latest state of every servable version published on a bus.
///
/// Notifications registered here run on the publishing thread, after the
/// monitor's own bookkeeping for the event, and never while its lock is
/// held.
pub struct ServableStateMonitor {
    shared: Arc<MonitorShared>,
    _subscription: Subscription,
}

impl ServableStateMonitor {
    pub fn new(bus: &Arc<EventBus<ServableState>>, options: StateMonitorOptions) -> Self {
        let shared = Arc::new(MonitorShared {
            options,
            state: Mutex::new(MonitorState::default()),
            notify_fns: Mutex::new(Vec::new()),
        });
        let handler = Arc::clone(&shared);
        let subscription = bus.subscribe(move |event| handler.handle_event(event));
        Self {
            shared,
            _subscription: subscription,
        }
    }

    /// Latest state of `id`, if any event mentioned it
    pub fn get_state(&self, id: &ServableId) -> Option<ServableState> {
        self.get_state_and_time(id).map(|s| s.state)
    }

    pub fn get_state_and_time(&self, id: &ServableId) -> Option<ServableStateAndTime> {
        self.shared.state.lock().get(id).cloned()
    }

    /// States of every known version of `servable_name`
    pub fn get_version_states(&self, servable_name: &str) -> VersionMap {
        self.shared
            .state
            .lock()
            .states
            .get(servable_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_all_servable_states(&self) -> ServableMap {
        self.shared.state.lock().states.clone()
    }

    /// States of versions that have not reached `End`
    pub fn get_live_servable_states(&self) -> ServableMap {
        self.shared.state.lock().live_states.clone()
    }

    /// Names of servables with at least one available version
    pub fn get_available_servable_names(&self) -> BTreeSet<String> {
        self.shared
            .state
            .lock()
            .live_states
            .iter()
            .filter(|(_, versions)| {
                versions
                    .values()
                    .any(|s| s.state.manager_state == ManagerState::Available)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop every version whose latest state is `End`
    pub fn forget_unloaded_servable_states(&self) {
        let mut state = self.shared.state.lock();
        for versions in state.states.values_mut() {
            versions.retain(|_, s| s.state.manager_state != ManagerState::End);
        }
    }

    /// The most recent events, oldest first
    pub fn get_bounded_log(&self) -> Vec<ServableStateAndTime> {
        self.shared.state.lock().log.iter().cloned().collect()
    }

    /// Call `notifier` once every servable in `servables` has reached
    /// `goal_state` or `End`. The flag passed to it tells whether all of
    /// them reached the goal. Fires immediately if that is already the case.
    pub fn notify_when_servables_reach_state<F>(
        &self,
        servables: Vec<ServableRequest>,
        goal_state: ManagerState,
        notifier: F,
    ) where
        F: FnOnce(bool, StatesReached) + Send + 'static,
    {
        let ready = {
            let mut state = self.shared.state.lock();
            state.requests.push(NotificationRequest {
                servables,
                goal_state,
                notifier: Box::new(notifier),
            });
            state.take_ready_requests()
        };
        for (notifier, reached_goal, reached) in ready {
            notifier(reached_goal, reached);
        }
    }

    /// Wait until every servable in `servables` has reached `goal_state` or
    /// `End`; returns whether all reached the goal, and the states reached
    pub async fn wait_until_servables_reach_state(
        &self,
        servables: Vec<ServableRequest>,
        goal_state: ManagerState,
    ) -> (bool, StatesReached) {
        let (tx, rx) = oneshot::channel();
        self.notify_when_servables_reach_state(servables, goal_state, move |reached_goal, reached| {
            let _ = tx.send((reached_goal, reached));
        });
        // The notifier lives in the monitor; it is only dropped unfired if
        // the monitor itself goes away.
        rx.await.unwrap_or_else(|_| (false, StatesReached::new()))
    }

    /// Call `notify` with every subsequent state change
    pub fn notify<F>(&self, notify: F)
    where
        F: Fn(&ServableState) + Send + Sync + 'static,
    {
        self.shared.notify_fns.lock().push(Arc::new(notify));
    }
}
