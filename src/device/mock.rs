//! Scriptable in-memory backend for tests

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ActivityFeed, DeviceBackend, DeviceError, DeviceId, DeviceSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Enable(DeviceSet),
    Disable(DeviceSet),
    Subscribe(DeviceSet),
}

#[derive(Default)]
struct MockState {
    enumerations: VecDeque<Option<DeviceSet>>,
    feeds: VecDeque<mpsc::Receiver<String>>,
    silent_senders: Vec<mpsc::Sender<String>>,
    fail_subscribe: bool,
    fail_control: bool,
    calls: Vec<Call>,
}

/// Records every control call; enumeration results and activity feeds are
/// queued up front by the test
#[derive(Default)]
pub(crate) struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue an enumeration result; `None` makes that poll fail
    pub(crate) fn push_enumeration(&self, devices: Option<DeviceSet>) {
        self.lock().enumerations.push_back(devices);
    }

    /// Queue the feed returned by the next `subscribe`
    ///
    /// Without a queued feed, `subscribe` hands out one that never produces
    /// a line and never ends.
    pub(crate) fn push_feed(&self, lines: mpsc::Receiver<String>) {
        self.lock().feeds.push_back(lines);
    }

    pub(crate) fn fail_subscribe(&self) {
        self.lock().fail_subscribe = true;
    }

    pub(crate) fn fail_control(&self) {
        self.lock().fail_control = true;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn control(&self, call: Call, devices: &DeviceSet) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.fail_control {
            return Err(DeviceError::Control {
                failed: devices
                    .iter()
                    .map(|id| (id, "mock failure".to_string()))
                    .collect(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBackend for MockBackend {
    async fn enumerate(&self) -> Result<DeviceSet, DeviceError> {
        match self.lock().enumerations.pop_front() {
            Some(Some(devices)) => Ok(devices),
            Some(None) => Err(DeviceError::Control {
                failed: vec![(DeviceId(0), "mock enumeration failure".to_string())],
            }),
            None => Ok(DeviceSet::new()),
        }
    }

    async fn enable(&self, devices: &DeviceSet) -> Result<(), DeviceError> {
        self.control(Call::Enable(devices.clone()), devices)
    }

    async fn disable(&self, devices: &DeviceSet) -> Result<(), DeviceError> {
        self.control(Call::Disable(devices.clone()), devices)
    }

    async fn subscribe(&self, devices: &DeviceSet) -> Result<ActivityFeed, DeviceError> {
        let mut state = self.lock();
        state.calls.push(Call::Subscribe(devices.clone()));
        if state.fail_subscribe {
            return Err(DeviceError::NoOutput(
                devices.iter().next().unwrap_or(DeviceId(0)),
            ));
        }

        let lines = match state.feeds.pop_front() {
            Some(lines) => lines,
            None => {
                let (tx, rx) = mpsc::channel(1);
                state.silent_senders.push(tx);
                rx
            }
        };
        Ok(ActivityFeed::from_channel(lines))
    }
}

pub(crate) fn devices(ids: &[u32]) -> DeviceSet {
    ids.iter().copied().map(DeviceId).collect()
}
