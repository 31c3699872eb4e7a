/*!
 # Timer monitor

 Produces a deduplicated stream of [`TimerSnapshot`]s from a page whose
 structure is unknown and may change at any time.

 Once discovery binds a target, mutation observers and a fixed-interval poll
 both feed the same recompute-and-compare step. A snapshot is emitted only
 when its value or its color differs from the last one emitted. The poll
 also re-checks that the bound node is still attached and, for targets found
 by id, that the id still points at the same element.
*/

use futures::future::pending;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::color::ColorValue;
use crate::discovery::{
    document_has_candidate, resolve_color, AcquisitionTarget, BindOrigin, Discovery, KnownId,
};
use crate::dom::{Document, MutationBatch, MutationObserver, ObserveOptions, ObserverHandle};

/// Shortest accepted poll period; `interval_at` rejects zero
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Attributes that can change an element's background
const COLOR_ATTRIBUTES: &[&str] = &["style", "class", "background"];

/// Timer display state at an instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    /// Raw displayed text, trimmed (e.g. `01:07`)
    pub value: String,
    /// Effective background color
    pub color: ColorValue,
}

/// The single change subscriber.
///
/// Runs while the monitor's state lock is held, so it must not call back
/// into the monitor. Hand the snapshot off (e.g. into a channel) instead.
pub type ChangeCallback = Box<dyn FnMut(&TimerSnapshot) + Send>;

/// Anything that can deliver timer changes to one subscriber
pub trait ChangeSource {
    /// Replaces the subscriber; `None` removes it
    fn set_change_callback(&self, callback: Option<ChangeCallback>);
}

/// Discovery and monitoring settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Id of the element showing the timer text
    pub value_element_id: String,
    /// Id of the container whose background shows the timer state
    pub color_element_id: Option<String>,
    /// Selector patterns tried in order when the id lookup fails
    pub selectors: Vec<String>,
    /// Backstop poll period
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            value_element_id: "timeDiv".to_string(),
            color_element_id: Some("timergrid".to_string()),
            selectors: [
                "[class*=\"timer\"]",
                "[id*=\"timer\"]",
                ".countdown",
                ".clock",
                "[class*=\"countdown\"]",
                "[class*=\"clock\"]",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl MonitorConfig {
    pub(crate) fn known_id(&self) -> KnownId {
        KnownId {
            value_id: self.value_element_id.clone(),
            color_id: self.color_element_id.clone(),
        }
    }
}

/// Where the monitor is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Running the discovery tiers
    Searching,
    /// Nothing found; watching the whole document for a timer to appear
    Watching,
    /// Tracking a bound target
    Bound(AcquisitionTarget),
    /// Destroyed
    Stopped,
}

/// Diagnostic view of the monitor
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub phase: MonitorPhase,
    pub last: Option<TimerSnapshot>,
    pub callback_set: bool,
}

struct State {
    callback: Option<ChangeCallback>,
    last: Option<TimerSnapshot>,
    phase: MonitorPhase,
    observers: Vec<ObserverHandle>,
    destroyed: bool,
}

struct Shared<D> {
    document: Arc<D>,
    config: MonitorConfig,
    discovery: Discovery,
    state: Mutex<State>,
}

/// How a monitoring pass ended
enum Exit {
    /// The bound node left the document; run discovery from the top
    Rescan,
    /// The known id moved to another element; bind it directly
    Rebind(AcquisitionTarget),
}

/// Locates and follows the timer inside a [`Document`]
pub struct TimerMonitor<D: Document> {
    shared: Arc<Shared<D>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Document> TimerMonitor<D> {
    /// Starts discovery and monitoring on the current tokio runtime
    #[instrument(skip(document))]
    pub fn start(document: Arc<D>, mut config: MonitorConfig) -> Self {
        info!("Starting timer monitor");
        if config.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "Poll interval {:?} too short, using {:?}",
                config.poll_interval, MIN_POLL_INTERVAL
            );
            config.poll_interval = MIN_POLL_INTERVAL;
        }
        let shared = Arc::new(Shared {
            document,
            discovery: Discovery::from_config(&config),
            config,
            state: Mutex::new(State {
                callback: None,
                last: None,
                phase: MonitorPhase::Searching,
                observers: Vec::new(),
                destroyed: false,
            }),
        });
        let task = tokio::spawn(shared.clone().run());
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Detaches all observers, cancels the poll timer and clears the callback.
    ///
    /// No callback runs once this returns. Safe to call more than once.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.destroyed {
                info!("Stopping timer monitor");
            }
            state.destroyed = true;
            state.callback = None;
            state.phase = MonitorPhase::Stopped;
            for observer in state.observers.drain(..) {
                observer.disconnect();
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.shared.state.lock();
        MonitorStatus {
            phase: state.phase,
            last: state.last.clone(),
            callback_set: state.callback.is_some(),
        }
    }

    /// Last snapshot emitted, if any
    pub fn last_snapshot(&self) -> Option<TimerSnapshot> {
        self.shared.state.lock().last.clone()
    }
}

impl<D: Document> ChangeSource for TimerMonitor<D> {
    /// Replaces the subscriber.
    ///
    /// A new subscriber immediately receives the last known snapshot so it
    /// does not wait for the next change.
    fn set_change_callback(&self, callback: Option<ChangeCallback>) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            debug!("Ignoring change callback on a destroyed monitor");
            return;
        }
        state.callback = callback;
        if let (Some(callback), Some(last)) = (state.callback.as_mut(), state.last.as_ref()) {
            if !last.value.is_empty() {
                trace!("Delivering last known snapshot to new subscriber");
                callback(last);
            }
        }
    }
}

impl<D: Document> Drop for TimerMonitor<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<D: Document> Shared<D> {
    fn document(&self) -> &dyn Document {
        self.document.as_ref()
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.set_phase(MonitorPhase::Searching);
            let Some(mut target) = self.discovery.run(self.document()) else {
                info!("Timer element not found, watching document for it");
                self.watch_document().await;
                continue;
            };
            loop {
                match self.monitor(target).await {
                    Exit::Rebind(next) => target = next,
                    Exit::Rescan => break,
                }
            }
        }
    }

    fn set_phase(&self, phase: MonitorPhase) {
        let mut state = self.state.lock();
        if !state.destroyed {
            state.phase = phase;
        }
    }

    /// Replaces the tracked observer registrations, disconnecting the old ones
    fn track_observers(&self, observers: Vec<ObserverHandle>) {
        let mut state = self.state.lock();
        for old in state.observers.drain(..) {
            old.disconnect();
        }
        if state.destroyed {
            observers.iter().for_each(ObserverHandle::disconnect);
        } else {
            state.observers = observers;
        }
    }

    /// Watches every subtree mutation until some element's own text reads as a time
    async fn watch_document(&self) {
        self.set_phase(MonitorPhase::Watching);
        let Some(body) = self.document.body() else {
            trace!("Document has no body yet");
            time::sleep(self.config.poll_interval).await;
            return;
        };

        let mut watcher = self.document.observe(body, ObserveOptions::content());
        self.track_observers(vec![watcher.handle()]);

        // Mutations between the failed discovery and `observe` produce no batch
        if document_has_candidate(self.document()) {
            debug!("Timer-like element present once watching, resuming discovery");
            watcher.disconnect();
            self.track_observers(Vec::new());
            return;
        }

        loop {
            let Some(batch) = watcher.next_batch().await else {
                warn!("Document watcher closed, retrying discovery");
                time::sleep(self.config.poll_interval).await;
                return;
            };
            trace!("Document watcher saw {} mutation(s)", batch.len());
            if document_has_candidate(self.document()) {
                info!("Timer-like element appeared, resuming discovery");
                watcher.disconnect();
                self.track_observers(Vec::new());
                return;
            }
        }
    }

    /// Tracks one target until it is detached or replaced
    async fn monitor(&self, target: AcquisitionTarget) -> Exit {
        info!(
            "Monitoring timer: value {} color {} ({:?})",
            target.value_node, target.color_node, target.origin
        );
        self.set_phase(MonitorPhase::Bound(target));

        let separate_color = target.color_node != target.value_node;
        let mut value_options = ObserveOptions::content();
        if !separate_color {
            value_options.attributes = true;
            value_options.attribute_filter = COLOR_ATTRIBUTES.iter().map(|s| s.to_string()).collect();
        }
        let mut value_observer = self.document.observe(target.value_node, value_options);
        let mut color_observer = separate_color.then(|| {
            self.document
                .observe(target.color_node, ObserveOptions::attributes(COLOR_ATTRIBUTES))
        });

        let mut handles = vec![value_observer.handle()];
        handles.extend(color_observer.as_ref().map(MutationObserver::handle));
        self.track_observers(handles);

        self.check(&target);

        let period = self.config.poll_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = next_or_pending(Some(&mut value_observer)) => {
                    trace!("Value observer: {} mutation(s)", batch.len());
                    self.check(&target);
                }
                batch = next_or_pending(color_observer.as_mut()) => {
                    trace!("Color observer: {} mutation(s)", batch.len());
                    self.check(&target);
                }
                _ = ticker.tick() => {
                    if !self.document.is_connected(target.value_node) {
                        info!("Timer element disconnected, rescanning");
                        self.track_observers(Vec::new());
                        return Exit::Rescan;
                    }
                    if target.origin == BindOrigin::KnownId {
                        if let Some(next) = self.config.known_id().resolve(self.document()) {
                            if next.value_node != target.value_node {
                                info!("Timer element replaced, re-binding");
                                self.track_observers(Vec::new());
                                return Exit::Rebind(next);
                            }
                        }
                    }
                    self.check(&target);
                }
            }
        }
    }

    fn snapshot(&self, target: &AcquisitionTarget) -> TimerSnapshot {
        let value = self
            .document
            .text_content(target.value_node)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        TimerSnapshot {
            value,
            color: resolve_color(self.document(), target.color_node),
        }
    }

    /// Recomputes the snapshot and emits it if value or color changed
    fn check(&self, target: &AcquisitionTarget) {
        let snapshot = self.snapshot(target);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed || state.last.as_ref() == Some(&snapshot) {
            return;
        }
        debug!("Timer update: {} [{}]", snapshot.value, snapshot.color);
        if let Some(callback) = state.callback.as_mut() {
            callback(&snapshot);
        }
        state.last = Some(snapshot);
    }
}

/// Next batch from an observer, or never if there is none or it closed
async fn next_or_pending(observer: Option<&mut MutationObserver>) -> MutationBatch {
    if let Some(observer) = observer {
        if let Some(batch) = observer.next_batch().await {
            return batch;
        }
    }
    pending().await
}
