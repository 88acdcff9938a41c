//! Ability lifecycle.
//!
//! An [`Ability`] is a start/stoppable behavior of a worker. The
//! [`AbilityRunner`] owns one ability, moves it through its states and
//! reports every transition on the worker's dispatcher:
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              │          │
//!              └──────────┴──→ Errored ──→ Stopped
//! ```
//!
//! Both the `Starting` and `Running` failures are reported as
//! `ability.crashed`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bob_core::protocol::{
    AbilityCrashed, AbilityDeclaration, EVENT_ABILITY_CRASHED, EVENT_ABILITY_STARTED,
    EVENT_ABILITY_STOPPED,
};
use bob_core::{Dispatcher, Event};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::AbilityError;

/// A start/stoppable behavior exposed by a worker.
#[async_trait]
pub trait Ability: Send + 'static {
    /// Name, unique within the worker.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Start the producer resource. Runs before the loop is spawned.
    async fn acquire(&mut self) -> Result<(), AbilityError> {
        Ok(())
    }

    /// The execution loop. Returns `Ok(())` once `cancel` fires.
    async fn run(&mut self, cancel: CancellationToken, sink: &EventSink)
    -> Result<(), AbilityError>;

    /// Stop the producer resource. Called once after the loop exits.
    async fn release(&mut self) -> Result<(), AbilityError> {
        Ok(())
    }
}

/// Publishes events tagged with one ability's name.
#[derive(Clone)]
pub struct EventSink {
    dispatcher: Arc<Dispatcher>,
    ability: String,
}

impl EventSink {
    /// Sink that tags every event with `ability`.
    pub fn new(dispatcher: Arc<Dispatcher>, ability: impl Into<String>) -> Self {
        Self {
            dispatcher,
            ability: ability.into(),
        }
    }

    /// Ability name events are tagged with.
    pub fn ability(&self) -> &str {
        &self.ability
    }

    /// Dispatch a payload-less event.
    pub fn emit(&self, name: &str) {
        self.dispatcher
            .dispatch(&Event::new(name).with_ability(self.ability.as_str()));
    }

    /// Dispatch an event carrying `data`.
    pub fn emit_data<T: Serialize>(&self, name: &str, data: &T) -> Result<(), AbilityError> {
        let event = Event::new(name)
            .with_ability(self.ability.as_str())
            .with_data(data)?;
        self.dispatcher.dispatch(&event);
        Ok(())
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("ability", &self.ability)
            .finish_non_exhaustive()
    }
}

/// Run state of one ability on the worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbilityState {
    /// Not running.
    #[default]
    Stopped,
    /// Acquiring the producer resource.
    Starting,
    /// Loop is running.
    Running,
    /// Stop requested, loop winding down.
    Stopping,
    /// Start or loop failed, cleaning up.
    Errored,
}

struct RunnerState {
    state: watch::Sender<AbilityState>,
    last_error: Option<String>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl RunnerState {
    fn current(&self) -> AbilityState {
        *self.state.borrow()
    }

    fn set(&self, state: AbilityState) {
        let _ = self.state.send_replace(state);
    }
}

type SharedAbility = Arc<tokio::sync::Mutex<Box<dyn Ability>>>;

/// Drives one ability through start, run and stop.
pub struct AbilityRunner {
    name: String,
    description: String,
    ability: SharedAbility,
    sink: EventSink,
    shared: Arc<Mutex<RunnerState>>,
}

impl AbilityRunner {
    /// Wrap `ability`. Status and data events go to `dispatcher`.
    pub fn new<A: Ability>(ability: A, dispatcher: Arc<Dispatcher>) -> Self {
        let name = ability.name().to_owned();
        let description = ability.description().to_owned();
        let (state, _) = watch::channel(AbilityState::Stopped);
        Self {
            sink: EventSink::new(dispatcher, name.clone()),
            name,
            description,
            ability: Arc::new(tokio::sync::Mutex::new(Box::new(ability))),
            shared: Arc::new(Mutex::new(RunnerState {
                state,
                last_error: None,
                cancel: None,
                task: None,
            })),
        }
    }

    /// Ability name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ability description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declaration sent in `worker.register`.
    pub fn declaration(&self) -> AbilityDeclaration {
        AbilityDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    /// Current state.
    pub fn state(&self) -> AbilityState {
        self.shared.lock().current()
    }

    /// Error that ended the most recent run, if it crashed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Acquire the producer and spawn the loop.
    ///
    /// If acquiring fails or panics, `ability.crashed` is emitted instead of
    /// `ability.started`, the runner returns to `Stopped` and the error is
    /// returned.
    pub async fn start(&self) -> Result<(), AbilityError> {
        {
            let shared = self.shared.lock();
            if shared.current() != AbilityState::Stopped {
                return Err(AbilityError::AlreadyRunning(self.name.clone()));
            }
            shared.set(AbilityState::Starting);
        }

        let mut ability = Arc::clone(&self.ability).lock_owned().await;
        let acquired = AssertUnwindSafe(ability.acquire())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(AbilityError::Panicked(panic_message(&*panic))));
        if let Err(e) = acquired {
            drop(ability);
            let message = e.to_string();
            {
                let mut shared = self.shared.lock();
                shared.set(AbilityState::Errored);
                shared.last_error = Some(message.clone());
                shared.set(AbilityState::Stopped);
            }
            report_crash(&self.sink, message);
            return Err(e);
        }

        self.sink.emit(EVENT_ABILITY_STARTED);
        info!(ability = %self.name, "ability started");

        let cancel = CancellationToken::new();
        // Held across the spawn so the loop cannot finish before it is recorded
        let mut shared = self.shared.lock();
        shared.set(AbilityState::Running);
        shared.last_error = None;
        shared.cancel = Some(cancel.clone());
        shared.task = Some(tokio::spawn(run_loop(
            ability,
            cancel,
            self.sink.clone(),
            Arc::clone(&self.shared),
        )));
        Ok(())
    }

    /// Cancel the loop and wait for it to wind down.
    ///
    /// A stop during `Starting` waits for the start to settle first, then
    /// stops the ability if it came up. Otherwise a no-op unless the ability
    /// is `Running`.
    pub async fn stop(&self) {
        let mut rx = self.shared.lock().state.subscribe();
        let _ = rx.wait_for(|state| *state != AbilityState::Starting).await;

        let (cancel, task) = {
            let mut shared = self.shared.lock();
            if shared.current() != AbilityState::Running {
                debug!(ability = %self.name, state = ?shared.current(), "stop ignored");
                return;
            }
            shared.set(AbilityState::Stopping);
            (shared.cancel.take(), shared.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(ability = %self.name, error = %e, "ability task failed");
            }
        }
    }

    /// Wait until the runner is back in `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.lock().state.subscribe();
        let _ = rx.wait_for(|state| *state == AbilityState::Stopped).await;
    }
}

impl std::fmt::Debug for AbilityRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbilityRunner")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn run_loop(
    mut ability: OwnedMutexGuard<Box<dyn Ability>>,
    cancel: CancellationToken,
    sink: EventSink,
    shared: Arc<Mutex<RunnerState>>,
) {
    let outcome = AssertUnwindSafe(ability.run(cancel, &sink))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(AbilityError::Panicked(panic_message(&*panic))));

    shared.lock().set(if outcome.is_ok() {
        AbilityState::Stopping
    } else {
        AbilityState::Errored
    });

    match AssertUnwindSafe(ability.release()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(ability = %sink.ability(), error = %e, "releasing ability failed"),
        Err(panic) => warn!(
            ability = %sink.ability(),
            error = %panic_message(&*panic),
            "releasing ability panicked"
        ),
    }
    drop(ability);

    let crash = outcome.err().map(|e| e.to_string());
    {
        let mut shared = shared.lock();
        shared.cancel = None;
        shared.task = None;
        if crash.is_some() {
            shared.last_error.clone_from(&crash);
        }
        shared.set(AbilityState::Stopped);
    }

    match crash {
        None => {
            info!(ability = %sink.ability(), "ability stopped");
            sink.emit(EVENT_ABILITY_STOPPED);
        }
        Some(error) => report_crash(&sink, error),
    }
}

fn report_crash(sink: &EventSink, error: String) {
    error!(ability = %sink.ability(), error = %error, "ability crashed");
    if let Err(e) = sink.emit_data(EVENT_ABILITY_CRASHED, &AbilityCrashed { error }) {
        warn!(ability = %sink.ability(), error = %e, "crash event not dispatched");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Script {
        UntilCancelled,
        Fail,
        Panic,
    }

    #[derive(Clone, Copy)]
    enum Acquire {
        Ready,
        Refuse,
        Panic,
        Slow,
    }

    #[derive(Default)]
    struct Counters {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    struct Scripted {
        script: Script,
        acquire: Acquire,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Ability for Scripted {
        fn name(&self) -> &str {
            "Hearing"
        }

        fn description(&self) -> &str {
            "scripted"
        }

        async fn acquire(&mut self) -> Result<(), AbilityError> {
            match self.acquire {
                Acquire::Ready => {}
                Acquire::Refuse => {
                    return Err(AbilityError::Acquire {
                        ability: "Hearing".into(),
                        source: "no device".into(),
                    });
                }
                Acquire::Panic => panic!("driver exploded"),
                Acquire::Slow => tokio::time::sleep(Duration::from_millis(100)).await,
            }
            let _ = self.counters.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(
            &mut self,
            cancel: CancellationToken,
            _sink: &EventSink,
        ) -> Result<(), AbilityError> {
            match self.script {
                Script::UntilCancelled => {
                    cancel.cancelled().await;
                    Ok(())
                }
                Script::Fail => Err(AbilityError::Read("device unplugged".into())),
                Script::Panic => panic!("boom"),
            }
        }

        async fn release(&mut self) -> Result<(), AbilityError> {
            let _ = self.counters.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn runner(script: Script, acquire: Acquire) -> (AbilityRunner, Arc<Counters>, Arc<Mutex<Vec<Event>>>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        dispatcher.add_listener(Dispatcher::ANY, move |e: &Event| {
            sink.lock().push(e.clone());
            Ok(())
        });
        let counters = Arc::new(Counters::default());
        let ability = Scripted {
            script,
            acquire,
            counters: Arc::clone(&counters),
        };
        (AbilityRunner::new(ability, dispatcher), counters, events)
    }

    fn names(events: &Mutex<Vec<Event>>) -> Vec<String> {
        events.lock().iter().map(|e| e.name.clone()).collect()
    }

    #[tokio::test]
    async fn start_then_stop_reports_both_transitions() {
        let (runner, counters, events) = runner(Script::UntilCancelled, Acquire::Ready);
        runner.start().await.unwrap();
        assert_eq!(runner.state(), AbilityState::Running);

        runner.stop().await;
        assert_eq!(runner.state(), AbilityState::Stopped);
        assert_eq!(names(&events), vec![EVENT_ABILITY_STARTED, EVENT_ABILITY_STOPPED]);
        assert!(events.lock().iter().all(|e| e.ability_name.as_deref() == Some("Hearing")));
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert!(runner.last_error().is_none());
    }

    #[tokio::test]
    async fn acquire_failure_reports_crash() {
        let (runner, counters, events) = runner(Script::UntilCancelled, Acquire::Refuse);
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, AbilityError::Acquire { .. }));
        assert_eq!(runner.state(), AbilityState::Stopped);
        assert_eq!(names(&events), vec![EVENT_ABILITY_CRASHED]);
        let payload: AbilityCrashed = events.lock()[0].payload_as().unwrap();
        assert_eq!(payload.error, err.to_string());
        assert_eq!(runner.last_error(), Some(err.to_string()));
        assert_eq!(counters.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn acquire_panic_reports_crash() {
        let (runner, _, events) = runner(Script::UntilCancelled, Acquire::Panic);
        let err = runner.start().await.unwrap_err();
        assert!(matches!(&err, AbilityError::Panicked(msg) if msg.contains("driver exploded")));
        assert_eq!(runner.state(), AbilityState::Stopped);
        assert_eq!(names(&events), vec![EVENT_ABILITY_CRASHED]);

        // The failed start left the runner free for another attempt
        let again = runner.start().await.unwrap_err();
        assert!(matches!(again, AbilityError::Panicked(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_start_waits_then_stops() {
        let (runner, counters, events) = runner(Script::UntilCancelled, Acquire::Slow);
        let (started, ()) = tokio::join!(runner.start(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(runner.state(), AbilityState::Starting);
            runner.stop().await;
        });
        started.unwrap();

        assert_eq!(runner.state(), AbilityState::Stopped);
        assert_eq!(names(&events), vec![EVENT_ABILITY_STARTED, EVENT_ABILITY_STOPPED]);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loop_error_crashes_and_releases() {
        let (runner, counters, events) = runner(Script::Fail, Acquire::Ready);
        runner.start().await.unwrap();
        runner.wait_stopped().await;

        assert_eq!(names(&events), vec![EVENT_ABILITY_STARTED, EVENT_ABILITY_CRASHED]);
        let crashed = events.lock()[1].clone();
        let payload: AbilityCrashed = crashed.payload_as().unwrap();
        assert_eq!(payload.error, "reading sample failed: device unplugged");
        assert_eq!(runner.last_error().as_deref(), Some(payload.error.as_str()));
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loop_panic_is_reported_as_crash() {
        let (runner, counters, events) = runner(Script::Panic, Acquire::Ready);
        runner.start().await.unwrap();
        runner.wait_stopped().await;

        assert_eq!(names(&events).last().map(String::as_str), Some(EVENT_ABILITY_CRASHED));
        assert!(runner.last_error().unwrap().contains("boom"));
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_silent() {
        let (runner, _, events) = runner(Script::UntilCancelled, Acquire::Ready);
        runner.stop().await;
        assert_eq!(runner.state(), AbilityState::Stopped);
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (runner, counters, _) = runner(Script::UntilCancelled, Acquire::Ready);
        runner.start().await.unwrap();
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, AbilityError::AlreadyRunning(name) if name == "Hearing"));
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
        runner.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop_acquires_again() {
        let (runner, counters, events) = runner(Script::UntilCancelled, Acquire::Ready);
        runner.start().await.unwrap();
        runner.stop().await;
        runner.start().await.unwrap();
        runner.stop().await;
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(counters.released.load(Ordering::SeqCst), 2);
        assert_eq!(events.lock().len(), 4);
    }

    #[test]
    fn declaration_and_debug() {
        let (runner, _, _) = runner(Script::UntilCancelled, Acquire::Ready);
        assert_eq!(runner.declaration().description, "scripted");
        assert!(format!("{runner:?}").contains("Stopped"));
    }
}
