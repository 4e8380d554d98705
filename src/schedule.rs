use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::directory::{SchedulePreference, SubscriberDirectory};
use crate::domain::{Frequency, RetrievalMode};
use crate::engine::Engine;
use crate::error::SyncError;
use crate::outcome::OutcomeStore;
use crate::source::DocumentSource;

pub const HOUSEKEEPING_EXPRESSION: &str = "0 0 0 * * *";
pub const DEFAULT_WORKERS: usize = 4;

// Wake up regularly so clock adjustments are noticed.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerTarget {
    Subscriber,
    TaxIdentifiers { ids: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct Trigger {
    pub subscriber_id: String,
    pub target: TriggerTarget,
    pub expression: String,
    #[serde(skip)]
    pub schedule: Schedule,
}

impl Trigger {
    fn new(subscriber_id: &str, target: TriggerTarget, expression: String) -> Result<Self, SyncError> {
        let schedule = parse_expression(&expression)?;
        Ok(Self {
            subscriber_id: subscriber_id.to_string(),
            target,
            expression,
            schedule,
        })
    }

    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }
}

pub fn parse_expression(expression: &str) -> Result<Schedule, SyncError> {
    Schedule::from_str(expression)
        .map_err(|err| SyncError::Schedule(format!("{expression}: {err}")))
}

pub fn derive_expressions(preference: &SchedulePreference) -> Vec<String> {
    let (frequency, recognized) = Frequency::from_tag(&preference.frequency);
    if !recognized {
        warn!(
            frequency = preference.frequency.as_str(),
            "unknown schedule frequency, using daily"
        );
    }
    let mut hours_by_minute = BTreeMap::<u32, Vec<u32>>::new();
    for time in &preference.times {
        for offset in frequency.offsets() {
            hours_by_minute
                .entry(time.minute)
                .or_default()
                .push((time.hour + offset) % 24);
        }
    }
    let day_of_week = match frequency {
        Frequency::Weekly => "Mon",
        _ => "*",
    };
    hours_by_minute
        .into_iter()
        .map(|(minute, mut hours)| {
            hours.sort_unstable();
            hours.dedup();
            let hours = hours
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("0 {minute} {hours} * * {day_of_week}")
        })
        .collect()
}

pub fn derive_plan<D: SubscriberDirectory + ?Sized>(directory: &D) -> Result<Vec<Trigger>, SyncError> {
    let mut triggers = Vec::new();
    for subscriber in directory.subscribers()? {
        if subscriber.credential().is_none() {
            debug!(subscriber = %subscriber.id, "no credential, not scheduled");
            continue;
        }
        let tax_identifiers = directory.active_tax_identifiers(&subscriber.id)?;
        let has_overrides = tax_identifiers.iter().any(|tax| has_times(tax.schedule.as_ref()));

        if let Some(preference) = subscriber.schedule.as_ref().filter(|pref| !pref.times.is_empty()) {
            let expressions = derive_expressions(preference);
            if has_overrides {
                let ids = tax_identifiers
                    .iter()
                    .filter(|tax| !has_times(tax.schedule.as_ref()))
                    .map(|tax| tax.id.clone())
                    .collect::<Vec<_>>();
                if !ids.is_empty() {
                    for expression in expressions {
                        triggers.push(Trigger::new(
                            &subscriber.id,
                            TriggerTarget::TaxIdentifiers { ids: ids.clone() },
                            expression,
                        )?);
                    }
                }
            } else {
                for expression in expressions {
                    triggers.push(Trigger::new(&subscriber.id, TriggerTarget::Subscriber, expression)?);
                }
            }
        }

        for tax in &tax_identifiers {
            if let Some(preference) = tax.schedule.as_ref().filter(|pref| !pref.times.is_empty()) {
                for expression in derive_expressions(preference) {
                    triggers.push(Trigger::new(
                        &subscriber.id,
                        TriggerTarget::TaxIdentifiers {
                            ids: vec![tax.id.clone()],
                        },
                        expression,
                    )?);
                }
            }
        }
    }
    Ok(triggers)
}

fn has_times(preference: Option<&SchedulePreference>) -> bool {
    preference.is_some_and(|pref| !pref.times.is_empty())
}

pub fn due_triggers<'a, Tz: TimeZone>(
    triggers: &'a [Trigger],
    since: &DateTime<Tz>,
    now: &DateTime<Tz>,
) -> Vec<&'a Trigger> {
    triggers
        .iter()
        .filter(|trigger| trigger.next_after(since).is_some_and(|next| next <= *now))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub subscriber_id: String,
    pub target: TriggerTarget,
    pub expressions: Vec<String>,
}

// Triggers of one subscriber that fall due together become a single run, since
// runs of the same subscriber exclude each other.
pub fn coalesce(due: &[&Trigger]) -> Vec<Firing> {
    let mut firings: Vec<Firing> = Vec::new();
    for trigger in due {
        let position = firings
            .iter()
            .position(|firing| firing.subscriber_id == trigger.subscriber_id);
        let Some(position) = position else {
            firings.push(Firing {
                subscriber_id: trigger.subscriber_id.clone(),
                target: trigger.target.clone(),
                expressions: vec![trigger.expression.clone()],
            });
            continue;
        };
        let firing = &mut firings[position];
        firing.expressions.push(trigger.expression.clone());
        match (&mut firing.target, &trigger.target) {
            (TriggerTarget::Subscriber, _) => {}
            (target, TriggerTarget::Subscriber) => *target = TriggerTarget::Subscriber,
            (TriggerTarget::TaxIdentifiers { ids }, TriggerTarget::TaxIdentifiers { ids: more }) => {
                for id in more {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
        }
    }
    firings
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("xml-sync-worker-{index}"))
                    .spawn(move || worker_loop(&receiver))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!("failed to spawn worker: {err}");
                    None
                }
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender
            && sender.send(Box::new(job)).is_err()
        {
            warn!("worker pool is closed, job dropped");
        }
    }

    pub fn join(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let guard = receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

enum Control {
    Replan(Vec<Trigger>),
    Shutdown,
}

pub struct ScheduleHandle {
    control: Sender<Control>,
    housekeeping_stop: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl ScheduleHandle {
    pub fn shutdown(self) {
        let _ = self.control.send(Control::Shutdown);
        let _ = self.housekeeping_stop.send(());
        for handle in self.threads {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }

    pub fn wait(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

pub struct ScheduleManager<S, O, D>
where
    S: DocumentSource + 'static,
    O: OutcomeStore + 'static,
    D: SubscriberDirectory + 'static,
{
    engine: Arc<Engine<S, O, D>>,
    workers: usize,
}

impl<S, O, D> ScheduleManager<S, O, D>
where
    S: DocumentSource + 'static,
    O: OutcomeStore + 'static,
    D: SubscriberDirectory + 'static,
{
    pub fn new(engine: Arc<Engine<S, O, D>>, workers: usize) -> Self {
        Self { engine, workers }
    }

    pub fn plan(&self) -> Result<Vec<Trigger>, SyncError> {
        derive_plan(self.engine.directory())
    }

    pub fn start(self) -> Result<ScheduleHandle, SyncError> {
        let plan = self.plan()?;
        info!(triggers = plan.len(), workers = self.workers, "scheduler starting");
        let housekeeping = parse_expression(HOUSEKEEPING_EXPRESSION)?;

        let (control_tx, control_rx) = mpsc::channel::<Control>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let engine = Arc::clone(&self.engine);
        let workers = self.workers;
        let trigger_thread = thread::Builder::new()
            .name("xml-sync-triggers".to_string())
            .spawn(move || trigger_loop(engine, plan, control_rx, workers))
            .map_err(|err| SyncError::Schedule(format!("spawn trigger loop: {err}")))?;

        let engine = Arc::clone(&self.engine);
        let replan_tx = control_tx.clone();
        let housekeeping_thread = thread::Builder::new()
            .name("xml-sync-housekeeping".to_string())
            .spawn(move || housekeeping_loop(engine, housekeeping, replan_tx, stop_rx))
            .map_err(|err| SyncError::Schedule(format!("spawn housekeeping loop: {err}")))?;

        Ok(ScheduleHandle {
            control: control_tx,
            housekeeping_stop: stop_tx,
            threads: vec![trigger_thread, housekeeping_thread],
        })
    }
}

fn now_local(clock: &dyn Clock) -> DateTime<Local> {
    clock.now().with_timezone(&Local)
}

fn wait_until(clock: &dyn Clock, next: Option<DateTime<Local>>) -> Duration {
    match next {
        Some(next) => (next - now_local(clock)).to_std().unwrap_or(Duration::ZERO),
        None => MAX_WAIT,
    }
    .min(MAX_WAIT)
}

fn trigger_loop<S, O, D>(
    engine: Arc<Engine<S, O, D>>,
    mut plan: Vec<Trigger>,
    control: Receiver<Control>,
    workers: usize,
) where
    S: DocumentSource + 'static,
    O: OutcomeStore + 'static,
    D: SubscriberDirectory + 'static,
{
    let pool = WorkerPool::new(workers);
    let mut cursor = now_local(engine.clock());
    loop {
        let next = plan.iter().filter_map(|trigger| trigger.next_after(&cursor)).min();
        match control.recv_timeout(wait_until(engine.clock(), next)) {
            Ok(Control::Replan(triggers)) => {
                info!(triggers = triggers.len(), "schedule plan refreshed");
                plan = triggers;
                continue;
            }
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = now_local(engine.clock());
        for firing in coalesce(&due_triggers(&plan, &cursor, &now)) {
            dispatch(&pool, &engine, firing);
        }
        cursor = now;
    }
    info!("trigger loop stopped, waiting for running jobs");
    pool.join();
}

fn dispatch<S, O, D>(pool: &WorkerPool, engine: &Arc<Engine<S, O, D>>, firing: Firing)
where
    S: DocumentSource + 'static,
    O: OutcomeStore + 'static,
    D: SubscriberDirectory + 'static,
{
    info!(
        subscriber = %firing.subscriber_id,
        expressions = firing.expressions.join(" | ").as_str(),
        "trigger fired"
    );
    let engine = Arc::clone(engine);
    pool.execute(move || {
        let result = match &firing.target {
            TriggerTarget::Subscriber => {
                engine.run_for_subscriber(&firing.subscriber_id, RetrievalMode::Scheduled, None, None)
            }
            TriggerTarget::TaxIdentifiers { ids } => {
                let ids = ids.iter().map(String::as_str).collect::<Vec<_>>();
                engine.run_for_tax_identifiers(
                    &firing.subscriber_id,
                    &ids,
                    None,
                    None,
                    RetrievalMode::Scheduled,
                )
            }
        };
        match result {
            Ok(summary) => debug!(
                subscriber = %firing.subscriber_id,
                archived = summary.documents_archived,
                "scheduled run complete"
            ),
            Err(SyncError::RunInProgress(id)) => {
                warn!(subscriber = %id, "previous run still active, trigger skipped")
            }
            Err(err) => error!(subscriber = %firing.subscriber_id, "scheduled run failed: {err}"),
        }
    });
}

fn housekeeping_loop<S, O, D>(
    engine: Arc<Engine<S, O, D>>,
    schedule: Schedule,
    replan: Sender<Control>,
    stop: Receiver<()>,
) where
    S: DocumentSource + 'static,
    O: OutcomeStore + 'static,
    D: SubscriberDirectory + 'static,
{
    let mut cursor = now_local(engine.clock());
    loop {
        let next = schedule.after(&cursor).next();
        match stop.recv_timeout(wait_until(engine.clock(), next)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let now = now_local(engine.clock());
        if next.is_none_or(|next| next > now) {
            continue;
        }
        cursor = now;

        info!("housekeeping started");
        match derive_plan(engine.directory()) {
            Ok(plan) => {
                if replan.send(Control::Replan(plan)).is_err() {
                    break;
                }
            }
            Err(err) => error!("failed to rebuild schedule plan: {err}"),
        }
        if let Err(err) = engine.purge_expired() {
            error!("retention sweep failed: {err}");
        }
    }
    debug!("housekeeping loop stopped");
}
