use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::schedule::{self, ScheduleRule, ScheduleType};

pub const TTL_EXPIRED_ERROR: &str = "update TTL expired";
pub const NO_WINDOW_ERROR: &str = "no timetable window before update TTL";
pub const CANCELED_ERROR: &str = "update canceled";

/// True when a per-item error was produced by cancellation rather than a
/// genuine failure. Such errors never become the update error summary.
pub fn is_cancel_error(message: &str) -> bool {
    message.contains(CANCELED_ERROR)
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum UpdateState {
    #[default]
    NoUpdate,
    Downloading,
    ReadyToUpdate,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum UpdateEvent {
    StartDownload,
    FinishDownload,
    StartUpdate,
    FinishUpdate,
    Cancel,
}

/// Hooks an update manager provides to the state machine. `state_changed`
/// fires on every transition, before the entry action of the new state, so
/// the manager can persist its record. The download and update entry
/// actions run on their own tasks with the update's cancellation token.
#[async_trait]
pub trait UpdateHandler: Send + Sync + 'static {
    async fn state_changed(&self, event: UpdateEvent, state: UpdateState, update_err: &str);
    async fn no_update(&self);
    async fn download(&self, token: CancellationToken);
    async fn ready_to_update(&self);
    async fn update(&self, token: CancellationToken);
}

fn transition(state: UpdateState, event: UpdateEvent) -> Option<UpdateState> {
    use UpdateEvent::*;
    use UpdateState::*;

    match (state, event) {
        (NoUpdate, StartDownload) => Some(Downloading),
        (Downloading, FinishDownload) => Some(ReadyToUpdate),
        (ReadyToUpdate, StartUpdate) => Some(Updating),
        (Updating, FinishUpdate) => Some(NoUpdate),
        (Downloading | ReadyToUpdate | Updating, Cancel) => Some(NoUpdate),
        _ => None,
    }
}

/// Generic TTL-aware state machine driving a single update through
/// {no update, downloading, ready to update, updating}.
pub struct UpdateStateMachine<H: UpdateHandler> {
    handler: Weak<H>,
    default_ttl: Duration,
    inner: Mutex<MachineInner>,
}

struct MachineInner {
    state: UpdateState,
    token: CancellationToken,
    ttl_date: Option<DateTime<Utc>>,
    ttl_task: Option<JoinHandle<()>>,
    schedule_task: Option<JoinHandle<()>>,
}

impl<H: UpdateHandler> UpdateStateMachine<H> {
    pub fn new(handler: Weak<H>, initial_state: UpdateState, default_ttl: Duration) -> Self {
        Self {
            handler,
            default_ttl,
            inner: Mutex::new(MachineInner {
                state: initial_state,
                token: CancellationToken::new(),
                ttl_date: None,
                ttl_task: None,
                schedule_task: None,
            }),
        }
    }

    /// Resumes a state restored from persistence: re-arms the TTL (an
    /// already expired deadline cancels immediately) and re-dispatches the
    /// entry action of the restored state.
    pub async fn init(self: &Arc<Self>, ttl_date: Option<DateTime<Utc>>) -> Result<()> {
        let resumed = {
            let mut inner = self.inner.lock().unwrap();

            if inner.state == UpdateState::NoUpdate {
                None
            } else {
                inner.token = CancellationToken::new();
                inner.ttl_date = ttl_date;

                let expired = ttl_date.map(|date| date <= Utc::now()).unwrap_or(false);
                if !expired {
                    if let Some(date) = ttl_date {
                        self.arm_ttl(&mut inner, date);
                    }
                }

                Some((inner.state, inner.token.clone(), expired))
            }
        };

        let Some((state, token, expired)) = resumed else {
            return Ok(());
        };

        if expired {
            return self.send_event(UpdateEvent::Cancel, TTL_EXPIRED_ERROR).await;
        }

        if let Some(handler) = self.handler.upgrade() {
            self.dispatch_entry(state, token, &handler).await;
        }

        Ok(())
    }

    pub fn current_state(&self) -> UpdateState {
        self.inner.lock().unwrap().state
    }

    pub fn can_transition(&self, event: UpdateEvent) -> bool {
        transition(self.inner.lock().unwrap().state, event).is_some()
    }

    /// Starts a new update: computes the TTL deadline, arms the TTL timer
    /// and emits the download event. Returns the deadline for persistence.
    pub async fn start_new_update(self: &Arc<Self>, ttl_secs: u64) -> Result<DateTime<Utc>> {
        let deadline = {
            let mut inner = self.inner.lock().unwrap();

            if inner.state != UpdateState::NoUpdate {
                return Err(anyhow!("update already in progress"));
            }

            let ttl = if ttl_secs == 0 {
                self.default_ttl
            } else {
                Duration::from_secs(ttl_secs)
            };
            let deadline = Utc::now()
                + chrono::Duration::from_std(ttl).map_err(|err| anyhow!("invalid TTL: {err}"))?;

            inner.token = CancellationToken::new();
            inner.ttl_date = Some(deadline);
            self.arm_ttl(&mut inner, deadline);

            deadline
        };

        self.send_event(UpdateEvent::StartDownload, "").await?;

        Ok(deadline)
    }

    /// Posts an event to the machine. Invalid transitions are rejected with
    /// an error; the caller decides whether that is fatal.
    pub async fn send_event(self: &Arc<Self>, event: UpdateEvent, update_err: &str) -> Result<()> {
        let (new_state, token) = {
            let mut inner = self.inner.lock().unwrap();

            let Some(next) = transition(inner.state, event) else {
                return Err(anyhow!("event {} rejected in state {}", event, inner.state));
            };

            debug!(from = %inner.state, to = %next, %event, "Update state transition");

            inner.state = next;

            if event == UpdateEvent::Cancel {
                inner.token.cancel();
            }

            if next == UpdateState::NoUpdate {
                inner.ttl_date = None;

                if let Some(task) = inner.ttl_task.take() {
                    task.abort();
                }
            }

            if let Some(task) = inner.schedule_task.take() {
                task.abort();
            }

            (next, inner.token.clone())
        };

        let Some(handler) = self.handler.upgrade() else {
            return Ok(());
        };

        handler.state_changed(event, new_state, update_err).await;
        self.dispatch_entry(new_state, token, &handler).await;

        Ok(())
    }

    /// Finishes a worker operation by posting the event plus error to the
    /// machine, substituting cancel when the operation's token is already
    /// cancelled. The substituted cancel is delivered only while the
    /// machine still holds that cancelled token: a fresh token means a
    /// pending update was promoted after the cancel, and the stale result
    /// must not be posted into the successor.
    pub async fn finish_operation(
        self: &Arc<Self>,
        token: &CancellationToken,
        event: UpdateEvent,
        operation_err: &str,
    ) {
        let (event, err) = if token.is_cancelled() {
            if !self.inner.lock().unwrap().token.is_cancelled() {
                debug!(%event, "Operation outlived its update, event dropped");
                return;
            }

            let err = if operation_err.is_empty() {
                CANCELED_ERROR.to_string()
            } else {
                operation_err.to_string()
            };

            (UpdateEvent::Cancel, err)
        } else {
            (event, operation_err.to_string())
        };

        if let Err(err) = self.send_event(event, &err).await {
            debug!("Finish operation event dropped: {err}");
        }
    }

    /// Consults the schedule on entry to the ready state: force updates
    /// start immediately, trigger updates wait for an external start and
    /// timetable updates wait for the next open window.
    pub fn schedule_update(self: &Arc<Self>, rule: &ScheduleRule) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(task) = inner.schedule_task.take() {
            task.abort();
        }

        match rule.schedule_type {
            ScheduleType::Force => {
                inner.schedule_task = Some(self.spawn_start_update(Duration::ZERO));
            }

            ScheduleType::Trigger => {}

            ScheduleType::Timetable => {
                let now_local = Local::now().naive_local();

                let delay = schedule::next_window(now_local, &rule.timetable)
                    .map(|window| (window - now_local).to_std().unwrap_or_default());

                let ttl_date = inner.ttl_date;
                let within_ttl = move |delay: Duration| match ttl_date {
                    Some(deadline) => chrono::Duration::from_std(delay)
                        .map(|delay| Utc::now() + delay < deadline)
                        .unwrap_or(false),
                    None => true,
                };

                if let Some(delay) = delay.filter(|delay| within_ttl(*delay)) {
                    inner.schedule_task = Some(self.spawn_start_update(delay));
                } else {
                    let machine = self.clone();
                    inner.schedule_task = Some(tokio::spawn(async move {
                        machine.clear_schedule_task();

                        if let Err(err) = machine
                            .send_event(UpdateEvent::Cancel, NO_WINDOW_ERROR)
                            .await
                        {
                            error!("Can't cancel update: {err}");
                        }
                    }));
                }
            }
        }
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(task) = inner.ttl_task.take() {
            task.abort();
        }

        if let Some(task) = inner.schedule_task.take() {
            task.abort();
        }

        inner.token.cancel();
    }

    // The timer tasks release their own join handle before emitting, so
    // the emission path never aborts the task it is running on.

    fn clear_ttl_task(&self) {
        drop(self.inner.lock().unwrap().ttl_task.take());
    }

    fn clear_schedule_task(&self) {
        drop(self.inner.lock().unwrap().schedule_task.take());
    }

    fn arm_ttl(self: &Arc<Self>, inner: &mut MachineInner, deadline: DateTime<Utc>) {
        if let Some(task) = inner.ttl_task.take() {
            task.abort();
        }

        let machine = Arc::downgrade(self);

        inner.ttl_task = Some(tokio::spawn(async move {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(remaining).await;

            let Some(machine) = machine.upgrade() else {
                return;
            };

            machine.clear_ttl_task();

            warn!("Update TTL expired");

            if machine.can_transition(UpdateEvent::Cancel) {
                if let Err(err) = machine
                    .send_event(UpdateEvent::Cancel, TTL_EXPIRED_ERROR)
                    .await
                {
                    error!("Can't cancel expired update: {err}");
                }
            }
        }));
    }

    fn spawn_start_update(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let machine = Arc::downgrade(self);

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let Some(machine) = machine.upgrade() else {
                return;
            };

            machine.clear_schedule_task();

            if let Err(err) = machine.send_event(UpdateEvent::StartUpdate, "").await {
                debug!("Scheduled start dropped: {err}");
            }
        })
    }

    async fn dispatch_entry(
        self: &Arc<Self>,
        state: UpdateState,
        token: CancellationToken,
        handler: &Arc<H>,
    ) {
        match state {
            UpdateState::Downloading => {
                let handler = handler.clone();
                tokio::spawn(async move { handler.download(token).await });
            }

            UpdateState::Updating => {
                let handler = handler.clone();
                tokio::spawn(async move { handler.update(token).await });
            }

            UpdateState::ReadyToUpdate => handler.ready_to_update().await,

            UpdateState::NoUpdate => handler.no_update().await,
        }
    }
}
