use std::{collections::VecDeque, pin::Pin, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, Instant, Sleep},
};
use tracing::{debug, error, warn};

use crate::{
    config::UmControllerConfig,
    data_model::{
        ComponentStatus, DesiredComponent, ItemState, SystemComponent, UmId, UmState, UmStatus,
    },
    status::{ComponentsUpdateResult, FirmwareUpdater},
    storage::Storage,
};

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Translates package URLs between local and remote forms before they are
/// handed to a specific update manager client.
pub trait UrlTranslator: Send + Sync {
    fn translate_url(&self, is_local: bool, url: &str) -> Result<String>;
}

/// Handler of one registered update manager client. Commands return once
/// acknowledged by the transport; the resulting state arrives later through
/// a status update.
#[async_trait]
pub trait UmClient: Send + Sync {
    async fn prepare_update(&self, packages: Vec<SystemComponent>) -> Result<()>;
    async fn start_update(&self) -> Result<()>;
    async fn start_apply(&self) -> Result<()>;
    async fn start_revert(&self) -> Result<()>;
    async fn close(&self);
}

enum Request {
    OpenConnection {
        um_id: UmId,
        handler: Arc<dyn UmClient>,
        status: UmStatus,
    },
    CloseConnection {
        um_id: UmId,
    },
    StatusUpdate {
        um_id: UmId,
        status: UmStatus,
    },
    UpdateComponents {
        components: Vec<DesiredComponent>,
        reply: oneshot::Sender<Result<ComponentsUpdateResult>>,
    },
    GetStatus {
        reply: oneshot::Sender<Vec<ComponentStatus>>,
    },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "camelCase")]
enum CtrlState {
    Init,
    Idle,
    PrepareUpdate,
    StartUpdate,
    StartApply,
    StartRevert,
    Fault,
}

#[derive(Debug, strum::Display)]
#[strum(serialize_all = "camelCase")]
enum CtrlEvent {
    AllClientsConnected,
    ConnectionTimeout,
    UpdateRequest,
    ContinuePrepare,
    ContinueUpdate,
    ContinueApply,
    ContinueRevert,
    UmStateUpdated { um_id: UmId, status: UmStatus },
    UpdatePrepared,
    SystemUpdated,
    ApplyComplete,
    UpdateFailed { error: String },
    SystemReverted,
}

struct UmConnection {
    um_id: UmId,
    is_local: bool,
    priority: u32,
    handler: Option<Arc<dyn UmClient>>,
    state: UmState,
    components: Vec<String>,
    update_packages: Vec<SystemComponent>,
}

/// Update managers controller: registry of UM client connections plus the
/// state machine orchestrating the two-phase update across them.
///
/// All mutable state is owned by a single message loop; public calls talk
/// to it through the request channel and per-call reply channels, so an
/// update sequence transparently survives client reconnections.
pub struct UmController {
    request_tx: mpsc::Sender<Request>,
}

impl UmController {
    pub fn new(
        config: &UmControllerConfig,
        storage: Arc<dyn Storage>,
        url_translator: Arc<dyn UrlTranslator>,
    ) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(32);

        let mut connections: Vec<UmConnection> = config
            .um_clients
            .iter()
            .map(|client| UmConnection {
                um_id: UmId::new(client.um_id.clone()),
                is_local: client.is_local,
                priority: client.priority,
                handler: None,
                state: UmState::Idle,
                components: Vec::new(),
                update_packages: Vec::new(),
            })
            .collect();

        connections.sort_by_key(|connection| connection.priority);

        let controller_loop = ControllerLoop {
            storage,
            url_translator,
            connections,
            current_components: Vec::new(),
            state: CtrlState::Init,
            update_error: None,
            update_waiters: Vec::new(),
            status_waiters: Vec::new(),
            queue: VecDeque::new(),
            timer_command: None,
            stopping: false,
        };

        tokio::spawn(controller_loop.run(request_rx));

        Arc::new(Self { request_tx })
    }

    /// Registers an update manager client connection together with the
    /// status it declared on registration.
    pub async fn open_connection(
        &self,
        um_id: UmId,
        handler: Arc<dyn UmClient>,
        status: UmStatus,
    ) -> Result<()> {
        self.send(Request::OpenConnection {
            um_id,
            handler,
            status,
        })
        .await
    }

    pub async fn close_connection(&self, um_id: UmId) -> Result<()> {
        self.send(Request::CloseConnection { um_id }).await
    }

    pub async fn um_status_update(&self, um_id: UmId, status: UmStatus) -> Result<()> {
        self.send(Request::StatusUpdate { um_id, status }).await
    }

    /// Runs a component update round and waits for its terminal transition.
    /// Concurrent callers each wait on their own reply and receive the same
    /// accumulated result.
    pub async fn update_components(
        &self,
        components: Vec<DesiredComponent>,
    ) -> Result<ComponentsUpdateResult> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send(Request::UpdateComponents {
            components,
            reply: reply_tx,
        })
        .await?;

        reply_rx
            .await
            .map_err(|_| anyhow!("update manager controller is closed"))?
    }

    /// Returns the accumulated component list; waits out the initial
    /// connection phase first.
    pub async fn get_status(&self) -> Result<Vec<ComponentStatus>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send(Request::GetStatus { reply: reply_tx }).await?;

        reply_rx
            .await
            .map_err(|_| anyhow!("update manager controller is closed"))
    }

    pub async fn close(&self) {
        let _ = self.request_tx.send(Request::Stop).await;
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| anyhow!("update manager controller is closed"))
    }
}

#[async_trait]
impl FirmwareUpdater for UmController {
    async fn get_status(&self) -> Result<Vec<ComponentStatus>> {
        UmController::get_status(self).await
    }

    async fn update_components(
        &self,
        components: Vec<DesiredComponent>,
    ) -> Result<ComponentsUpdateResult> {
        UmController::update_components(self, components).await
    }
}

struct ControllerLoop {
    storage: Arc<dyn Storage>,
    url_translator: Arc<dyn UrlTranslator>,
    connections: Vec<UmConnection>,
    current_components: Vec<ComponentStatus>,
    state: CtrlState,
    update_error: Option<String>,
    update_waiters: Vec<oneshot::Sender<Result<ComponentsUpdateResult>>>,
    status_waiters: Vec<oneshot::Sender<Vec<ComponentStatus>>>,
    queue: VecDeque<CtrlEvent>,
    timer_command: Option<bool>,
    stopping: bool,
}

impl ControllerLoop {
    async fn run(mut self, mut request_rx: mpsc::Receiver<Request>) {
        let mut timer: Pin<Box<Sleep>> = Box::pin(sleep(CONNECTION_TIMEOUT));
        let mut timer_armed = false;

        if self.connections.is_empty() {
            self.queue.push_back(CtrlEvent::AllClientsConnected);
        } else {
            timer_armed = true;
        }

        self.drain_events().await;

        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        None => break,
                        Some(request) => self.handle_request(request).await,
                    }
                }
                _ = timer.as_mut(), if timer_armed => {
                    timer_armed = false;
                    error!("UM clients connection timeout");
                    self.queue.push_back(CtrlEvent::ConnectionTimeout);
                }
            }

            match self.timer_command.take() {
                Some(true) => {
                    timer.as_mut().reset(Instant::now() + CONNECTION_TIMEOUT);
                    timer_armed = true;
                }
                Some(false) => timer_armed = false,
                None => {}
            }

            self.drain_events().await;

            if self.stopping {
                break;
            }
        }

        debug!("Close all UM connections");

        for connection in &mut self.connections {
            if let Some(handler) = connection.handler.take() {
                handler.close().await;
            }
        }

        let result = ComponentsUpdateResult {
            components: self.current_components.clone(),
            error: self.update_error.clone(),
        };

        for waiter in self.update_waiters.drain(..) {
            let _ = waiter.send(Ok(result.clone()));
        }

        for waiter in self.status_waiters.drain(..) {
            let _ = waiter.send(self.current_components.clone());
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::OpenConnection {
                um_id,
                handler,
                status,
            } => self.handle_new_connection(um_id, handler, status).await,

            Request::CloseConnection { um_id } => self.handle_close_connection(um_id),

            Request::StatusUpdate { um_id, status } => {
                if matches!(
                    self.state,
                    CtrlState::PrepareUpdate
                        | CtrlState::StartUpdate
                        | CtrlState::StartApply
                        | CtrlState::StartRevert
                ) {
                    self.queue
                        .push_back(CtrlEvent::UmStateUpdated { um_id, status });
                } else {
                    debug!(um_id = %um_id, state = %self.state, "UM status update ignored");
                }
            }

            Request::UpdateComponents { components, reply } => {
                self.handle_update_components(components, reply);
            }

            Request::GetStatus { reply } => {
                if self.state != CtrlState::Init {
                    let _ = reply.send(self.current_components.clone());
                } else {
                    self.status_waiters.push(reply);
                }
            }

            Request::Stop => self.stopping = true,
        }
    }

    async fn handle_new_connection(
        &mut self,
        um_id: UmId,
        handler: Arc<dyn UmClient>,
        status: UmStatus,
    ) {
        let Some(index) = self
            .connections
            .iter()
            .position(|connection| connection.um_id == um_id)
        else {
            error!(um_id = %um_id, "Unexpected new UM connection");
            handler.close().await;
            return;
        };

        self.update_current_components_status(&status.components);

        if let Some(old_handler) = self.connections[index].handler.take() {
            warn!(um_id = %um_id, "Connection already available");
            old_handler.close().await;
        }

        let connection = &mut self.connections[index];
        connection.handler = Some(handler);
        connection.state = status.um_state;
        connection.components = Vec::new();

        for component in &status.components {
            if !connection.components.contains(&component.id) {
                connection.components.push(component.id.clone());
            }
        }

        if self.connections.iter().any(|connection| connection.handler.is_none()) {
            return;
        }

        debug!("All connections to UMs established");

        self.timer_command = Some(false);

        if let Err(err) = self.load_update_packages_from_storage() {
            error!("Can't read update components from storage: {err}");
        }

        self.queue.push_back(CtrlEvent::AllClientsConnected);
    }

    /// Clears the slot and reverts to the connection-wait state; the update
    /// sequence resumes from the UM state scan once the client returns.
    fn handle_close_connection(&mut self, um_id: UmId) {
        debug!(um_id = %um_id, "Close UM connection");

        let Some(connection) = self
            .connections
            .iter_mut()
            .find(|connection| connection.um_id == um_id)
        else {
            return;
        };

        connection.handler = None;
        self.state = CtrlState::Init;
        self.timer_command = Some(true);
    }

    fn handle_update_components(
        &mut self,
        components: Vec<DesiredComponent>,
        reply: oneshot::Sender<Result<ComponentsUpdateResult>>,
    ) {
        debug!("Update components");

        if self.state == CtrlState::Idle {
            self.update_error = None;

            if components.is_empty() {
                let _ = reply.send(Ok(ComponentsUpdateResult {
                    components: self.current_components.clone(),
                    error: None,
                }));
                return;
            }

            let mut update_info = Vec::new();

            for component in &components {
                let component_status = ComponentStatus {
                    id: component.id.clone(),
                    vendor_version: component.vendor_version.clone(),
                    aos_version: component.aos_version,
                    status: ItemState::Pending,
                    error: String::new(),
                };

                let component_info = SystemComponent {
                    id: component.id.clone(),
                    vendor_version: component.vendor_version.clone(),
                    aos_version: component.aos_version,
                    annotations: component.annotations.clone(),
                    url: component.decrypt.urls.first().cloned().unwrap_or_default(),
                    sha256: component.decrypt.sha256.clone(),
                    sha512: component.decrypt.sha512.clone(),
                    size: component.decrypt.size,
                };

                if let Err(err) = self.add_component_for_update(component_info.clone()) {
                    let _ = reply.send(Err(err));
                    return;
                }

                update_info.push(component_info);
                self.update_component_element(component_status);
            }

            if let Err(err) = self.storage.set_components_update_info(update_info) {
                let _ = reply.send(Err(anyhow!("can't save components update info: {err}")));
                return;
            }

            self.queue.push_back(CtrlEvent::UpdateRequest);
        }

        self.update_waiters.push(reply);
    }

    async fn drain_events(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            self.apply_event(event).await;
        }
    }

    fn target_state(&self, event: &CtrlEvent) -> Option<CtrlState> {
        use CtrlEvent::*;
        use CtrlState::*;

        match (event, self.state) {
            (AllClientsConnected, Init | Fault) => Some(Idle),
            (ConnectionTimeout, Init) => Some(Fault),
            (UpdateRequest | ContinuePrepare, Idle) => Some(PrepareUpdate),
            (ContinueUpdate, Idle) => Some(StartUpdate),
            (ContinueApply, Idle) => Some(StartApply),
            (ContinueRevert, Idle) => Some(StartRevert),
            (
                UmStateUpdated { .. },
                PrepareUpdate | StartUpdate | StartApply | StartRevert,
            ) => Some(self.state),
            (UpdatePrepared, PrepareUpdate) => Some(StartUpdate),
            (SystemUpdated, StartUpdate) => Some(StartApply),
            (ApplyComplete, StartApply) => Some(Idle),
            (UpdateFailed { .. }, PrepareUpdate | StartUpdate | StartApply) => Some(StartRevert),
            (SystemReverted, StartRevert) => Some(Idle),
            _ => None,
        }
    }

    async fn apply_event(&mut self, event: CtrlEvent) {
        let from = self.state;

        let Some(next) = self.target_state(&event) else {
            error!(state = %self.state, event = %event, "Controller event rejected");
            return;
        };

        match &event {
            CtrlEvent::UmStateUpdated { um_id, status } => {
                if let Some(connection) = self
                    .connections
                    .iter_mut()
                    .find(|connection| connection.um_id == *um_id)
                {
                    connection.state = status.um_state;
                    debug!(um_id = %um_id, um_state = %status.um_state, "UM state updated");
                }

                self.update_current_components_status(&status.components);
            }

            CtrlEvent::UpdateFailed { error } => {
                error!("Update error: {error}");

                self.update_error = Some(error.clone());
                self.cleanup_current_component_status();
            }

            CtrlEvent::ApplyComplete => {
                debug!("Update finished");
                self.cleanup_current_component_status();
            }

            CtrlEvent::SystemReverted => {
                debug!("Revert complete");
                self.cleanup_current_component_status();
            }

            _ => {}
        }

        debug!(from = %from, to = %next, event = %event, "Controller state transition");

        self.state = next;

        match next {
            CtrlState::Idle => self.process_idle(),
            CtrlState::PrepareUpdate => self.process_prepare().await,
            CtrlState::StartUpdate => self.process_start_update().await,
            CtrlState::StartApply => self.process_start_apply().await,
            CtrlState::StartRevert => self.process_start_revert().await,
            CtrlState::Init | CtrlState::Fault => {}
        }

        if from == CtrlState::Init && next != CtrlState::Init {
            for waiter in self.status_waiters.drain(..) {
                let _ = waiter.send(self.current_components.clone());
            }
        }
    }

    /// Resumes an interrupted update based on the UM state scan, or settles
    /// the round: clears the persisted plan and answers every waiter.
    fn process_idle(&mut self) {
        match self.scan_um_states() {
            CtrlState::Fault => {
                self.queue.push_back(CtrlEvent::ContinueRevert);
                return;
            }
            CtrlState::PrepareUpdate => {
                self.queue.push_back(CtrlEvent::ContinuePrepare);
                return;
            }
            CtrlState::StartApply => {
                self.queue.push_back(CtrlEvent::ContinueApply);
                return;
            }
            _ => {}
        }

        self.cleanup_update_data();

        let result = ComponentsUpdateResult {
            components: self.current_components.clone(),
            error: self.update_error.clone(),
        };

        for waiter in self.update_waiters.drain(..) {
            let _ = waiter.send(Ok(result.clone()));
        }
    }

    async fn process_prepare(&mut self) {
        for index in 0..self.connections.len() {
            if self.connections[index].update_packages.is_empty() {
                continue;
            }

            match self.connections[index].state {
                UmState::Failed => {
                    self.queue.push_back(CtrlEvent::UpdateFailed {
                        error: format!(
                            "prepare update failure um {}",
                            self.connections[index].um_id
                        ),
                    });
                    return;
                }
                UmState::Prepared | UmState::Updated => continue,
                UmState::Idle => {}
            }

            let Some(handler) = self.connections[index].handler.clone() else {
                warn!(um_id = %self.connections[index].um_id, "Connection to UM closed");
                return;
            };

            let packages = self.connections[index].update_packages.clone();

            match handler.prepare_update(packages).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        um_id = %self.connections[index].um_id,
                        "Prepare update request failed: {err}"
                    );
                }
            }
        }

        self.queue.push_back(CtrlEvent::UpdatePrepared);
    }

    async fn process_start_update(&mut self) {
        debug!("Process start update state");

        for index in 0..self.connections.len() {
            if !self.connections[index].update_packages.is_empty()
                && self.connections[index].state == UmState::Failed
            {
                self.queue.push_back(CtrlEvent::UpdateFailed {
                    error: format!("update failure um {}", self.connections[index].um_id),
                });
                return;
            }

            if self.connections[index].state != UmState::Prepared {
                continue;
            }

            let Some(handler) = self.connections[index].handler.clone() else {
                warn!(um_id = %self.connections[index].um_id, "Connection to UM closed");
                return;
            };

            match handler.start_update().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        um_id = %self.connections[index].um_id,
                        "Start update request failed: {err}"
                    );
                }
            }
        }

        self.queue.push_back(CtrlEvent::SystemUpdated);
    }

    async fn process_start_apply(&mut self) {
        for index in 0..self.connections.len() {
            if !self.connections[index].update_packages.is_empty()
                && self.connections[index].state == UmState::Failed
            {
                self.queue.push_back(CtrlEvent::UpdateFailed {
                    error: format!("apply failure um {}", self.connections[index].um_id),
                });
                return;
            }

            if self.connections[index].state != UmState::Updated {
                continue;
            }

            let Some(handler) = self.connections[index].handler.clone() else {
                warn!(um_id = %self.connections[index].um_id, "Connection to UM closed");
                return;
            };

            match handler.start_apply().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        um_id = %self.connections[index].um_id,
                        "Start apply request failed: {err}"
                    );
                }
            }
        }

        self.queue.push_back(CtrlEvent::ApplyComplete);
    }

    /// Walks every UM that carries packages or failed. A UM that stays
    /// failed after refusing the revert leaves the system for manual
    /// maintenance; the walk never loops back into another revert.
    async fn process_start_revert(&mut self) {
        let mut maintenance_needed = false;

        for index in 0..self.connections.len() {
            let needs_revert = !self.connections[index].update_packages.is_empty()
                || self.connections[index].state == UmState::Failed;

            if !needs_revert || self.connections[index].state == UmState::Idle {
                continue;
            }

            let Some(handler) = self.connections[index].handler.clone() else {
                warn!(um_id = %self.connections[index].um_id, "Connection to UM closed");
                return;
            };

            if self.connections[index].update_packages.is_empty() {
                warn!(
                    um_id = %self.connections[index].um_id,
                    "No update components but UM is in failure state"
                );
            }

            match handler.start_revert().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        um_id = %self.connections[index].um_id,
                        "Start revert request failed: {err}"
                    );

                    if self.connections[index].state == UmState::Failed {
                        maintenance_needed = true;
                    }
                }
            }
        }

        if maintenance_needed {
            error!("UM requires manual maintenance");
            return;
        }

        self.queue.push_back(CtrlEvent::SystemReverted);
    }

    fn scan_um_states(&self) -> CtrlState {
        let mut on_prepare_state = false;
        let mut on_apply_state = false;

        for connection in &self.connections {
            match connection.state {
                UmState::Failed => return CtrlState::Fault,
                UmState::Prepared => on_prepare_state = true,
                UmState::Updated => on_apply_state = true,
                UmState::Idle => {}
            }
        }

        if on_prepare_state {
            return CtrlState::PrepareUpdate;
        }

        if on_apply_state {
            return CtrlState::StartApply;
        }

        CtrlState::Idle
    }

    fn add_component_for_update(&mut self, mut component_info: SystemComponent) -> Result<()> {
        for connection in &mut self.connections {
            if connection
                .components
                .iter()
                .any(|id| *id == component_info.id)
            {
                component_info.url = self
                    .url_translator
                    .translate_url(connection.is_local, &component_info.url)?;

                connection.update_packages.push(component_info);

                return Ok(());
            }
        }

        Err(anyhow!("component id {} not found", component_info.id))
    }

    fn load_update_packages_from_storage(&mut self) -> Result<()> {
        for connection in &mut self.connections {
            connection.update_packages.clear();
        }

        let components = self.storage.components_update_info()?;

        let mut result = Ok(());

        for component in components {
            if let Err(err) = self.add_component_for_update(component) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    fn cleanup_update_data(&mut self) {
        for connection in &mut self.connections {
            connection.update_packages.clear();
        }

        match self.storage.components_update_info() {
            Ok(components) => {
                if components.is_empty() {
                    return;
                }

                if let Err(err) = self.storage.set_components_update_info(Vec::new()) {
                    error!("Can't clean components update info: {err}");
                }
            }
            Err(err) => error!("Can't get components update info: {err}"),
        }
    }

    /// Merges a batch of reported component statuses: a new `installed`
    /// version prunes older installed entries of the same id, while error
    /// entries stay visible alongside.
    fn update_current_components_status(&mut self, statuses: &[ComponentStatus]) {
        debug!("Receive components: {statuses:?}");

        for status in statuses {
            if status.status == ItemState::Installed {
                self.current_components.retain(|current| {
                    !(current.id == status.id
                        && current.status == ItemState::Installed
                        && current.vendor_version != status.vendor_version)
                });
            }

            self.update_component_element(status.clone());
        }
    }

    fn update_component_element(&mut self, component: ComponentStatus) {
        for current in self.current_components.iter_mut() {
            if current.id == component.id && current.vendor_version == component.vendor_version {
                // An installed entry is never downgraded in place; the new
                // status becomes its own descriptor.
                if current.status == ItemState::Installed
                    && component.status != ItemState::Installed
                {
                    break;
                }

                if current.status != component.status {
                    current.status = component.status;
                    current.error = component.error.clone();
                }

                return;
            }
        }

        self.current_components.push(component);
    }

    fn cleanup_current_component_status(&mut self) {
        self.current_components.retain(|component| {
            component.status == ItemState::Installed || component.status == ItemState::Error
        });
    }
}
