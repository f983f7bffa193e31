/// Request routing and slot-table ownership
///
/// One dispatcher task receives every request from every session, resolves
/// the target endpoint through the slot table and hands the request to that
/// endpoint's task runner. The dispatcher is the only writer of the slot
/// table and the sole owner of the runner registry; sessions read the table
/// concurrently through the handle.
use std::sync::Arc;
use std::time::Duration;

use fnv::{FnvHashMap, FnvHashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};

use crate::cluster::topology::{self, ReadPreference};
use crate::cluster::{Endpoint, SlotInfo, SlotTable};
use crate::error::{PorteroError, PorteroResult};
use crate::proxy::pool::BackendPool;
use crate::proxy::runner::TaskRunner;
use crate::proxy::PipelineRequest;

const PERIODIC_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub startup_nodes: Vec<Endpoint>,
    pub read_prefer: ReadPreference,
    /// Minimum gap between two topology reloads
    pub slots_reload_interval: Duration,
    pub request_channel_size: usize,
    pub task_channel_size: usize,
}

/// Cheap clone shared with every session
#[derive(Clone)]
pub struct DispatcherHandle {
    req_tx: mpsc::Sender<PipelineRequest>,
    reload_tx: mpsc::Sender<()>,
    slot_table: Arc<RwLock<SlotTable>>,
}

impl DispatcherHandle {
    pub async fn schedule(&self, req: PipelineRequest) {
        if let Err(rejected) = self.req_tx.send(req).await {
            rejected
                .0
                .respond(Err(PorteroError::backend("dispatcher exited")))
                .await;
        }
    }

    /// Request a topology reload; concurrent requests coalesce into one
    pub fn trigger_reload_slots(&self) {
        let _ = self.reload_tx.try_send(());
    }

    pub async fn write_server(&self, slot: u16) -> Option<Endpoint> {
        self.slot_table.read().await.write_server(slot)
    }

    pub async fn read_server(&self, slot: u16) -> Option<Endpoint> {
        self.slot_table.read().await.read_server(slot)
    }

    /// One representative slot per distinct primary, for fan-out commands
    pub async fn server_slots(&self) -> Vec<u16> {
        self.slot_table.read().await.server_slots()
    }

    #[cfg(test)]
    pub(crate) fn slot_table(&self) -> &Arc<RwLock<SlotTable>> {
        &self.slot_table
    }
}

enum Event {
    Request(Option<PipelineRequest>),
    SlotInfos(Option<Vec<SlotInfo>>),
}

pub struct Dispatcher {
    config: DispatcherConfig,
    pool: Arc<BackendPool>,
    slot_table: Arc<RwLock<SlotTable>>,
    req_rx: mpsc::Receiver<PipelineRequest>,
    reload_rx: Option<mpsc::Receiver<()>>,
    runners: FnvHashMap<Endpoint, TaskRunner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, pool: Arc<BackendPool>) -> (Self, DispatcherHandle) {
        let (req_tx, req_rx) = mpsc::channel(config.request_channel_size);
        // capacity 1: a pending trigger absorbs all further ones
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let slot_table = Arc::new(RwLock::new(SlotTable::new()));
        let dispatcher = Self {
            config,
            pool,
            slot_table: Arc::clone(&slot_table),
            req_rx,
            reload_rx: Some(reload_rx),
            runners: FnvHashMap::default(),
        };
        let handle = DispatcherHandle {
            req_tx,
            reload_tx,
            slot_table,
        };
        (dispatcher, handle)
    }

    /// Load the initial topology; failure here is fatal to startup
    pub async fn init_slot_table(&self) -> PorteroResult<()> {
        let infos = topology::reload_topology(
            &self.pool,
            &self.config.startup_nodes,
            self.config.read_prefer,
        )
        .await?;
        let mut table = self.slot_table.write().await;
        for info in &infos {
            table.set_slot_info(info);
        }
        info!("slot table initialized from {} ranges", infos.len());
        Ok(())
    }

    pub async fn run(mut self) {
        let (info_tx, mut info_rx) = mpsc::channel(1);
        if let Some(reload_rx) = self.reload_rx.take() {
            tokio::spawn(slots_reload_loop(
                reload_rx,
                info_tx,
                Arc::clone(&self.pool),
                self.config.startup_nodes.clone(),
                self.config.read_prefer,
                self.config.slots_reload_interval,
            ));
        }

        loop {
            let event = tokio::select! {
                req = self.req_rx.recv() => Event::Request(req),
                infos = info_rx.recv() => Event::SlotInfos(infos),
            };
            match event {
                Event::Request(Some(req)) => self.dispatch(req).await,
                Event::Request(None) => {
                    info!("exit dispatch loop");
                    return;
                }
                Event::SlotInfos(Some(infos)) => self.apply_slot_infos(infos).await,
                Event::SlotInfos(None) => {}
            }
        }
    }

    async fn dispatch(&mut self, req: PipelineRequest) {
        let endpoint = {
            let table = self.slot_table.read().await;
            if req.read_only {
                table.read_server(req.slot)
            } else {
                table.write_server(req.slot)
            }
        };
        let Some(endpoint) = endpoint else {
            let slot = req.slot;
            req.respond(Err(PorteroError::backend(format!(
                "no server for slot {}",
                slot
            ))))
            .await;
            return;
        };

        let runner = self.runners.entry(endpoint.clone()).or_insert_with(|| {
            info!("create task runner {}", endpoint);
            TaskRunner::spawn(
                endpoint.clone(),
                Arc::clone(&self.pool),
                self.config.task_channel_size,
            )
        });
        runner.schedule(req).await;
    }

    /// Install reloaded slot infos and reconcile runners and pools
    async fn apply_slot_infos(&mut self, infos: Vec<SlotInfo>) {
        {
            let mut table = self.slot_table.write().await;
            for info in &infos {
                table.set_slot_info(info);
            }
        }

        let mut alive: FnvHashSet<Endpoint> = FnvHashSet::default();
        for info in &infos {
            alive.insert(info.write.clone());
            for reader in &info.read {
                alive.insert(reader.clone());
            }
        }

        let stale: Vec<Endpoint> = self
            .runners
            .keys()
            .filter(|endpoint| !alive.contains(*endpoint))
            .cloned()
            .collect();
        for endpoint in stale {
            if let Some(runner) = self.runners.remove(&endpoint) {
                info!("exit unused task runner {}", endpoint);
                runner.exit().await;
            }
        }

        self.pool.reload(&alive);
    }
}

/// Throttled reload driver: on-demand triggers and a 60 s periodic sweep,
/// both gated to at most one reload per `gate`; triggers arriving while
/// the gate is closed are discarded
async fn slots_reload_loop(
    mut reload_rx: mpsc::Receiver<()>,
    info_tx: mpsc::Sender<Vec<SlotInfo>>,
    pool: Arc<BackendPool>,
    startup_nodes: Vec<Endpoint>,
    prefer: ReadPreference,
    gate: Duration,
) {
    loop {
        tokio::select! {
            trigger = reload_rx.recv() => {
                if trigger.is_none() {
                    info!("exit reload slot table loop");
                    return;
                }
                info!("requested reload triggered");
            }
            _ = tokio::time::sleep(PERIODIC_RELOAD_INTERVAL) => {
                info!("periodic reload triggered");
            }
        }

        match topology::reload_topology(&pool, &startup_nodes, prefer).await {
            Ok(infos) => {
                if info_tx.send(infos).await.is_err() {
                    return;
                }
            }
            Err(e) => error!("reload slot table failed: {}", e),
        }

        tokio::time::sleep(gate).await;
        while reload_rx.try_recv().is_ok() {}
    }
}
