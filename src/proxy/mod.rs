/// The proxy core: classification, dispatch, backend pipelines and sessions
pub mod command;
pub mod dispatcher;
pub mod multiexec;
pub mod multikey;
pub mod pool;
pub mod redirect;
pub mod runner;
pub mod session;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::PorteroError;
use crate::proxy::dispatcher::DispatcherHandle;
use crate::proxy::multikey::MultiCmd;
use crate::proxy::pool::BackendPool;
use crate::resp::Command;

/// Shared collaborators handed to every session
pub struct ProxyContext {
    pub dispatcher: DispatcherHandle,
    pub pool: Arc<BackendPool>,
    /// Shared secret clients must present via AUTH; `None` disables auth
    pub password: Option<String>,
}

/// One command on its way to a backend
///
/// `seq` is the per-session request ordinal; sub-requests of a split
/// multi-key command share one `seq` and are told apart by `sub_seq`.
/// Every request carries a clone of its session's reply channel: the
/// session's writer loop keeps running until the last outstanding clone is
/// gone, which is what makes closing race-free.
#[derive(Debug)]
pub struct PipelineRequest {
    pub cmd: Command,
    pub slot: u16,
    pub read_only: bool,
    pub seq: u64,
    pub sub_seq: usize,
    pub parent: Option<Arc<Mutex<MultiCmd>>>,
    pub back_q: mpsc::Sender<PipelineResponse>,
}

impl PipelineRequest {
    /// Consume the request into its response, delivering it to the session
    pub async fn respond(self, result: Result<Bytes, PorteroError>) {
        let back_q = self.back_q.clone();
        // the session may already be gone; that is not our problem here
        let _ = back_q.send(PipelineResponse { ctx: self, result }).await;
    }
}

/// A backend reply (or synthesized error) bound for one request
#[derive(Debug)]
pub struct PipelineResponse {
    pub ctx: PipelineRequest,
    pub result: Result<Bytes, PorteroError>,
}
