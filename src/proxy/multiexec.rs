/// Per-shard MULTI/EXEC execution
///
/// A cross-shard transaction is impossible in Redis Cluster, so a buffered
/// `MULTI`..`EXEC` block is executed as one local transaction per shard:
/// the queued commands are grouped by target endpoint, each group runs as
/// `MULTI` / commands / `EXEC` on a one-shot pooled connection, and the
/// per-command results are stitched back into the client's queueing order.
/// Atomicity holds within each shard only.
use fnv::FnvHashMap;
use futures::future::join_all;
use tracing::warn;

use crate::cluster::{key_to_slot, Endpoint};
use crate::error::{PorteroError, PorteroResult};
use crate::proxy::command::cmd_read_only;
use crate::proxy::dispatcher::DispatcherHandle;
use crate::proxy::pool::BackendPool;
use crate::resp::{Command, RespData};

const EXEC_ABORT_ERR: &str = "EXECABORT Transaction discarded";

/// Run the buffered commands and build the client-visible `EXEC` reply
pub async fn execute(
    cmds: Vec<Command>,
    dispatcher: &DispatcherHandle,
    pool: &BackendPool,
) -> RespData {
    if cmds.is_empty() {
        return RespData::Array(Some(Vec::new()));
    }
    let total = cmds.len();

    // group by target endpoint, remembering each command's queueing position
    let mut groups: FnvHashMap<Endpoint, Vec<(usize, Command)>> = FnvHashMap::default();
    for (position, cmd) in cmds.into_iter().enumerate() {
        let slot = key_to_slot(cmd.arg(1));
        let endpoint = if cmd_read_only(&cmd) {
            dispatcher.read_server(slot).await
        } else {
            dispatcher.write_server(slot).await
        };
        let Some(endpoint) = endpoint else {
            return RespData::error(EXEC_ABORT_ERR);
        };
        groups.entry(endpoint).or_default().push((position, cmd));
    }

    let shard_runs = groups
        .into_iter()
        .map(|(endpoint, group)| execute_on_shard(endpoint, group, pool));
    let mut results: Vec<Option<RespData>> = (0..total).map(|_| None).collect();
    for outcome in join_all(shard_runs).await {
        match outcome {
            Ok(pairs) => {
                for (position, data) in pairs {
                    if let Some(slot) = results.get_mut(position) {
                        *slot = Some(data);
                    }
                }
            }
            Err(e) => {
                warn!("per-shard transaction failed: {}", e);
                return RespData::error(EXEC_ABORT_ERR);
            }
        }
    }

    RespData::Array(Some(
        results
            .into_iter()
            .map(|slot| slot.unwrap_or(RespData::BulkString(None)))
            .collect(),
    ))
}

async fn execute_on_shard(
    endpoint: Endpoint,
    group: Vec<(usize, Command)>,
    pool: &BackendPool,
) -> PorteroResult<Vec<(usize, RespData)>> {
    let mut conn = pool.get(&endpoint).await?;

    let outcome = async {
        conn.request(&Command::from_slice(&["MULTI"])).await?;
        for (_, cmd) in &group {
            // each queues with +QUEUED; an error reply aborts the exchange
            conn.request(cmd).await?;
        }
        let reply = conn.request(&Command::from_slice(&["EXEC"])).await?;
        let RespData::Array(Some(elements)) = reply else {
            return Err(PorteroError::backend(format!(
                "EXEC reply from {} is not an array",
                conn.endpoint()
            )));
        };
        if elements.len() != group.len() {
            return Err(PorteroError::backend(format!(
                "EXEC reply arity mismatch from {}",
                conn.endpoint()
            )));
        }
        Ok(group
            .iter()
            .map(|(position, _)| *position)
            .zip(elements)
            .collect())
    }
    .await;

    if outcome.is_err() {
        conn.mark_unusable();
    }
    pool.put(conn).await;
    outcome
}
