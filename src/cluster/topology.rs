/// Cluster topology discovery
///
/// The slot layout comes from `CLUSTER SLOTS`; `CLUSTER NODES` supplies the
/// liveness flags used to drop failed replicas from the read candidates.
/// Filtering by read preference happens here, at reload time, so per-request
/// routing stays a plain table lookup.
use fnv::FnvHashSet;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::cluster::{Endpoint, SlotInfo};
use crate::error::{PorteroError, PorteroResult};
use crate::proxy::pool::BackendPool;
use crate::resp::{Command, RespData};
use crate::utils;

/// Where read-only commands are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    /// Always read from the primary
    Master,
    /// Read from any live replica, falling back to the primary
    Slave,
    /// Read from a live replica in the same IDC (same first two octets),
    /// falling back to the primary
    SlaveIdc,
}

impl ReadPreference {
    pub fn send_readonly(self) -> bool {
        self != ReadPreference::Master
    }
}

impl TryFrom<u8> for ReadPreference {
    type Error = PorteroError;

    fn try_from(value: u8) -> PorteroResult<Self> {
        match value {
            0 => Ok(ReadPreference::Master),
            1 => Ok(ReadPreference::Slave),
            2 => Ok(ReadPreference::SlaveIdc),
            other => Err(PorteroError::topology(format!(
                "invalid read preference: {}",
                other
            ))),
        }
    }
}

/// Query the cluster topology, trying startup nodes in random order
///
/// The first node that answers both `CLUSTER SLOTS` and `CLUSTER NODES`
/// wins. Fails only when every startup node fails.
pub async fn reload_topology(
    pool: &BackendPool,
    startup_nodes: &[Endpoint],
    prefer: ReadPreference,
) -> PorteroResult<Vec<SlotInfo>> {
    let mut nodes = startup_nodes.to_vec();
    nodes.shuffle(&mut rand::thread_rng());

    let mut last_err = PorteroError::topology("no startup nodes configured");
    for node in &nodes {
        match query_node(pool, node, prefer).await {
            Ok(infos) => return Ok(infos),
            Err(e) => {
                warn!("topology query via {} failed: {}", node, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn query_node(
    pool: &BackendPool,
    node: &Endpoint,
    prefer: ReadPreference,
) -> PorteroResult<Vec<SlotInfo>> {
    let mut conn = pool.get(node).await?;
    info!("querying cluster topology from {}", node);

    let result = async {
        let slots_reply = conn.request(&Command::from_slice(&["CLUSTER", "SLOTS"])).await?;
        let mut infos = parse_cluster_slots(&slots_reply)?;

        let nodes_reply = conn.request(&Command::from_slice(&["CLUSTER", "NODES"])).await?;
        let text = nodes_reply
            .bulk_str()
            .ok_or_else(|| PorteroError::topology("CLUSTER NODES reply is not a bulk string"))?;
        let alive = parse_alive_nodes(text);

        apply_read_preference(&mut infos, &alive, prefer);
        Ok(infos)
    }
    .await;

    if result.is_err() {
        conn.mark_unusable();
    }
    pool.put(conn).await;
    result
}

/// Parse a `CLUSTER SLOTS` reply into slot infos
///
/// Each entry is `[start, end, [master ip, port, ...], [replica ip, port, ...]...]`.
pub fn parse_cluster_slots(data: &RespData) -> PorteroResult<Vec<SlotInfo>> {
    let entries = match data {
        RespData::Array(Some(entries)) => entries,
        other => {
            return Err(PorteroError::topology(format!(
                "CLUSTER SLOTS reply is not an array: {:?}",
                other
            )))
        }
    };

    let mut infos = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = match entry {
            RespData::Array(Some(fields)) if fields.len() >= 3 => fields,
            other => {
                return Err(PorteroError::topology(format!(
                    "malformed CLUSTER SLOTS entry: {:?}",
                    other
                )))
            }
        };

        let start = slot_number(&fields[0])?;
        let end = slot_number(&fields[1])?;
        let write = node_endpoint(&fields[2])?;
        let mut read = Vec::new();
        for replica in &fields[3..] {
            read.push(node_endpoint(replica)?);
        }
        infos.push(SlotInfo {
            start,
            end,
            write,
            read,
        });
    }
    Ok(infos)
}

fn slot_number(data: &RespData) -> PorteroResult<u16> {
    match data {
        RespData::Integer(n) if (0..16384).contains(n) => Ok(*n as u16),
        other => Err(PorteroError::topology(format!(
            "invalid slot number: {:?}",
            other
        ))),
    }
}

fn node_endpoint(data: &RespData) -> PorteroResult<Endpoint> {
    match data {
        RespData::Array(Some(fields)) if fields.len() >= 2 => {
            let ip = fields[0]
                .bulk_str()
                .ok_or_else(|| PorteroError::topology("node ip is not a bulk string"))?;
            let port = match &fields[1] {
                RespData::Integer(port) => *port,
                other => {
                    return Err(PorteroError::topology(format!(
                        "node port is not an integer: {:?}",
                        other
                    )))
                }
            };
            Ok(format!("{}:{}", ip, port))
        }
        other => Err(PorteroError::topology(format!(
            "malformed node entry: {:?}",
            other
        ))),
    }
}

/// Endpoints whose `CLUSTER NODES` flags field does not contain `fail`
///
/// Lines look like
/// `305fa5... 10.4.17.164:7704@17704 slave 305f... 0 1440042315188 2 connected`;
/// only the address and flags fields matter here.
pub fn parse_alive_nodes(text: &str) -> FnvHashSet<Endpoint> {
    let mut alive = FnvHashSet::default();
    for line in text.trim().lines() {
        let mut fields = line.split_whitespace();
        let (Some(_id), Some(addr), Some(flags)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if flags.contains("fail") {
            warn!("node marked failing: {}", addr);
            continue;
        }
        // strip the cluster bus port suffix (addr@cport)
        let endpoint = addr.split('@').next().unwrap_or(addr);
        alive.insert(endpoint.to_string());
    }
    alive
}

/// Rewrite each info's read candidates according to the read preference
pub fn apply_read_preference(
    infos: &mut [SlotInfo],
    alive: &FnvHashSet<Endpoint>,
    prefer: ReadPreference,
) {
    let idc_prefix = match prefer {
        ReadPreference::SlaveIdc => utils::local_ip().and_then(utils::idc_prefix),
        _ => None,
    };

    for info in infos {
        if prefer == ReadPreference::Master {
            info.read = vec![info.write.clone()];
            continue;
        }

        let mut candidates = Vec::new();
        for node in &info.read {
            if !alive.contains(node) {
                info!("dropping read candidate {}: not alive", node);
                continue;
            }
            if let Some(prefix) = &idc_prefix {
                if !node.starts_with(prefix.as_str()) {
                    info!("dropping read candidate {}: outside local IDC", node);
                    continue;
                }
            }
            candidates.push(node.clone());
        }
        if candidates.is_empty() {
            candidates.push(info.write.clone());
        }
        info.read = candidates;
    }
}
