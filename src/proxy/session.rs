/// Per-client session: parse, classify, dispatch, reorder, redirect
///
/// Two loops share one reply channel. The reader loop parses commands,
/// classifies them and either answers locally or dispatches pipeline
/// requests; the writer loop restores pipeline order with a min-heap keyed
/// on the request ordinal, follows MOVED/ASK redirections, coalesces
/// multi-key aggregates and writes the bytes to the client.
///
/// Closing is driven by channel ownership: every outstanding request holds
/// a clone of the reply sender, so the writer loop's `recv` only ends once
/// the reader has exited *and* the last in-flight request was answered.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PorteroError, PorteroResult};
use crate::cluster::key_to_slot;
use crate::proxy::command::{cmd_auth_required, cmd_read_all, cmd_read_only, cmd_unknown};
use crate::proxy::multikey::{self, scan_cursor_key, MultiCmd, ScanCursorMap};
use crate::proxy::redirect::{self, Redirection};
use crate::proxy::{multiexec, PipelineRequest, PipelineResponse, ProxyContext};
use crate::resp::{read_command, read_data, read_data_bytes, Command, RespData};

const AUTH_CMD_ERR: &str = "ERR invalid password";
const UNKNOWN_CMD_ERR: &str = "ERR unknown command";
const ARGUMENTS_ERR: &str = "ERR wrong number of arguments";
const NOAUTH_ERR: &str = "NOAUTH Authentication required.";
const NESTED_MULTI_ERR: &str = "ERR MULTI calls can not be nested";

const MOVED_PREFIX: &[u8] = b"-MOVED ";
const ASK_PREFIX: &[u8] = b"-ASK ";

const BACK_QUEUE_SIZE: usize = 1000;

pub struct Session {
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
    authed: bool,
    req_seq: u64,
    /// Commands queued between MULTI and EXEC
    multi_cmds: Option<Vec<Command>>,
    scan_cursors: ScanCursorMap,
    back_q: mpsc::Sender<PipelineResponse>,
}

impl Session {
    /// Serve one client connection to completion
    pub async fn run(stream: TcpStream, ctx: Arc<ProxyContext>) {
        let peer = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("client vanished before the session started: {}", e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to configure client stream: {}", e);
        }
        let (read_half, write_half) = stream.into_split();

        let (back_tx, back_rx) = mpsc::channel(BACK_QUEUE_SIZE);
        let scan_cursors: ScanCursorMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = SessionWriter {
            ctx: Arc::clone(&ctx),
            scan_cursors: Arc::clone(&scan_cursors),
            rsp_seq: 0,
            heap: BinaryHeap::new(),
        };
        let writer_task = tokio::spawn(writer.run(back_rx, write_half));

        let mut session = Session {
            ctx,
            peer,
            authed: false,
            req_seq: 0,
            multi_cmds: None,
            scan_cursors,
            back_q: back_tx,
        };
        session.reading_loop(BufReader::new(read_half)).await;

        // dropping the session drops its reply sender; the writer finishes
        // once every outstanding request has been answered
        drop(session);
        let _ = writer_task.await;
        info!("close session {}", peer);
    }

    async fn reading_loop(&mut self, mut reader: BufReader<OwnedReadHalf>) {
        loop {
            let mut cmd = match read_command(&mut reader).await {
                Ok(cmd) => cmd,
                Err(e) => {
                    if !e.is_eof() {
                        debug!("session {} read error: {}", self.peer, e);
                    }
                    return;
                }
            };
            cmd.args[0].make_ascii_uppercase();
            if cmd.args.len() > 1 {
                debug!("access {} {} {}", self.peer, cmd.name(), cmd.arg(1));
            } else {
                debug!("access {} {}", self.peer, cmd.name());
            }
            self.handle_command(cmd).await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        if cmd_auth_required(&cmd) && !self.check_auth() {
            self.reply_local(RespData::error(NOAUTH_ERR)).await;
            return;
        }

        // inside MULTI everything except EXEC/MULTI is queued verbatim
        if self.multi_cmds.is_some() && cmd.name() != "EXEC" && cmd.name() != "MULTI" {
            if let Some(buffer) = self.multi_cmds.as_mut() {
                buffer.push(cmd);
            }
            self.reply_local(RespData::SimpleString("QUEUED".to_string()))
                .await;
            return;
        }

        match cmd.name() {
            "AUTH" => self.handle_auth(&cmd).await,
            "SELECT" => self.reply_local(RespData::ok()).await,
            "PING" => {
                self.reply_local(RespData::SimpleString("PONG".to_string()))
                    .await
            }
            "MULTI" => {
                if self.multi_cmds.is_some() {
                    self.reply_local(RespData::error(NESTED_MULTI_ERR)).await;
                } else {
                    self.multi_cmds = Some(Vec::new());
                    self.reply_local(RespData::ok()).await;
                }
            }
            "EXEC" if self.multi_cmds.is_some() => self.handle_exec().await,
            _ if cmd_unknown(&cmd) => self.reply_local(RespData::error(UNKNOWN_CMD_ERR)).await,
            _ if cmd_read_all(&cmd) => self.handle_read_all(cmd).await,
            _ => match multikey::multi_key_count(&cmd) {
                Some(num_keys) if num_keys > 1 => self.handle_multi_key(cmd, num_keys).await,
                _ => self.handle_general(cmd).await,
            },
        }
    }

    fn check_auth(&self) -> bool {
        self.authed || self.ctx.password.is_none()
    }

    async fn handle_auth(&mut self, cmd: &Command) {
        let reply = if cmd.args.len() != 2 {
            RespData::error(ARGUMENTS_ERR)
        } else if self.ctx.password.as_deref() == Some(cmd.arg(1)) {
            self.authed = true;
            RespData::ok()
        } else {
            RespData::error(AUTH_CMD_ERR)
        };
        self.reply_local(reply).await;
    }

    /// One keyed command, one backend
    async fn handle_general(&mut self, cmd: Command) {
        let slot = key_to_slot(cmd.arg(1));
        let read_only = cmd_read_only(&cmd);
        let seq = self.next_seq();
        let req = PipelineRequest {
            cmd,
            slot,
            read_only,
            seq,
            sub_seq: 0,
            parent: None,
            back_q: self.back_q.clone(),
        };
        self.ctx.dispatcher.schedule(req).await;
    }

    /// Split MGET/MSET/DEL into one sub-request per key
    async fn handle_multi_key(&mut self, cmd: Command, num_keys: usize) {
        if cmd.name() == "MSET" && (cmd.args.len() - 1) % 2 != 0 {
            self.reply_local(RespData::error(ARGUMENTS_ERR)).await;
            return;
        }
        let read_only = cmd_read_only(&cmd);
        let seq = self.next_seq();
        let parent = Arc::new(Mutex::new(MultiCmd::new(cmd.clone(), num_keys)));
        for sub_seq in 0..num_keys {
            let Some(sub) = multikey::sub_command(&cmd, sub_seq) else {
                continue;
            };
            let slot = key_to_slot(sub.arg(1));
            let req = PipelineRequest {
                cmd: sub,
                slot,
                read_only,
                seq,
                sub_seq,
                parent: Some(Arc::clone(&parent)),
                back_q: self.back_q.clone(),
            };
            self.ctx.dispatcher.schedule(req).await;
        }
    }

    /// Fan a command out across every primary
    async fn handle_read_all(&mut self, cmd: Command) {
        let slots = self.ctx.dispatcher.server_slots().await;
        if slots.is_empty() {
            self.reply_local(RespData::error("ERR no cluster topology available"))
                .await;
            return;
        }

        // SCAN resumes each primary from the cursor saved for the client's
        // cursor; the saved map is consumed here
        let cursors = if cmd.name() == "SCAN" {
            self.scan_cursors
                .lock()
                .unwrap()
                .remove(&scan_cursor_key(cmd.arg(1)))
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        let seq = self.next_seq();
        let parent = Arc::new(Mutex::new(MultiCmd::new(cmd.clone(), slots.len())));
        for (sub_seq, slot) in slots.into_iter().enumerate() {
            let sub = multikey::read_all_sub_command(&cmd, sub_seq, &cursors);
            let req = PipelineRequest {
                cmd: sub,
                slot,
                read_only: true,
                seq,
                sub_seq,
                parent: Some(Arc::clone(&parent)),
                back_q: self.back_q.clone(),
            };
            self.ctx.dispatcher.schedule(req).await;
        }
    }

    /// Run the buffered transaction off the reader loop so later pipelined
    /// commands are not stalled behind it
    async fn handle_exec(&mut self) {
        let cmds = self.multi_cmds.take().unwrap_or_default();
        let seq = self.next_seq();
        let ctx = Arc::clone(&self.ctx);
        let back_q = self.back_q.clone();
        tokio::spawn(async move {
            let reply = multiexec::execute(cmds, &ctx.dispatcher, &ctx.pool).await;
            local_request(seq, back_q)
                .respond(Ok(reply.to_bytes()))
                .await;
        });
    }

    /// Emit a proxy-generated reply through the ordered pipeline
    async fn reply_local(&mut self, data: RespData) {
        let seq = self.next_seq();
        local_request(seq, self.back_q.clone())
            .respond(Ok(data.to_bytes()))
            .await;
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.req_seq;
        self.req_seq += 1;
        seq
    }
}

fn local_request(seq: u64, back_q: mpsc::Sender<PipelineResponse>) -> PipelineRequest {
    PipelineRequest {
        cmd: Command { args: Vec::new() },
        slot: 0,
        read_only: false,
        seq,
        sub_seq: 0,
        parent: None,
        back_q,
    }
}

/// Min-heap entry ordered by request ordinal
struct SeqOrdered(PipelineResponse);

impl PartialEq for SeqOrdered {
    fn eq(&self, other: &Self) -> bool {
        self.0.ctx.seq == other.0.ctx.seq
    }
}
impl Eq for SeqOrdered {}
impl PartialOrd for SeqOrdered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SeqOrdered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.ctx.seq.cmp(&other.0.ctx.seq)
    }
}

struct SessionWriter {
    ctx: Arc<ProxyContext>,
    scan_cursors: ScanCursorMap,
    rsp_seq: u64,
    heap: BinaryHeap<Reverse<SeqOrdered>>,
}

impl SessionWriter {
    async fn run(
        mut self,
        mut back_rx: mpsc::Receiver<PipelineResponse>,
        mut write_half: OwnedWriteHalf,
    ) {
        while let Some(rsp) = back_rx.recv().await {
            if let Err(e) = self.handle_pipeline(rsp, &mut write_half).await {
                debug!("session write error: {}", e);
                // shutting down the write side nudges the client (and with
                // it our reader loop) toward closing; keep draining so
                // outstanding requests settle
                let _ = write_half.shutdown().await;
                while back_rx.recv().await.is_some() {}
                return;
            }
        }
    }

    /// Emit in-order replies; park everything that arrives early
    async fn handle_pipeline(
        &mut self,
        rsp: PipelineResponse,
        write_half: &mut OwnedWriteHalf,
    ) -> PorteroResult<()> {
        if rsp.ctx.seq != self.rsp_seq {
            self.heap.push(Reverse(SeqOrdered(rsp)));
            return Ok(());
        }
        self.handle_rsp(rsp, write_half).await?;
        loop {
            let ready = matches!(
                self.heap.peek(),
                Some(Reverse(top)) if top.0.ctx.seq == self.rsp_seq
            );
            if !ready {
                return Ok(());
            }
            if let Some(Reverse(next)) = self.heap.pop() {
                self.handle_rsp(next.0, write_half).await?;
            }
        }
    }

    async fn handle_rsp(
        &mut self,
        rsp: PipelineResponse,
        write_half: &mut OwnedWriteHalf,
    ) -> PorteroResult<()> {
        let PipelineResponse { ctx, result } = rsp;

        // a backend failure still produces a reply at this pipeline
        // position, and the stale topology is queued for a refresh
        let result = match result {
            Ok(raw) if raw.starts_with(MOVED_PREFIX) || raw.starts_with(ASK_PREFIX) => {
                match redirect::parse_redirect_raw(&raw) {
                    Some(redirection) => {
                        if !redirection.is_ask {
                            self.ctx.dispatcher.trigger_reload_slots();
                        }
                        self.redirect(&ctx.cmd, &redirection).await
                    }
                    None => Ok(raw),
                }
            }
            Ok(raw) => Ok(raw),
            Err(e) => {
                self.ctx.dispatcher.trigger_reload_slots();
                Err(e)
            }
        };

        match &ctx.parent {
            Some(parent) => {
                let finished = parent
                    .lock()
                    .unwrap()
                    .on_sub_finished(ctx.sub_seq, result);
                if !finished {
                    return Ok(());
                }
                let (cmd, results) = parent.lock().unwrap().take();
                let buf = multikey::coalesce(&cmd, results, &self.scan_cursors).await;
                self.rsp_seq += 1;
                write_half.write_all(&buf).await?;
            }
            None => {
                let buf = match result {
                    Ok(raw) => raw,
                    Err(e) => RespData::error(e.resp_message()).to_bytes(),
                };
                self.rsp_seq += 1;
                write_half.write_all(&buf).await?;
            }
        }
        Ok(())
    }

    /// Re-execute a command once against the endpoint a redirection named
    async fn redirect(&self, cmd: &Command, redirection: &Redirection) -> PorteroResult<Bytes> {
        debug!(
            "redirecting {} to {} (ask: {})",
            cmd.name(),
            redirection.target,
            redirection.is_ask
        );
        let mut conn = self.ctx.pool.get(&redirection.target).await?;

        let outcome: PorteroResult<Bytes> = async {
            let (read_half, mut write_half) = conn.split();
            let mut reader = BufReader::new(read_half);
            if redirection.is_ask {
                write_half.write_all(redirect::ASKING_CMD_BYTES).await?;
            }
            write_half.write_all(&cmd.to_bytes()).await?;
            if redirection.is_ask {
                // the ASKING acknowledgment is not part of the client reply
                read_data(&mut reader).await?;
            }
            let mut buf = BytesMut::new();
            read_data_bytes(&mut reader, &mut buf).await?;
            Ok(buf.freeze())
        }
        .await;

        if outcome.is_err() {
            conn.mark_unusable();
        }
        self.ctx.pool.put(conn).await;
        outcome.map_err(|e| PorteroError::redirect(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ReadPreference, SlotInfo};
    use crate::proxy::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::proxy::pool::{BackendPool, PoolConfig};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    type Handler = Arc<dyn Fn(&Command) -> Vec<u8> + Send + Sync>;

    /// A scripted backend: one handler decides the reply for each command
    async fn spawn_backend(handler: Handler) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    while let Ok(cmd) = crate::resp::read_command(&mut reader).await {
                        let reply = handler(&cmd);
                        if write_half.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn bulk_reply(value: &str) -> Vec<u8> {
        format!("${}\r\n{}\r\n", value.len(), value).into_bytes()
    }

    struct TestProxy {
        ctx: Arc<ProxyContext>,
    }

    impl TestProxy {
        async fn new(password: Option<&str>) -> Self {
            let pool = Arc::new(
                BackendPool::new(PoolConfig {
                    init_cap: 0,
                    max_idle: 4,
                    idle_timeout: Duration::from_secs(60),
                    connect_timeout: Duration::from_secs(1),
                    password: None,
                    send_readonly: false,
                })
                .unwrap(),
            );
            let (dispatcher, handle) = Dispatcher::new(
                DispatcherConfig {
                    startup_nodes: vec!["127.0.0.1:1".to_string()],
                    read_prefer: ReadPreference::Master,
                    slots_reload_interval: Duration::from_secs(3),
                    request_channel_size: 128,
                    task_channel_size: 128,
                },
                Arc::clone(&pool),
            );
            tokio::spawn(dispatcher.run());
            Self {
                ctx: Arc::new(ProxyContext {
                    dispatcher: handle,
                    pool,
                    password: password.map(str::to_string),
                }),
            }
        }

        async fn set_slots(&self, ranges: &[(u16, u16, &str)]) {
            let table = self.ctx.dispatcher.slot_table();
            let mut table = table.write().await;
            for (start, end, endpoint) in ranges {
                table.set_slot_info(&SlotInfo {
                    start: *start,
                    end: *end,
                    write: endpoint.to_string(),
                    read: vec![],
                });
            }
        }

        /// Open a client connection served by a fresh session
        async fn connect(&self) -> TcpStream {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                Session::run(stream, ctx).await;
            });
            TcpStream::connect(addr).await.unwrap()
        }
    }

    async fn roundtrip(client: &mut TcpStream, request: &[u8]) -> Bytes {
        client.write_all(request).await.unwrap();
        read_one(client).await
    }

    async fn read_one(client: &mut TcpStream) -> Bytes {
        let (read_half, _) = client.split();
        let mut reader = BufReader::new(read_half);
        let mut buf = BytesMut::new();
        read_data_bytes(&mut reader, &mut buf).await.unwrap();
        buf.freeze()
    }

    #[tokio::test]
    async fn test_ping_select_and_unknown_are_local() {
        let proxy = TestProxy::new(None).await;
        let mut client = proxy.connect().await;

        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(&reply[..], b"+PONG\r\n");

        let reply = roundtrip(&mut client, b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n").await;
        assert_eq!(&reply[..], b"+OK\r\n");

        let reply = roundtrip(&mut client, b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nch\r\n").await;
        assert_eq!(&reply[..], b"-ERR unknown command\r\n");

        // the connection survives a refused command
        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(&reply[..], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_inline_command() {
        let proxy = TestProxy::new(None).await;
        let mut client = proxy.connect().await;
        let reply = roundtrip(&mut client, b"PING\r\n").await;
        assert_eq!(&reply[..], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_auth_flow() {
        let proxy = TestProxy::new(Some("sesame")).await;
        let mut client = proxy.connect().await;

        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(&reply[..], b"-NOAUTH Authentication required.\r\n");

        let reply = roundtrip(&mut client, b"*2\r\n$4\r\nAUTH\r\n$5\r\nwrong\r\n").await;
        assert_eq!(&reply[..], b"-ERR invalid password\r\n");

        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nAUTH\r\n").await;
        assert_eq!(&reply[..], b"-ERR wrong number of arguments\r\n");

        let reply = roundtrip(&mut client, b"*2\r\n$4\r\nAUTH\r\n$6\r\nsesame\r\n").await;
        assert_eq!(&reply[..], b"+OK\r\n");

        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(&reply[..], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_simple_get_forwarded() {
        let backend = spawn_backend(Arc::new(|cmd| {
            assert_eq!(cmd.name(), "GET");
            bulk_reply("bar")
        }))
        .await;
        let proxy = TestProxy::new(None).await;
        proxy.set_slots(&[(0, 16383, &backend)]).await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").await;
        assert_eq!(&reply[..], b"$3\r\nbar\r\n");
    }

    #[tokio::test]
    async fn test_mget_split_and_coalesced_in_key_order() {
        // every key is answered with its own name so order is observable
        let echo: Handler = Arc::new(|cmd| bulk_reply(cmd.arg(1)));
        let backend_a = spawn_backend(Arc::clone(&echo)).await;
        let backend_b = spawn_backend(echo).await;

        let proxy = TestProxy::new(None).await;
        // keys a (15495), b (3300), c (7365): spread over both backends
        proxy
            .set_slots(&[(0, 8191, &backend_a), (8192, 16383, &backend_b)])
            .await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(
            &mut client,
            b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n",
        )
        .await;
        assert_eq!(&reply[..], b"*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
    }

    #[tokio::test]
    async fn test_del_split_sums_counts() {
        let counting: Handler = Arc::new(|cmd| {
            assert_eq!(cmd.name(), "DEL");
            b":1\r\n".to_vec()
        });
        let backend = spawn_backend(counting).await;
        let proxy = TestProxy::new(None).await;
        proxy.set_slots(&[(0, 16383, &backend)]).await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(
            &mut client,
            b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n",
        )
        .await;
        assert_eq!(&reply[..], b":2\r\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_order_restored_under_slow_backend() {
        // backend a answers slowly, backend b instantly; the client must
        // still see replies in request order
        let slow: Handler = Arc::new(|cmd| {
            std::thread::sleep(Duration::from_millis(100));
            bulk_reply(cmd.arg(1))
        });
        let fast: Handler = Arc::new(|cmd| bulk_reply(cmd.arg(1)));
        let backend_slow = spawn_backend(slow).await;
        let backend_fast = spawn_backend(fast).await;

        let proxy = TestProxy::new(None).await;
        // slot of "a" is 15495 (slow backend), slot of "b" is 3300 (fast)
        proxy
            .set_slots(&[(0, 8191, &backend_fast), (8192, 16383, &backend_slow)])
            .await;

        let mut client = proxy.connect().await;
        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nGET\r\n$1\r\nb\r\n")
            .await
            .unwrap();

        let (read_half, _) = client.split();
        let mut reader = BufReader::new(read_half);
        let mut first = BytesMut::new();
        read_data_bytes(&mut reader, &mut first).await.unwrap();
        let mut second = BytesMut::new();
        read_data_bytes(&mut reader, &mut second).await.unwrap();

        assert_eq!(&first[..], b"$1\r\na\r\n");
        assert_eq!(&second[..], b"$1\r\nb\r\n");
    }

    #[tokio::test]
    async fn test_moved_redirection_is_followed() {
        let target = spawn_backend(Arc::new(|cmd| {
            assert_eq!(cmd.name(), "SET");
            b"+OK\r\n".to_vec()
        }))
        .await;
        let moved = format!("-MOVED 5798 {}\r\n", target).into_bytes();
        let origin = spawn_backend(Arc::new(move |_| moved.clone())).await;

        let proxy = TestProxy::new(None).await;
        proxy.set_slots(&[(0, 16383, &origin)]).await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
        )
        .await;
        assert_eq!(&reply[..], b"+OK\r\n");
    }

    #[tokio::test]
    async fn test_ask_redirection_sends_asking_first() {
        let target = spawn_backend(Arc::new(|cmd| match cmd.name() {
            "ASKING" => b"+OK\r\n".to_vec(),
            "GET" => bulk_reply("v"),
            other => panic!("unexpected command {}", other),
        }))
        .await;
        let ask = format!("-ASK 5798 {}\r\n", target).into_bytes();
        let origin = spawn_backend(Arc::new(move |_| ask.clone())).await;

        let proxy = TestProxy::new(None).await;
        proxy.set_slots(&[(0, 16383, &origin)]).await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
        assert_eq!(&reply[..], b"$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn test_multi_exec_buffers_and_replies() {
        let backend = spawn_backend(Arc::new(|cmd| match cmd.name() {
            "MULTI" => b"+OK\r\n".to_vec(),
            "EXEC" => b"*1\r\n+OK\r\n".to_vec(),
            _ => b"+QUEUED\r\n".to_vec(),
        }))
        .await;
        let proxy = TestProxy::new(None).await;
        proxy.set_slots(&[(0, 16383, &backend)]).await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(&mut client, b"*1\r\n$5\r\nMULTI\r\n").await;
        assert_eq!(&reply[..], b"+OK\r\n");

        let reply = roundtrip(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
        )
        .await;
        assert_eq!(&reply[..], b"+QUEUED\r\n");

        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nEXEC\r\n").await;
        assert_eq!(&reply[..], b"*1\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn test_backend_error_becomes_resp_error() {
        let proxy = TestProxy::new(None).await;
        // route the whole keyspace to a dead endpoint
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);
        proxy.set_slots(&[(0, 16383, &dead)]).await;

        let mut client = proxy.connect().await;
        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
        assert_eq!(reply[0], b'-');

        // the session survives to serve local commands
        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(&reply[..], b"+PONG\r\n");
    }
}
