/// Per-backend pipelined task runner
///
/// One runner owns the single TCP conversation with one backend. Requests
/// enter through the `in` channel, are written to the socket and appended
/// to `inflight`; a dedicated reader task streams raw replies back through
/// the `out` channel and the coordinator pops the `inflight` head for each.
/// Only the coordinator touches `inflight`, so the i-th reply always meets
/// the i-th request.
///
/// Any read or write error fails every inflight request with a synthesized
/// error reply and rebuilds the connection on a fresh `out` channel, so a
/// reply from a dead conversation can never reach a post-recovery request.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::Endpoint;
use crate::error::{PorteroError, PorteroResult};
use crate::proxy::pool::BackendPool;
use crate::proxy::PipelineRequest;
use crate::resp::read_data_bytes;

const RECOVER_PAUSE: Duration = Duration::from_millis(100);

pub enum RunnerMsg {
    Request(PipelineRequest),
    /// Drain `inflight`, close the connection, stop
    Close,
}

/// Handle to a spawned runner; owned by the dispatcher
pub struct TaskRunner {
    endpoint: Endpoint,
    in_tx: mpsc::Sender<RunnerMsg>,
    // kept so tests can await runner teardown; the task itself is detached
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl TaskRunner {
    pub fn spawn(endpoint: Endpoint, pool: Arc<BackendPool>, channel_size: usize) -> Self {
        let (in_tx, in_rx) = mpsc::channel(channel_size);
        // never polled until a real connection installs a live reader
        let (_dead_tx, out_rx) = mpsc::channel(1);
        let state = RunnerState {
            endpoint: endpoint.clone(),
            pool,
            channel_size,
            inflight: VecDeque::new(),
            writer: None,
            reader_task: None,
            out_rx,
            closed: false,
        };
        let handle = tokio::spawn(state.run(in_rx));
        Self {
            endpoint,
            in_tx,
            handle,
        }
    }

    pub async fn schedule(&self, req: PipelineRequest) {
        if let Err(rejected) = self.in_tx.send(RunnerMsg::Request(req)).await {
            if let RunnerMsg::Request(req) = rejected.0 {
                warn!("task runner for {} is gone, failing request", self.endpoint);
                req.respond(Err(PorteroError::backend("task runner exited")))
                    .await;
            }
        }
    }

    /// Request shutdown; the runner drains `inflight` first
    pub async fn exit(&self) {
        let _ = self.in_tx.send(RunnerMsg::Close).await;
    }

    #[cfg(test)]
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

enum Event {
    In(Option<RunnerMsg>),
    Out(Option<Result<Bytes, PorteroError>>),
}

struct RunnerState {
    endpoint: Endpoint,
    pool: Arc<BackendPool>,
    channel_size: usize,
    inflight: VecDeque<PipelineRequest>,
    writer: Option<BufWriter<OwnedWriteHalf>>,
    reader_task: Option<JoinHandle<()>>,
    out_rx: mpsc::Receiver<Result<Bytes, PorteroError>>,
    closed: bool,
}

impl RunnerState {
    async fn run(mut self, mut in_rx: mpsc::Receiver<RunnerMsg>) {
        let mut in_open = true;
        loop {
            if self.closed && self.inflight.is_empty() {
                break;
            }
            if !in_open && self.reader_task.is_none() {
                // nothing left that could produce progress
                break;
            }
            let event = tokio::select! {
                msg = in_rx.recv(), if in_open => Event::In(msg),
                rsp = self.out_rx.recv(), if self.reader_task.is_some() => Event::Out(rsp),
            };
            match event {
                Event::In(Some(RunnerMsg::Request(req))) => {
                    if let Err(e) = self.handle_batch(req, &mut in_rx).await {
                        self.recover(e, &mut in_rx).await;
                    }
                }
                Event::In(Some(RunnerMsg::Close)) => {
                    info!("close task runner {}", self.endpoint);
                    self.closed = true;
                }
                Event::In(None) => {
                    // the dispatcher discarded this runner; drain what is
                    // inflight and stop
                    in_open = false;
                    self.closed = true;
                }
                Event::Out(Some(Ok(raw))) => self.deliver(raw).await,
                Event::Out(Some(Err(e))) => self.recover(e, &mut in_rx).await,
                Event::Out(None) => {
                    self.recover(
                        PorteroError::backend("backend reader stopped"),
                        &mut in_rx,
                    )
                    .await
                }
            }
        }
        self.shutdown();
    }

    /// Write the first request plus anything else immediately queued, then
    /// flush once, so no request ever sits unflushed while the queue idles
    async fn handle_batch(
        &mut self,
        first: PipelineRequest,
        in_rx: &mut mpsc::Receiver<RunnerMsg>,
    ) -> PorteroResult<()> {
        self.write_request(first).await?;
        loop {
            match in_rx.try_recv() {
                Ok(RunnerMsg::Request(req)) => self.write_request(req).await?,
                Ok(RunnerMsg::Close) => {
                    info!("close task runner {}", self.endpoint);
                    self.closed = true;
                    break;
                }
                Err(_) => break,
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        Ok(())
    }

    async fn write_request(&mut self, req: PipelineRequest) -> PorteroResult<()> {
        let buf = req.cmd.to_bytes();
        // queued before the write so a failure still answers this request
        self.inflight.push_back(req);
        self.ensure_connected().await?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(PorteroError::backend("no backend connection"));
        };
        writer.write_all(&buf).await?;
        Ok(())
    }

    async fn ensure_connected(&mut self) -> PorteroResult<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let conn = self.pool.get(&self.endpoint).await?;
        self.install(conn.into_stream());
        Ok(())
    }

    fn install(&mut self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(self.channel_size);
        self.out_rx = out_rx;
        self.writer = Some(BufWriter::new(write_half));
        self.reader_task = Some(tokio::spawn(reading_loop(read_half, out_tx)));
    }

    async fn deliver(&mut self, raw: Bytes) {
        match self.inflight.pop_front() {
            Some(req) => req.respond(Ok(raw)).await,
            // can happen right after the reader returns from a blocking
            // read that outlived its pipeline
            None => warn!("reply from {} with no inflight request", self.endpoint),
        }
    }

    async fn recover(&mut self, err: PorteroError, in_rx: &mut mpsc::Receiver<RunnerMsg>) {
        if err.is_eof() {
            debug!("backend {} closed the connection", self.endpoint);
        } else {
            error!("backend {} pipeline error: {}", self.endpoint, err);
        }

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;

        let message = err.to_string();
        while let Some(req) = self.inflight.pop_front() {
            req.respond(Err(PorteroError::backend(message.clone()))).await;
        }

        if self.closed {
            return;
        }

        match self.pool.get(&self.endpoint).await {
            Ok(conn) => {
                info!("recovered backend connection to {}", self.endpoint);
                self.install(conn.into_stream());
            }
            Err(e) => {
                warn!("recovery of {} failed: {}", self.endpoint, e);
                let message = e.to_string();
                while let Ok(msg) = in_rx.try_recv() {
                    match msg {
                        RunnerMsg::Request(req) => {
                            req.respond(Err(PorteroError::backend(message.clone()))).await
                        }
                        RunnerMsg::Close => self.closed = true,
                    }
                }
                tokio::time::sleep(RECOVER_PAUSE).await;
            }
        }
    }

    fn shutdown(&mut self) {
        info!("task runner for {} exiting", self.endpoint);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        // dropping the write half closes the backend connection
        self.writer = None;
    }
}

/// Stream complete raw replies from the backend into the `out` channel
async fn reading_loop(
    read_half: OwnedReadHalf,
    out_tx: mpsc::Sender<Result<Bytes, PorteroError>>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut buf = BytesMut::with_capacity(4096);
        match read_data_bytes(&mut reader, &mut buf).await {
            Ok(()) => {
                if out_tx.send(Ok(buf.freeze())).await.is_err() {
                    // the coordinator swapped channels during recovery
                    return;
                }
            }
            Err(e) => {
                let _ = out_tx.send(Err(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pool::PoolConfig;
    use crate::proxy::PipelineResponse;
    use crate::resp::Command;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn test_pool() -> Arc<BackendPool> {
        Arc::new(
            BackendPool::new(PoolConfig {
                init_cap: 0,
                max_idle: 2,
                idle_timeout: Duration::from_secs(60),
                connect_timeout: Duration::from_secs(1),
                password: None,
                send_readonly: false,
            })
            .unwrap(),
        )
    }

    fn request(
        name: &str,
        key: &str,
        seq: u64,
        back_q: &mpsc::Sender<PipelineResponse>,
    ) -> PipelineRequest {
        PipelineRequest {
            cmd: Command::from_slice(&[name, key]),
            slot: 0,
            read_only: true,
            seq,
            sub_seq: 0,
            parent: None,
            back_q: back_q.clone(),
        }
    }

    /// Backend double that answers each command with `$<n>\r\nv<n>\r\n`
    async fn spawn_counting_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    let mut n = 0u32;
                    while crate::resp::read_command(&mut reader).await.is_ok() {
                        n += 1;
                        let value = format!("v{}", n);
                        let reply = format!("${}\r\n{}\r\n", value.len(), value);
                        if write_half.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_pipeline_replies_in_request_order() {
        let addr = spawn_counting_backend().await;
        let runner = TaskRunner::spawn(addr, test_pool(), 64);
        let (back_tx, mut back_rx) = mpsc::channel(16);

        for seq in 0..3 {
            runner.schedule(request("GET", &format!("k{}", seq), seq, &back_tx)).await;
        }

        for seq in 0..3u64 {
            let rsp = back_rx.recv().await.unwrap();
            assert_eq!(rsp.ctx.seq, seq);
            let raw = rsp.result.unwrap();
            let expected = format!("$2\r\nv{}\r\n", seq + 1);
            assert_eq!(&raw[..], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_recovery_fails_inflight_and_reconnects() {
        // first connection: one good reply, then swallow a command and die;
        // later connections behave
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // connection 1
            let (stream, _) = listener.accept().await.unwrap();
            {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                crate::resp::read_command(&mut reader).await.unwrap();
                write_half.write_all(b"$2\r\nv1\r\n").await.unwrap();
                crate::resp::read_command(&mut reader).await.unwrap();
                // drop both halves without replying
            }
            // connection 2 and beyond
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    while crate::resp::read_command(&mut reader).await.is_ok() {
                        if write_half.write_all(b"$2\r\nok\r\n").await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let runner = TaskRunner::spawn(addr, test_pool(), 64);
        let (back_tx, mut back_rx) = mpsc::channel(16);

        runner.schedule(request("GET", "a", 0, &back_tx)).await;
        let rsp = back_rx.recv().await.unwrap();
        assert_eq!(&rsp.result.unwrap()[..], b"$2\r\nv1\r\n");

        runner.schedule(request("GET", "b", 1, &back_tx)).await;
        let rsp = back_rx.recv().await.unwrap();
        assert_eq!(rsp.ctx.seq, 1);
        assert!(rsp.result.is_err());

        // the runner recovered onto a fresh connection
        runner.schedule(request("GET", "c", 2, &back_tx)).await;
        let rsp = back_rx.recv().await.unwrap();
        assert_eq!(rsp.ctx.seq, 2);
        assert_eq!(&rsp.result.unwrap()[..], b"$2\r\nok\r\n");
    }

    #[tokio::test]
    async fn test_close_drains_and_exits() {
        let addr = spawn_counting_backend().await;
        let runner = TaskRunner::spawn(addr, test_pool(), 64);
        let (back_tx, mut back_rx) = mpsc::channel(16);

        runner.schedule(request("GET", "a", 0, &back_tx)).await;
        runner.exit().await;

        let rsp = back_rx.recv().await.unwrap();
        assert!(rsp.result.is_ok());

        tokio::time::timeout(Duration::from_secs(2), runner.join())
            .await
            .expect("runner should exit after close");
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_requests() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let runner = TaskRunner::spawn(addr, test_pool(), 64);
        let (back_tx, mut back_rx) = mpsc::channel(16);

        runner.schedule(request("GET", "a", 0, &back_tx)).await;
        let rsp = back_rx.recv().await.unwrap();
        assert!(rsp.result.is_err());
    }
}
