/// Per-endpoint backend connection pooling
///
/// Each endpoint gets a bounded queue of idle, ready-to-use connections.
/// A connection is *ready* once the factory has dialed it, authenticated
/// (when a password is configured) and primed it with `READONLY` (when the
/// read preference allows replica reads). Connections that witnessed a
/// protocol error are marked unusable and closed instead of being parked.
///
/// A parked connection always sits at a protocol boundary: its owner has
/// read every byte of every reply it asked for.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use fnv::FnvHashSet;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cluster::Endpoint;
use crate::error::{ConfigError, PorteroError, PorteroResult};
use crate::resp::{read_data, Command, RespData};

/// Pool sizing and the backend handshake parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections dialed eagerly when an endpoint's pool first appears
    pub init_cap: usize,
    /// Idle connections kept per endpoint; anything beyond is closed on put
    pub max_idle: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub password: Option<String>,
    pub send_readonly: bool,
}

impl PoolConfig {
    pub fn validate(&self) -> PorteroResult<()> {
        if self.max_idle == 0 {
            return Err(ConfigError::Validation(
                "backend-idle-connections must be greater than 0".to_string(),
            )
            .into());
        }
        if self.init_cap > self.max_idle {
            return Err(ConfigError::Validation(
                "backend-init-connections must not exceed backend-idle-connections".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// An authenticated, primed backend connection
#[derive(Debug)]
pub struct PooledConn {
    stream: TcpStream,
    endpoint: Endpoint,
    unusable: bool,
}

impl PooledConn {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Flag the connection as desynced; `put` will close it
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    /// Borrow both stream halves for one request/response conversation
    pub fn split(&mut self) -> (ReadHalf<'_>, WriteHalf<'_>) {
        self.stream.split()
    }

    /// Take the raw stream (the connection never returns to the pool)
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Send one command and read one typed reply
    ///
    /// A RESP error reply is surfaced as `Err`; callers use this for
    /// handshakes and control conversations where an error is fatal to the
    /// exchange.
    pub async fn request(&mut self, cmd: &Command) -> PorteroResult<RespData> {
        let (read_half, mut write_half) = self.stream.split();
        write_half.write_all(&cmd.to_bytes()).await?;
        let mut reader = BufReader::new(read_half);
        match read_data(&mut reader).await? {
            RespData::Error(message) => Err(PorteroError::backend(format!(
                "{} rejected by {}: {}",
                cmd.name(),
                self.endpoint,
                message
            ))),
            data => Ok(data),
        }
    }
}

struct IdleConn {
    conn: PooledConn,
    parked_at: Instant,
}

type IdleQueue = Arc<Mutex<VecDeque<IdleConn>>>;

/// All per-endpoint pools, keyed by `host:port`
pub struct BackendPool {
    config: PoolConfig,
    pools: Mutex<FnvHashMap<Endpoint, IdleQueue>>,
}

impl BackendPool {
    pub fn new(config: PoolConfig) -> PorteroResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pools: Mutex::new(FnvHashMap::default()),
        })
    }

    /// Get a ready connection, creating the endpoint's pool on first use
    ///
    /// Pool creation is single-flight under the map mutex; the initial
    /// warm-up connections are dialed in the background, best-effort.
    pub async fn get(&self, endpoint: &str) -> PorteroResult<PooledConn> {
        let (queue, created) = {
            let mut pools = self.pools.lock().unwrap();
            match pools.get(endpoint) {
                Some(queue) => (Arc::clone(queue), false),
                None => {
                    let queue: IdleQueue = Arc::new(Mutex::new(VecDeque::new()));
                    pools.insert(endpoint.to_string(), Arc::clone(&queue));
                    (queue, true)
                }
            }
        };

        if created && self.config.init_cap > 0 {
            self.warm_up(endpoint.to_string(), Arc::clone(&queue));
        }

        loop {
            let idle = queue.lock().unwrap().pop_front();
            match idle {
                Some(idle) if idle.parked_at.elapsed() < self.config.idle_timeout => {
                    return Ok(idle.conn);
                }
                Some(idle) => {
                    debug!("discarding expired idle connection to {}", idle.conn.endpoint);
                    continue;
                }
                None => break,
            }
        }

        connect(endpoint, &self.config).await
    }

    /// Park the connection, unless it is unusable or the pool is full
    pub async fn put(&self, conn: PooledConn) {
        if conn.unusable {
            debug!("closing unusable connection to {}", conn.endpoint);
            return;
        }
        let queue = {
            let pools = self.pools.lock().unwrap();
            pools.get(&conn.endpoint).map(Arc::clone)
        };
        let Some(queue) = queue else {
            // the endpoint left the cluster while the connection was out
            return;
        };
        let mut queue = queue.lock().unwrap();
        if queue.len() >= self.config.max_idle {
            return;
        }
        queue.push_back(IdleConn {
            conn,
            parked_at: Instant::now(),
        });
    }

    /// Drop the pools of endpoints that are no longer part of the cluster
    pub fn reload(&self, alive: &FnvHashSet<Endpoint>) {
        let mut pools = self.pools.lock().unwrap();
        pools.retain(|endpoint, _| {
            let keep = alive.contains(endpoint);
            if !keep {
                warn!("draining pool for departed endpoint {}", endpoint);
            }
            keep
        });
    }

    /// Idle connections currently parked for an endpoint
    pub fn idle_count(&self, endpoint: &str) -> usize {
        let pools = self.pools.lock().unwrap();
        pools
            .get(endpoint)
            .map(|queue| queue.lock().unwrap().len())
            .unwrap_or(0)
    }

    fn warm_up(&self, endpoint: Endpoint, queue: IdleQueue) {
        let config = self.config.clone();
        tokio::spawn(async move {
            for _ in 0..config.init_cap {
                match connect(&endpoint, &config).await {
                    Ok(conn) => {
                        let mut queue = queue.lock().unwrap();
                        if queue.len() >= config.max_idle {
                            break;
                        }
                        queue.push_back(IdleConn {
                            conn,
                            parked_at: Instant::now(),
                        });
                    }
                    Err(e) => {
                        debug!("warm-up dial to {} failed: {}", endpoint, e);
                        break;
                    }
                }
            }
        });
    }
}

/// The connection factory: dial, authenticate, prime
async fn connect(endpoint: &str, config: &PoolConfig) -> PorteroResult<PooledConn> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| PorteroError::backend(format!("connect to {} timed out", endpoint)))??;
    stream.set_nodelay(true)?;

    let mut conn = PooledConn {
        stream,
        endpoint: endpoint.to_string(),
        unusable: false,
    };

    if let Some(password) = &config.password {
        conn.request(&Command::from_slice(&["AUTH", password])).await?;
    }
    if config.send_readonly {
        conn.request(&Command::from_slice(&["READONLY"])).await?;
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config() -> PoolConfig {
        PoolConfig {
            init_cap: 0,
            max_idle: 2,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            password: None,
            send_readonly: false,
        }
    }

    /// Accepts connections, counts them, and answers every command with +OK
    async fn spawn_ok_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    loop {
                        match read_data(&mut reader).await {
                            Ok(_) => {
                                if write_half.write_all(b"+OK\r\n").await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config();
        cfg.max_idle = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.init_cap = 5;
        cfg.max_idle = 2;
        assert!(cfg.validate().is_err());

        assert!(config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_get_put_reuses_connection() {
        let (addr, accepted) = spawn_ok_server().await;
        let pool = BackendPool::new(config()).unwrap();

        let conn = pool.get(&addr).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        pool.put(conn).await;
        assert_eq!(pool.idle_count(&addr), 1);

        let _conn = pool.get(&addr).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_unusable_connection_is_closed() {
        let (addr, accepted) = spawn_ok_server().await;
        let pool = BackendPool::new(config()).unwrap();

        let mut conn = pool.get(&addr).await.unwrap();
        conn.mark_unusable();
        pool.put(conn).await;
        assert_eq!(pool.idle_count(&addr), 0);

        let _conn = pool.get(&addr).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_max_idle_bound() {
        let (addr, _) = spawn_ok_server().await;
        let pool = BackendPool::new(config()).unwrap();

        let a = pool.get(&addr).await.unwrap();
        let b = pool.get(&addr).await.unwrap();
        let c = pool.get(&addr).await.unwrap();
        pool.put(a).await;
        pool.put(b).await;
        pool.put(c).await;
        assert_eq!(pool.idle_count(&addr), 2);
    }

    #[tokio::test]
    async fn test_auth_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let cmd = crate::resp::read_command(&mut reader).await.unwrap();
            if cmd.name() == "AUTH" && cmd.arg(1) == "sesame" {
                write_half.write_all(b"+OK\r\n").await.unwrap();
            } else {
                write_half.write_all(b"-ERR invalid password\r\n").await.unwrap();
            }
            // hold the connection open until the test is done
            let mut sink = [0u8; 1];
            let _ = reader.read(&mut sink).await;
        });

        let mut cfg = config();
        cfg.password = Some("sesame".to_string());
        let pool = BackendPool::new(cfg).unwrap();
        assert!(pool.get(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_rejection_fails_factory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = crate::resp::read_command(&mut reader).await.unwrap();
            let _ = write_half.write_all(b"-ERR invalid password\r\n").await;
        });

        let mut cfg = config();
        cfg.password = Some("wrong".to_string());
        let pool = BackendPool::new(cfg).unwrap();
        assert!(pool.get(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_reload_drops_departed_endpoints() {
        let (addr_a, _) = spawn_ok_server().await;
        let (addr_b, _) = spawn_ok_server().await;
        let pool = BackendPool::new(config()).unwrap();

        let a = pool.get(&addr_a).await.unwrap();
        let b = pool.get(&addr_b).await.unwrap();
        pool.put(a).await;
        pool.put(b).await;

        let mut alive = FnvHashSet::default();
        alive.insert(addr_a.clone());
        pool.reload(&alive);

        assert_eq!(pool.idle_count(&addr_a), 1);
        assert_eq!(pool.idle_count(&addr_b), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_discards_stale_connections() {
        let (addr, accepted) = spawn_ok_server().await;
        let mut cfg = config();
        cfg.idle_timeout = Duration::from_millis(10);
        let pool = BackendPool::new(cfg).unwrap();

        let conn = pool.get(&addr).await.unwrap();
        pool.put(conn).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _conn = pool.get(&addr).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }
}
