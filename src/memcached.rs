//! Memcached key-value store over the text protocol.
//!
//! CAS tokens are the server's native CAS uniques, passed through unchanged:
//!
//! - `get` uses `gets` so the reply carries the CAS unique
//! - `cas` with a token uses `cas`; `EXISTS` and `NOT_FOUND` are mismatches
//! - `cas` without a token uses `add`; `NOT_STORED` is a mismatch
//! - `set` always gets a fresh unique from the server
//!
//! Values are stored as JSON text with the configured lifetime as the
//! native expiry. With several hosts each key is routed to one server by
//! hash.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{parse_settings, Settings};
use crate::error::{KvError, Result};
use crate::proxy::ConnectionProxy;
use crate::registry::Backend;
use crate::store::{decode_value, encode_value, validate_key, CasId, KvStore, Record};

/// Default server address.
pub const DEFAULT_HOST: &str = "127.0.0.1:11211";

/// Options recognized by the memcached backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemcachedOptions {
    /// Server addresses, as a list or a comma-separated string.
    #[serde(deserialize_with = "deserialize_hosts")]
    pub hosts: Vec<String>,
    /// Expiry passed with every write, in seconds.
    pub lifetime: u32,
}

impl Default for MemcachedOptions {
    fn default() -> Self {
        Self {
            hosts: vec![DEFAULT_HOST.to_string()],
            lifetime: 10_000,
        }
    }
}

fn split_hosts(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_hosts<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Hosts {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Hosts::deserialize(deserializer)? {
        Hosts::List(list) => list,
        Hosts::Joined(joined) => split_hosts(&joined),
    })
}

/// One server connection. Requests are strictly request/response.
///
/// `poisoned` is set when a request is sent and cleared once its whole reply
/// has been read. A connection left poisoned has unread reply bytes in its
/// stream and must be reopened before reuse.
struct Connection {
    addr: String,
    stream: BufReader<TcpStream>,
    poisoned: bool,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| KvError::ConnectionError(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| KvError::ConnectionError(format!("{addr}: {e}")))?;
        debug!("Connected to memcached at {}", addr);

        Ok(Self {
            addr: addr.to_string(),
            stream: BufReader::new(stream),
            poisoned: false,
        })
    }

    async fn send(&mut self, command: &str, data: Option<&[u8]>) -> Result<()> {
        self.poisoned = true;

        let mut buf = Vec::with_capacity(command.len() + data.map_or(0, |d| d.len() + 4) + 2);
        buf.extend_from_slice(command.as_bytes());
        buf.extend_from_slice(b"\r\n");
        if let Some(data) = data {
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }

        let stream = self.stream.get_mut();
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(KvError::BackendError(format!(
                "{}: connection closed by server",
                self.addr
            )));
        }
        let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();

        if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR")
        {
            // An error line is the whole reply.
            self.poisoned = false;
            return Err(KvError::BackendError(format!("{}: {}", self.addr, line)));
        }
        Ok(line)
    }

    /// Read a single-line reply, completing the request.
    async fn read_reply(&mut self) -> Result<String> {
        let line = self.read_line().await?;
        self.poisoned = false;
        Ok(line)
    }

    async fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; len + 2];
        self.stream.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(KvError::BackendError(format!(
                "{}: malformed data block",
                self.addr
            )));
        }
        data.truncate(len);
        Ok(data)
    }
}

/// Parse `VALUE <key> <flags> <bytes> <cas>` into `(bytes, cas)`.
fn parse_value_header(line: &str) -> Result<(usize, u64)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let unexpected = || KvError::BackendError(format!("unexpected reply: {line}"));

    match parts.as_slice() {
        ["VALUE", _key, _flags, bytes, cas] => {
            let bytes = bytes.parse().map_err(|_| unexpected())?;
            let cas = cas.parse().map_err(|_| unexpected())?;
            Ok((bytes, cas))
        }
        _ => Err(unexpected()),
    }
}

/// Memcached implementation of KvStore.
pub struct MemcachedStore {
    servers: Vec<Mutex<Connection>>,
    lifetime: u32,
    closed: AtomicBool,
}

impl MemcachedStore {
    /// Connect to every configured server.
    pub async fn open(options: MemcachedOptions) -> Result<Self> {
        if options.hosts.is_empty() {
            return Err(KvError::ConnectionError(
                "no memcached hosts configured".to_string(),
            ));
        }

        let mut servers = Vec::with_capacity(options.hosts.len());
        for host in &options.hosts {
            servers.push(Mutex::new(Connection::open(host).await?));
        }
        info!("Connected to memcached at {:?}", options.hosts);

        Ok(Self {
            servers,
            lifetime: options.lifetime,
            closed: AtomicBool::new(false),
        })
    }

    /// Start connecting in the background and return a proxy for the store.
    pub fn connect(options: MemcachedOptions) -> ConnectionProxy {
        ConnectionProxy::connecting(async move {
            let store = Self::open(options).await?;
            Ok(Arc::new(store) as Arc<dyn KvStore>)
        })
    }

    fn server_for(&self, key: &str) -> &Mutex<Connection> {
        if self.servers.len() == 1 {
            return &self.servers[0];
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.servers[(hasher.finish() % self.servers.len() as u64) as usize]
    }

    /// Lock a server connection, reopening it if an earlier request left it
    /// mid-reply.
    async fn checkout<'a>(
        &self,
        server: &'a Mutex<Connection>,
    ) -> Result<MutexGuard<'a, Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::ConnectionError("memcached store is closed".to_string()));
        }

        let mut conn = server.lock().await;
        if conn.poisoned {
            warn!("Reopening desynchronized memcached connection to {}", conn.addr);
            let addr = conn.addr.clone();
            *conn = Connection::open(&addr).await?;
        }
        Ok(conn)
    }

    /// Send a storage command and return the server's reply line.
    async fn store(
        &self,
        verb: &str,
        key: &str,
        value: &Value,
        casid: Option<CasId>,
    ) -> Result<String> {
        validate_key(key)?;
        let text = encode_value(value)?;

        let command = match casid {
            Some(casid) => format!("{verb} {key} 0 {} {} {casid}", self.lifetime, text.len()),
            None => format!("{verb} {key} 0 {} {}", self.lifetime, text.len()),
        };

        let mut conn = self.checkout(self.server_for(key)).await?;
        conn.send(&command, Some(text.as_bytes())).await?;
        conn.read_reply().await
    }
}

#[async_trait]
impl KvStore for MemcachedStore {
    async fn get(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;

        let found = {
            let mut conn = self.checkout(self.server_for(key)).await?;
            conn.send(&format!("gets {key}"), None).await?;

            let mut found = None;
            loop {
                let line = conn.read_line().await?;
                if line == "END" {
                    conn.poisoned = false;
                    break;
                }
                let (len, cas) = parse_value_header(&line)?;
                let data = conn.read_data(len).await?;
                found = Some((data, cas));
            }
            found
        };

        match found {
            Some((data, cas)) => {
                let text =
                    String::from_utf8(data).map_err(|e| KvError::EncodingError(e.to_string()))?;
                let value = decode_value(&text)?;
                Ok(Some(Record::new(value, CasId::new(cas))))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        match self.store("set", key, &value, None).await?.as_str() {
            "STORED" => Ok(()),
            other => Err(KvError::BackendError(format!("set not stored: {other}"))),
        }
    }

    async fn cas(&self, key: &str, value: Value, casid: Option<CasId>) -> Result<()> {
        let reply = match casid {
            None => self.store("add", key, &value, None).await?,
            Some(casid) => self.store("cas", key, &value, Some(casid)).await?,
        };

        match reply.as_str() {
            "STORED" => Ok(()),
            "EXISTS" | "NOT_FOUND" | "NOT_STORED" => Err(KvError::cas_mismatch(key)),
            other => Err(KvError::BackendError(format!("unexpected reply: {other}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        let mut conn = self.checkout(self.server_for(key)).await?;
        conn.send(&format!("delete {key}"), None).await?;
        match conn.read_reply().await?.as_str() {
            "DELETED" | "NOT_FOUND" => Ok(()),
            other => Err(KvError::BackendError(format!("unexpected reply: {other}"))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for server in &self.servers {
            let mut conn = server.lock().await;
            conn.send("quit", None).await?;
            // The server closes on quit, so the peer may already be gone.
            let _ = conn.stream.get_mut().shutdown().await;
        }
        debug!("Memcached store closed");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        for server in &self.servers {
            let mut conn = self.checkout(server).await?;
            conn.send("version", None).await?;
            let line = conn.read_reply().await?;
            if !line.starts_with("VERSION") {
                return Err(KvError::BackendError(format!("unexpected reply: {line}")));
            }
        }
        Ok(())
    }
}

/// Backend factory for [`MemcachedStore`].
pub struct MemcachedBackend;

impl Backend for MemcachedBackend {
    fn name(&self) -> &str {
        "memcached"
    }

    fn connect(&self, settings: Settings) -> Result<Arc<dyn KvStore>> {
        let options: MemcachedOptions = parse_settings(self.name(), settings)?;
        Ok(Arc::new(MemcachedStore::connect(options)))
    }
}
