//! Connection proxy for backends whose connection is established
//! asynchronously.
//!
//! A [`ConnectionProxy`] implements [`KvStore`] from the moment it is created.
//! Until the connection attempt resolves, every call is queued together with
//! its caller's completion channel. Resolution happens exactly once through
//! the paired [`ProxyResolver`]:
//!
//! - on success, later calls go straight to the connected store and the
//!   queue is replayed against it in the order the calls were issued;
//! - on failure, queued and later calls all complete with the same
//!   [`KvError::ConnectionError`] without reaching any backend.
//!
//! The proxy never retries. Retrying a connection belongs to whatever
//! produces the resolution.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{KvError, Result};
use crate::store::{CasId, KvStore, Record};

/// A captured call waiting for the connection to resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Get { key: String },
    Set { key: String, value: Value },
    Cas { key: String, value: Value, casid: Option<CasId> },
    Delete { key: String },
    Close,
    Ping,
}

impl Operation {
    /// The operation name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "get",
            Operation::Set { .. } => "set",
            Operation::Cas { .. } => "cas",
            Operation::Delete { .. } => "delete",
            Operation::Close => "close",
            Operation::Ping => "ping",
        }
    }

    async fn apply(self, store: &dyn KvStore) -> Result<Reply> {
        match self {
            Operation::Get { key } => store.get(&key).await.map(Reply::Record),
            Operation::Set { key, value } => store.set(&key, value).await.map(|_| Reply::Done),
            Operation::Cas { key, value, casid } => {
                store.cas(&key, value, casid).await.map(|_| Reply::Done)
            }
            Operation::Delete { key } => store.delete(&key).await.map(|_| Reply::Done),
            Operation::Close => store.close().await.map(|_| Reply::Done),
            Operation::Ping => store.ping().await.map(|_| Reply::Done),
        }
    }
}

#[derive(Debug)]
enum Reply {
    Record(Option<Record>),
    Done,
}

impl Reply {
    fn into_record(self) -> Result<Option<Record>> {
        match self {
            Reply::Record(record) => Ok(record),
            Reply::Done => Err(KvError::BackendError(
                "expected a record in reply to get".to_string(),
            )),
        }
    }

    fn into_done(self) -> Result<()> {
        match self {
            Reply::Done => Ok(()),
            Reply::Record(_) => Err(KvError::BackendError(
                "unexpected record in reply".to_string(),
            )),
        }
    }
}

struct PendingCall {
    operation: Operation,
    reply: oneshot::Sender<Result<Reply>>,
}

enum ProxyState {
    Pending(VecDeque<PendingCall>),
    Connected(Arc<dyn KvStore>),
    Failed(String),
}

enum Route {
    Direct(Arc<dyn KvStore>, Operation),
    Queued(oneshot::Receiver<Result<Reply>>),
    Failed(String),
}

/// A [`KvStore`] handle over a connection that may not exist yet.
///
/// Cloning yields another handle to the same proxy.
#[derive(Clone)]
pub struct ConnectionProxy {
    state: Arc<Mutex<ProxyState>>,
}

impl ConnectionProxy {
    /// Create an unresolved proxy and the resolver that completes it.
    pub fn pending() -> (Self, ProxyResolver) {
        let state = Arc::new(Mutex::new(ProxyState::Pending(VecDeque::new())));
        let proxy = Self {
            state: Arc::clone(&state),
        };
        let resolver = ProxyResolver { state: Some(state) };
        (proxy, resolver)
    }

    /// Spawn `connect` on the current tokio runtime and resolve the proxy
    /// with its outcome.
    ///
    /// Outside a tokio runtime nothing is spawned and the proxy starts out
    /// failed with a [`KvError::ConnectionError`].
    pub fn connecting<F>(connect: F) -> Self
    where
        F: Future<Output = Result<Arc<dyn KvStore>>> + Send + 'static,
    {
        let (proxy, resolver) = Self::pending();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let outcome = connect.await;
                    resolver.resolve(outcome).await;
                });
            }
            Err(err) => {
                resolver.reject(format!("cannot connect outside a tokio runtime: {err}"))
            }
        }
        proxy
    }

    /// True until the connection attempt resolves.
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), ProxyState::Pending(_))
    }

    /// True once the proxy forwards to a live connection.
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), ProxyState::Connected(_))
    }

    /// True once the connection attempt has failed.
    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), ProxyState::Failed(_))
    }

    /// Number of calls waiting for resolution.
    pub fn queued(&self) -> usize {
        match &*self.state.lock() {
            ProxyState::Pending(queue) => queue.len(),
            _ => 0,
        }
    }

    /// The underlying store, once connected.
    pub fn connection(&self) -> Option<Arc<dyn KvStore>> {
        match &*self.state.lock() {
            ProxyState::Connected(store) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    async fn dispatch(&self, operation: Operation) -> Result<Reply> {
        let route = {
            let mut state = self.state.lock();
            match &mut *state {
                ProxyState::Connected(store) => Route::Direct(Arc::clone(store), operation),
                ProxyState::Failed(message) => Route::Failed(message.clone()),
                ProxyState::Pending(queue) => {
                    let (reply, receiver) = oneshot::channel();
                    queue.push_back(PendingCall { operation, reply });
                    Route::Queued(receiver)
                }
            }
        };

        match route {
            Route::Direct(store, operation) => operation.apply(store.as_ref()).await,
            Route::Failed(message) => Err(KvError::ConnectionError(message)),
            Route::Queued(receiver) => receiver.await.unwrap_or_else(|_| {
                Err(KvError::ConnectionError(
                    "queued call dropped before the connection resolved".to_string(),
                ))
            }),
        }
    }
}

impl fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            ProxyState::Pending(queue) => format!("Pending({} queued)", queue.len()),
            ProxyState::Connected(_) => "Connected".to_string(),
            ProxyState::Failed(message) => format!("Failed({message})"),
        };
        f.debug_struct("ConnectionProxy").field("state", &state).finish()
    }
}

#[async_trait]
impl KvStore for ConnectionProxy {
    async fn get(&self, key: &str) -> Result<Option<Record>> {
        self.dispatch(Operation::Get {
            key: key.to_string(),
        })
        .await?
        .into_record()
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.dispatch(Operation::Set {
            key: key.to_string(),
            value,
        })
        .await?
        .into_done()
    }

    async fn cas(&self, key: &str, value: Value, casid: Option<CasId>) -> Result<()> {
        self.dispatch(Operation::Cas {
            key: key.to_string(),
            value,
            casid,
        })
        .await?
        .into_done()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.dispatch(Operation::Delete {
            key: key.to_string(),
        })
        .await?
        .into_done()
    }

    async fn close(&self) -> Result<()> {
        self.dispatch(Operation::Close).await?.into_done()
    }

    async fn ping(&self) -> Result<()> {
        self.dispatch(Operation::Ping).await?.into_done()
    }
}

/// One-shot handle that resolves a [`ConnectionProxy`].
///
/// `resolve` consumes the resolver, so a proxy can only be resolved once.
/// Dropping an unresolved resolver fails the proxy.
pub struct ProxyResolver {
    state: Option<Arc<Mutex<ProxyState>>>,
}

impl ProxyResolver {
    /// Resolve the proxy with the outcome of the connection attempt.
    ///
    /// On success the queued calls are replayed in order before this returns;
    /// each is awaited before the next starts. Calls issued meanwhile go
    /// straight to the store.
    pub async fn resolve(mut self, outcome: Result<Arc<dyn KvStore>>) {
        let Some(state) = self.state.take() else {
            return;
        };
        match outcome {
            Ok(store) => drain(&state, store).await,
            Err(err) => fail(&state, connection_message(err)),
        }
    }

    /// Fail the proxy without a connection attempt.
    pub fn reject(mut self, message: impl Into<String>) {
        if let Some(state) = self.state.take() {
            fail(&state, message.into());
        }
    }
}

impl Drop for ProxyResolver {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            fail(&state, "connection attempt abandoned".to_string());
        }
    }
}

fn connection_message(err: KvError) -> String {
    match err {
        KvError::ConnectionError(message) => message,
        other => other.to_string(),
    }
}

fn take_queue(state: &Mutex<ProxyState>, next: ProxyState) -> VecDeque<PendingCall> {
    let previous = std::mem::replace(&mut *state.lock(), next);
    debug_assert!(
        matches!(previous, ProxyState::Pending(_)),
        "connection proxy resolved twice"
    );
    match previous {
        ProxyState::Pending(queue) => queue,
        _ => VecDeque::new(),
    }
}

async fn drain(state: &Mutex<ProxyState>, store: Arc<dyn KvStore>) {
    let queue = take_queue(state, ProxyState::Connected(Arc::clone(&store)));
    info!(queued = queue.len(), "Connection established");

    for call in queue {
        debug!(operation = call.operation.name(), "Replaying queued call");
        let outcome = call.operation.apply(store.as_ref()).await;
        // The caller may have stopped waiting.
        let _ = call.reply.send(outcome);
    }
}

fn fail(state: &Mutex<ProxyState>, message: String) {
    let queue = take_queue(state, ProxyState::Failed(message.clone()));
    warn!(error = %message, queued = queue.len(), "Connection failed");

    for call in queue {
        let _ = call
            .reply
            .send(Err(KvError::ConnectionError(message.clone())));
    }
}
