use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use orb_protocol::{Inbound, RpcCodec, RpcMessage, WireValue};
use orb_types::{ClassRegistry, ErrorValue, Handle, Object, ObjectError, ObjectResult, Value};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, RpcError};
use crate::gc_set::GcSet;
use crate::reference::{Rebind, RemoteProxy};

type Reply = ObjectResult<Value>;

/// Options for a [`Connection`].
#[derive(Clone, Debug, Default)]
pub struct ConnectionConfig {
    /// Classes that instances copied by value are rebuilt from. Without a
    /// registry, inbound copied instances fail to load.
    pub registry: Option<Arc<ClassRegistry>>,
}

impl ConnectionConfig {
    pub fn with_registry(registry: Arc<ClassRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }
}

/// State shared by a connection's handles, its threads, and the proxies it
/// hands out.
pub(crate) struct Shared {
    peer: SocketAddr,
    exported: Value,
    registry: Option<Arc<ClassRegistry>>,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    dead: AtomicBool,
    next_call: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    exports: Mutex<GcSet>,
    notices: flume::Sender<u64>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn registry(&self) -> Option<&Arc<ClassRegistry>> {
        self.registry.as_ref()
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn unreachable(&self) -> ObjectError {
        ObjectError::PeerUnreachable(self.peer.to_string())
    }

    pub(crate) fn export(&self, handle: &Handle) -> u64 {
        self.exports.lock().expect("export lock poisoned").export(handle)
    }

    pub(crate) fn exported_object(&self, id: u64) -> Option<Handle> {
        self.exports.lock().expect("export lock poisoned").get(id)
    }

    /// Queue a release notice for the peer's export `id`.
    pub(crate) fn release_later(&self, id: u64) {
        if self.notices.send(id).is_err() {
            debug!(peer = %self.peer, id, "release notice dropped, notice queue closed");
        }
    }

    /// Drop the holds taken for a message that never reached the peer.
    pub(crate) fn revoke(&self, minted: &[u64]) {
        if minted.is_empty() {
            return;
        }
        let released: Vec<Handle> = {
            let mut exports = self.exports.lock().expect("export lock poisoned");
            minted.iter().filter_map(|id| exports.release(*id)).collect()
        };
        debug!(
            peer = %self.peer,
            minted = minted.len(),
            released = released.len(),
            "revoked undelivered exports"
        );
    }

    /// Encode outside the send lock, then write the frame under it.
    fn send(&self, msg: &RpcMessage) -> Result<()> {
        let frame = RpcCodec::encode(msg)?;
        self.send_frame(&frame)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_dead() {
            return Err(RpcError::Closed(self.peer.to_string()));
        }
        let mut writer = self.writer.lock().expect("send lock poisoned");
        if let Err(e) = RpcCodec::write_frame(&mut *writer, frame) {
            drop(writer);
            debug!(peer = %self.peer, error = %e, "send failed, closing connection");
            self.dead.store(true, Ordering::SeqCst);
            let _ = self.control.shutdown(Shutdown::Both);
            return Err(e.into());
        }
        Ok(())
    }

    /// Ship a call and block until the correlated reply arrives or the
    /// connection dies.
    pub(crate) fn call(
        self: &Arc<Self>,
        target: Option<u64>,
        method: &str,
        args: Vec<Value>,
        block: Option<Value>,
    ) -> ObjectResult<Value> {
        if self.is_dead() {
            return Err(self.unreachable());
        }
        let caller = self.next_call.fetch_add(1, Ordering::Relaxed);
        let mut minted = Vec::new();
        let encoded = self
            .dump_call(&args, block.as_ref(), &mut minted)
            .and_then(|(args, block)| {
                RpcCodec::encode(&RpcMessage::MethodCall {
                    caller,
                    target,
                    method: method.to_string(),
                    args,
                    block,
                })
                .map_err(|e| ObjectError::Application(format!("cannot send `{method}`: {e}")))
            });
        let frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                self.revoke(&minted);
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(caller, tx);
        if self.is_dead() {
            self.forget(caller);
            self.revoke(&minted);
            return Err(self.unreachable());
        }
        trace!(peer = %self.peer, caller, method, "calling");
        if let Err(e) = self.send_frame(&frame) {
            self.forget(caller);
            self.revoke(&minted);
            return Err(e.into());
        }

        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ObjectError::RemoteApplication(remote))) => Err(ObjectError::RemoteApplication(
                splice_trace(remote, method, self.peer),
            )),
            Ok(Err(other)) => Err(other),
            Err(_) => Err(self.unreachable()),
        }
    }

    fn dump_call(
        self: &Arc<Self>,
        args: &[Value],
        block: Option<&Value>,
        minted: &mut Vec<u64>,
    ) -> ObjectResult<(Vec<WireValue>, WireValue)> {
        let args = args
            .iter()
            .map(|a| self.dump(a, minted))
            .collect::<ObjectResult<Vec<_>>>()?;
        let block = match block {
            Some(b) => self.dump(b, minted)?,
            None => WireValue::Nil,
        };
        Ok((args, block))
    }

    fn forget(&self, caller: u64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&caller);
    }

    fn dispatch(self: &Arc<Self>, msg: RpcMessage) {
        match msg {
            call @ RpcMessage::MethodCall { .. } => {
                let conn = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name(format!("orb-call-{}", self.peer))
                    .spawn(move || conn.handle_call(call));
                if let Err(e) = spawned {
                    warn!(peer = %self.peer, error = %e, "could not spawn call thread");
                }
            }
            reply @ RpcMessage::ReturnValue { .. } => self.handle_reply(reply),
            RpcMessage::GarbageFound { object_id } => {
                let released = self
                    .exports
                    .lock()
                    .expect("export lock poisoned")
                    .release(object_id);
                if released.is_some() {
                    debug!(peer = %self.peer, id = object_id, "export released");
                }
                drop(released);
            }
        }
    }

    fn handle_reply(self: &Arc<Self>, reply: RpcMessage) {
        let Some(caller) = reply.caller() else {
            return;
        };
        // Loaded even when nobody waits: references it carries become
        // proxies, and dropping those sends the release notices.
        let loaded = reply.load(&Rebind { conn: self });
        let waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&caller);
        let Some(waiter) = waiter else {
            debug!(peer = %self.peer, caller, "discarding reply for a caller that is gone");
            return;
        };
        let outcome = match loaded {
            Ok(Inbound::ReturnValue {
                is_exception: true,
                result,
                ..
            }) => Err(into_remote_error(result)),
            Ok(Inbound::ReturnValue { result, .. }) => Ok(result),
            Ok(_) => return,
            Err(e) => Err(e),
        };
        let _ = waiter.send(outcome);
    }

    fn handle_call(self: Arc<Self>, call: RpcMessage) {
        let Some(caller) = call.caller() else {
            return;
        };
        let outcome = match call.load(&Rebind { conn: &self }) {
            Ok(Inbound::MethodCall {
                target,
                method,
                args,
                block,
                ..
            }) => self.invoke_local(target, &method, args, block),
            Ok(_) => return,
            Err(e) => Err(e),
        };
        let mut minted = Vec::new();
        let encoded = outcome
            .and_then(|v| self.dump(&v, &mut minted))
            .and_then(|result| {
                RpcCodec::encode(&RpcMessage::ReturnValue {
                    is_exception: false,
                    result,
                    caller,
                })
                .map_err(|e| ObjectError::Application(format!("cannot send result: {e}")))
            });
        let frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                self.revoke(&minted);
                let failure = RpcMessage::ReturnValue {
                    is_exception: true,
                    result: WireValue::Error(ErrorValue::from_error(&e)),
                    caller,
                };
                match RpcCodec::encode(&failure) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(peer = %self.peer, caller, error = %e, "cannot encode failure reply");
                        return;
                    }
                }
            }
        };
        if let Err(e) = self.send_frame(&frame) {
            debug!(peer = %self.peer, caller, error = %e, "reply not delivered");
        }
    }

    fn invoke_local(
        &self,
        target: Option<u64>,
        method: &str,
        args: Vec<Value>,
        block: Option<Value>,
    ) -> ObjectResult<Value> {
        let receiver = match target {
            None => self.exported.clone(),
            Some(id) => match self.exported_object(id) {
                Some(handle) => Value::Object(handle),
                None => {
                    warn!(peer = %self.peer, id, method, "rejected call on unexported object");
                    return Err(ObjectError::UnauthorizedReference(id));
                }
            },
        };
        let type_name = receiver.type_name().to_string();
        let sent = panic::catch_unwind(AssertUnwindSafe(|| receiver.send(method, args, block)))
            .unwrap_or_else(|payload| {
                warn!(peer = %self.peer, method, "method panicked");
                Err(ObjectError::Application(format!(
                    "`{method}` panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        sent.map_err(|e| match e {
            ObjectError::RemoteApplication(_) => e,
            other => ObjectError::RemoteApplication(
                ErrorValue::from_error(&other).with_frame(format!("{type_name}#{method}")),
            ),
        })
    }

    /// Mark dead, wake every waiting caller, and drop the export holds.
    fn shut_down(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let _ = self.control.shutdown(Shutdown::Both);
        let waiters: Vec<_> = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(self.unreachable()));
        }
        let released = self.exports.lock().expect("export lock poisoned").clear();
        info!(peer = %self.peer, released = released.len(), "connection closed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

fn into_remote_error(result: Value) -> ObjectError {
    match result {
        Value::Error(e) => ObjectError::RemoteApplication(e),
        other => ObjectError::RemoteApplication(ErrorValue::new("RuntimeError", other.inspect())),
    }
}

/// Append the local call site to a remote failure's trace: a marker frame
/// for the hop, then the captured local frames outside this crate.
fn splice_trace(mut remote: ErrorValue, method: &str, peer: SocketAddr) -> ErrorValue {
    remote.trace.push(format!("<remote call `{method}` to {peer}>"));
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        remote.trace.extend(
            backtrace
                .to_string()
                .lines()
                .filter_map(|line| line.trim().split_once(": ").map(|(_, f)| f.to_string()))
                .filter(|frame| !is_internal_frame(frame)),
        );
    }
    remote
}

fn is_internal_frame(frame: &str) -> bool {
    const INTERNAL: [&str; 7] = [
        "orb_rpc::",
        "<orb_rpc::",
        "std::",
        "core::",
        "alloc::",
        "__rust",
        "<alloc::",
    ];
    INTERNAL.iter().any(|prefix| frame.starts_with(prefix))
}

fn receive_loop(shared: Arc<Shared>, mut reader: TcpStream) {
    loop {
        match RpcCodec::read_message(&mut reader) {
            Ok(Some(msg)) => shared.dispatch(msg),
            Ok(None) => {
                debug!(peer = %shared.peer, "peer disconnected");
                break;
            }
            Err(e) if e.is_disconnect() || shared.is_dead() => {
                debug!(peer = %shared.peer, error = %e, "connection ended");
                break;
            }
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "protocol error, dropping connection");
                break;
            }
        }
    }
    shared.shut_down();
}

fn notice_loop(shared: Weak<Shared>, notices: flume::Receiver<u64>) {
    while let Ok(id) = notices.recv() {
        let Some(conn) = shared.upgrade() else {
            break;
        };
        if let Err(e) = conn.send(&RpcMessage::GarbageFound { object_id: id }) {
            debug!(peer = %conn.peer, id, error = %e, "release notice not delivered");
        }
    }
}

/// One end of a connection between two peers.
///
/// A connection exports one fixed root object to its peer and hands out
/// proxies for whatever the peer exports. Calls on the peer's objects block
/// the calling thread until the matching reply arrives; inbound calls each
/// run on their own thread so a slow method never stalls the receive loop.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connect to a listener. Nothing is exported to the peer.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(host, port, Value::Nil, ConnectionConfig::default())
    }

    pub fn connect_with(
        host: &str,
        port: u16,
        exported: Value,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let stream = TcpStream::connect(&addrs[..])?;
        Self::open(stream, exported, config)
    }

    /// Serve an already accepted socket, exporting `exported` as its root.
    pub fn accept(stream: TcpStream, exported: Value) -> Result<Self> {
        Self::open(stream, exported, ConnectionConfig::default())
    }

    /// Start the receive and notice threads on `stream`.
    pub fn open(stream: TcpStream, exported: Value, config: ConnectionConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let (notices, notice_rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            peer,
            exported,
            registry: config.registry,
            writer: Mutex::new(stream),
            control,
            dead: AtomicBool::new(false),
            next_call: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            exports: Mutex::new(GcSet::new()),
            notices,
            receiver: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name(format!("orb-notices-{peer}"))
            .spawn(move || notice_loop(weak, notice_rx))?;

        let conn = Arc::clone(&shared);
        let receiver = thread::Builder::new()
            .name(format!("orb-recv-{peer}"))
            .spawn(move || receive_loop(conn, reader))?;
        *shared.receiver.lock().expect("receiver lock poisoned") = Some(receiver);

        info!(%peer, "connection opened");
        Ok(Self { shared })
    }

    /// Proxy for the peer's exported root.
    pub fn root(&self) -> Value {
        Value::object(RemoteProxy::new(Arc::clone(&self.shared), None))
    }

    /// Call `method` on the peer's root.
    pub fn call(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        self.shared.call(None, method, args, block)
    }

    /// Block until the receive loop has ended.
    pub fn join(&self) {
        let handle = self
            .shared
            .receiver
            .lock()
            .expect("receiver lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(peer = %self.shared.peer, "receive loop panicked");
            }
        }
    }

    /// Shut the socket down. The receive loop winds the connection down and
    /// every waiting caller fails with `PeerUnreachable`.
    pub fn close(&self) {
        self.shared.dead.store(true, Ordering::SeqCst);
        let _ = self.shared.control.shutdown(Shutdown::Both);
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.is_dead()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Number of objects the peer may currently address.
    pub fn exported_count(&self) -> usize {
        self.shared.exports.lock().expect("export lock poisoned").len()
    }

    pub fn is_exported(&self, id: u64) -> bool {
        self.shared
            .exports
            .lock()
            .expect("export lock poisoned")
            .contains(id)
    }

    /// Outstanding references the peer holds to export `id`.
    pub fn export_count(&self, id: u64) -> u64 {
        self.shared
            .exports
            .lock()
            .expect("export lock poisoned")
            .count(id)
    }
}

impl Object for Connection {
    fn invoke(&self, method: &str, args: Vec<Value>, block: Option<Value>) -> ObjectResult<Value> {
        self.call(method, args, block)
    }

    fn type_name(&self) -> &str {
        "Connection"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn inspect(&self) -> String {
        format!("#<Connection {}>", self.shared.peer)
    }
}
