//! # coordinator
//!
//! why: drive every put and delete through two-phase commit on the key's two replicas
//! relations: runs TpcOperation (tpc-core) over wire.rs connections; placement from ReplicaRing
//! what: TpcMaster, ClientHandler, RegistrationHandler, MasterServer

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use tpc_core::{
    Decision, Event, KvError, Message, MessageType, Outgoing, ParticipantInfo, Registration,
    Replica, ReplicaRing, TpcOperation,
};
use tpc_storage::KvCache;

use crate::config::CoordinatorConfig;
use crate::server::{NetworkHandler, SocketServer};
use crate::wire::{self, Connection};

/// Pause between decision deliveries to a replica that could not be reached.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The coordinator: placement, the write cache and the 2PC driver.
pub struct TpcMaster {
    timeout: Duration,
    /// Held for a whole transaction; guards the id counter and serializes writes.
    op_lock: Mutex<u64>,
    ring: RwLock<ReplicaRing>,
    cache: RwLock<KvCache>,
    stopping: AtomicBool,
}

impl TpcMaster {
    /// `members` are `"<id>@<host>:<port>"` strings for a statically configured cluster.
    pub fn new<I, T>(config: &CoordinatorConfig, members: I) -> Result<Self, KvError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let members = members
            .into_iter()
            .map(|m| m.as_ref().parse::<ParticipantInfo>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            timeout: config.timeout,
            op_lock: Mutex::new(first_tpc_op_id()),
            ring: RwLock::new(ReplicaRing::from_members(members)),
            cache: RwLock::new(KvCache::new(config.cache_capacity)),
            stopping: AtomicBool::new(false),
        })
    }

    /// Adds a participant, or moves an existing id to a new address.
    pub fn register(&self, info: ParticipantInfo) -> Registration {
        // membership never changes underneath a running transaction
        let _op = lock(&self.op_lock);
        let outcome = write(&self.ring).insert(info.clone());
        match outcome {
            Registration::Added => info!(participant = %info, "participant registered"),
            Registration::Replaced => info!(participant = %info, "participant address replaced"),
        }
        outcome
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        read(&self.ring).members().to_vec()
    }

    /// Primary and secondary for `key`.
    pub fn replicas(&self, key: &str) -> Result<(ParticipantInfo, ParticipantInfo), KvError> {
        read(&self.ring).replicas(key)
    }

    /// Id of the most recent transaction. Before the first one this is the
    /// start-up seed; ids only grow from there.
    pub fn last_tpc_op_id(&self) -> u64 {
        *lock(&self.op_lock)
    }

    pub fn cached(&self, key: &str) -> Option<String> {
        read(&self.cache).get(key).map(str::to_string)
    }

    /// Makes blocked decision deliveries give up.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Runs one put (`is_put`) or delete through two-phase commit.
    ///
    /// Returns `Ok(true)` when both replicas committed and `Ok(false)` when
    /// the transaction aborted. Invalid requests are rejected before an id is
    /// allocated.
    pub fn perform_operation(&self, msg: &Message, is_put: bool) -> Result<bool, KvError> {
        let expected = if is_put {
            MessageType::PutRequest
        } else {
            MessageType::DeleteRequest
        };
        if msg.msg_type != expected {
            return Err(KvError::Protocol(format!(
                "expected {expected:?}, got {:?}",
                msg.msg_type
            )));
        }
        msg.validate()?;
        let key = msg.require_key()?.to_string();

        let mut last_id = lock(&self.op_lock);
        let (primary, secondary) = self.replicas(&key)?;
        *last_id += 1;
        let mut op = TpcOperation::new(last_id.to_string(), msg);
        debug!(
            tpc_op_id = op.tpc_op_id(),
            key = %key,
            primary = %primary,
            secondary = %secondary,
            "phase 1"
        );
        let targets = [primary, secondary];

        let mut decisions = Vec::new();
        for (to, event) in self.prepare(&op, &targets) {
            decisions.extend(op.on_event(to, event));
        }
        let decision = op.decision().ok_or_else(|| {
            KvError::Protocol(format!("transaction {} left phase 1 undecided", op.tpc_op_id()))
        })?;
        match (decision, op.veto()) {
            (Decision::Abort, Some((replica, reason))) => info!(
                tpc_op_id = op.tpc_op_id(),
                ?replica,
                reason = %reason,
                "aborting"
            ),
            _ => info!(tpc_op_id = op.tpc_op_id(), ?decision, "decided"),
        }

        let op = self.deliver(op, &targets, decisions);
        let Some(committed) = op.outcome() else {
            return Err(KvError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                format!(
                    "coordinator stopped before transaction {} was acknowledged",
                    op.tpc_op_id()
                ),
            )));
        };

        if committed {
            let mut cache = write(&self.cache);
            match msg.value.as_deref() {
                Some(value) if is_put => cache.put(&key, value),
                _ => {
                    cache.delete(&key);
                }
            }
        }
        info!(tpc_op_id = op.tpc_op_id(), committed, "transaction finished");
        Ok(committed)
    }

    /// Phase 1: the prepare goes to both replicas at once, each on a fresh connection.
    fn prepare(&self, op: &TpcOperation, targets: &[ParticipantInfo; 2]) -> Vec<(Replica, Event)> {
        thread::scope(|scope| {
            let calls: Vec<_> = op
                .start()
                .into_iter()
                .map(|Outgoing { to, message }| {
                    let addr = target(targets, to).addr();
                    let timeout = self.timeout;
                    (to, scope.spawn(move || exchange(&addr, &message, timeout)))
                })
                .collect();
            calls
                .into_iter()
                .map(|(to, call)| {
                    let event = call
                        .join()
                        .unwrap_or_else(|_| Event::IoError("vote thread panicked".into()));
                    (to, event)
                })
                .collect()
        })
    }

    /// Phase 2: repeats the decision to each replica until it acks.
    fn deliver(
        &self,
        op: TpcOperation,
        targets: &[ParticipantInfo; 2],
        decisions: Vec<Outgoing>,
    ) -> TpcOperation {
        let op = Mutex::new(op);
        thread::scope(|scope| {
            for first in decisions {
                let op = &op;
                let info = target(targets, first.to).clone();
                scope.spawn(move || self.deliver_to(op, first, &info));
            }
        });
        op.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver_to(&self, op: &Mutex<TpcOperation>, first: Outgoing, info: &ParticipantInfo) {
        let to = first.to;
        let mut conn: Option<Connection> = None;
        let mut next = Some(first.message);
        let mut attempts = 0u32;

        while let Some(message) = next.take() {
            if self.is_stopping() {
                warn!(participant = %info, "stopping with decision undelivered");
                return;
            }
            attempts += 1;
            let event = match send_on(&mut conn, &info.addr(), &message, self.timeout) {
                Ok(reply) => Event::Reply(reply),
                Err(KvError::Timeout(_)) => Event::Timeout,
                Err(err) => {
                    // reconnect on the next attempt
                    conn = None;
                    Event::IoError(err.to_string())
                }
            };
            let acked = matches!(&event, Event::Reply(reply) if reply.msg_type == MessageType::Ack);
            let waited = matches!(event, Event::Timeout);
            if acked {
                debug!(participant = %info, attempts, "decision acknowledged");
            } else if attempts % 10 == 1 {
                warn!(participant = %info, attempts, ?event, "decision not acknowledged, resending");
            }

            next = lock(op)
                .on_event(to, event)
                .into_iter()
                .find(|out| out.to == to)
                .map(|out| out.message);
            // a timeout already waited; anything else would spin
            if next.is_some() && !waited {
                thread::sleep(RETRY_INTERVAL.min(self.timeout));
            }
        }
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Cache, then primary, then secondary.
    pub fn handle_get(&self, msg: &Message) -> Result<String, KvError> {
        msg.validate()?;
        let key = msg.require_key()?;
        if let Some(value) = self.cached(key) {
            debug!(key, "cache hit");
            return Ok(value);
        }

        let candidates = {
            let ring = read(&self.ring);
            let primary = ring
                .find_primary(key)
                .cloned()
                .ok_or_else(|| KvError::Unavailable("no participants registered".into()))?;
            let mut candidates = vec![primary.clone()];
            if let Some(secondary) = ring.find_successor(primary.id) {
                if secondary.id != primary.id {
                    candidates.push(secondary.clone());
                }
            }
            candidates
        };

        let request = Message::get_request(key);
        let mut failures = Vec::new();
        for info in &candidates {
            match wire::call(&info.addr(), &request, self.timeout) {
                Ok(reply) if reply.is_success() => match reply.value {
                    Some(value) => return Ok(value),
                    None => failures.push(format!("{}: response without a value", info.id)),
                },
                Ok(reply) => failures.push(format!(
                    "{}: {}",
                    info.id,
                    reply.message.unwrap_or_default()
                )),
                Err(err) => failures.push(format!("{}: {err}", info.id)),
            }
        }
        Err(KvError::NotFound(format!(
            "Does not exist on any replica ({})",
            failures.join("; ")
        )))
    }
}

/// Ids start at the boot time in microseconds, so a restarted coordinator
/// never reissues an id its participants have already seen.
fn first_tpc_op_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX / 2))
        .unwrap_or(0)
}

fn target(targets: &[ParticipantInfo; 2], to: Replica) -> &ParticipantInfo {
    match to {
        Replica::Primary => &targets[0],
        Replica::Secondary => &targets[1],
    }
}

/// One phase-1 exchange, folded into the event the state machine expects.
fn exchange(addr: &str, message: &Message, timeout: Duration) -> Event {
    match wire::call(addr, message, timeout) {
        Ok(reply) => Event::Reply(reply),
        Err(KvError::Timeout(_)) => Event::Timeout,
        Err(err) => Event::IoError(err.to_string()),
    }
}

/// Sends on the open connection, opening one first if there is none.
fn send_on(
    conn: &mut Option<Connection>,
    addr: &str,
    message: &Message,
    timeout: Duration,
) -> Result<Message, KvError> {
    if conn.is_none() {
        let fresh = Connection::connect(addr, timeout)?;
        fresh.set_timeout(Some(timeout))?;
        *conn = Some(fresh);
    }
    match conn.as_mut() {
        Some(open) => open.request(message),
        None => Err(KvError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            format!("no connection to {addr}"),
        ))),
    }
}

/// Serves client get/put/del requests, one request per connection.
pub struct ClientHandler {
    master: Arc<TpcMaster>,
    timeout: Duration,
}

impl ClientHandler {
    pub fn new(master: Arc<TpcMaster>, timeout: Duration) -> Self {
        Self { master, timeout }
    }

    pub fn respond(&self, msg: &Message) -> Message {
        match msg.msg_type {
            MessageType::GetRequest => match self.master.handle_get(msg) {
                Ok(value) => Message::success(msg.key.clone(), Some(value)),
                Err(err) => Message::failure(&err),
            },
            MessageType::PutRequest | MessageType::DeleteRequest => {
                let is_put = msg.msg_type == MessageType::PutRequest;
                match self.master.perform_operation(msg, is_put) {
                    Ok(true) => Message::success(None, None),
                    Ok(false) => Message::failure(&KvError::Aborted(
                        "a replica did not vote ready".into(),
                    )),
                    Err(err) => Message::failure(&err),
                }
            }
            other => Message::failure(&KvError::Protocol(format!(
                "clients cannot send {other:?}"
            ))),
        }
    }
}

impl NetworkHandler for ClientHandler {
    fn handle(&self, mut conn: Connection) -> Result<()> {
        // only the read is bounded; a 2PC round may legitimately take longer
        conn.set_timeout(Some(self.timeout))?;
        let reply = match conn.recv() {
            Ok(Some(msg)) => self.respond(&msg),
            Ok(None) => return Ok(()),
            Err(err) => Message::failure(&err),
        };
        conn.send(&reply)?;
        Ok(())
    }
}

/// Accepts `register` messages from participants.
pub struct RegistrationHandler {
    master: Arc<TpcMaster>,
    timeout: Duration,
}

impl RegistrationHandler {
    pub fn new(master: Arc<TpcMaster>, timeout: Duration) -> Self {
        Self { master, timeout }
    }

    pub fn respond(&self, msg: &Message) -> Message {
        if msg.msg_type != MessageType::Register {
            return Message::failure(&KvError::Protocol(format!(
                "expected register, got {:?}",
                msg.msg_type
            )));
        }
        let parsed = msg
            .message
            .as_deref()
            .ok_or_else(|| KvError::Protocol("register without participant info".into()))
            .and_then(str::parse::<ParticipantInfo>);
        match parsed {
            Ok(info) => {
                let text = format!("Successfully registered {info}");
                self.master.register(info);
                Message::success(None, None).with_message(text)
            }
            Err(err) => Message::failure(&err),
        }
    }
}

impl NetworkHandler for RegistrationHandler {
    fn handle(&self, mut conn: Connection) -> Result<()> {
        conn.set_timeout(Some(self.timeout))?;
        let reply = match conn.recv() {
            Ok(Some(msg)) => self.respond(&msg),
            Ok(None) => return Ok(()),
            Err(err) => Message::failure(&err),
        };
        conn.send(&reply)?;
        Ok(())
    }
}

/// The coordinator process: client and registration endpoints around one TpcMaster.
pub struct MasterServer {
    master: Arc<TpcMaster>,
    clients: SocketServer,
    registrations: SocketServer,
}

impl MasterServer {
    pub fn start<I, T>(config: CoordinatorConfig, members: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let master = Arc::new(
            TpcMaster::new(&config, members).context("invalid initial membership")?,
        );
        let registrations = SocketServer::start(
            "registration",
            &config.registration_addr,
            config.registration_workers,
            Arc::new(RegistrationHandler::new(Arc::clone(&master), config.timeout)),
        )?;
        let clients = SocketServer::start(
            "client",
            &config.client_addr,
            config.client_workers,
            Arc::new(ClientHandler::new(Arc::clone(&master), config.timeout)),
        )?;

        Ok(Self {
            master,
            clients,
            registrations,
        })
    }

    pub fn master(&self) -> &TpcMaster {
        &self.master
    }

    pub fn client_addr(&self) -> String {
        self.clients.local_addr().to_string()
    }

    pub fn registration_addr(&self) -> String {
        self.registrations.local_addr().to_string()
    }

    pub fn shutdown(&self) {
        self.master.shutdown();
        self.clients.shutdown();
        self.registrations.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
