//! In-process store daemon.
//!
//! [`FakeXenstored`] pumps the peer side of a shared ring page: it parses
//! request frames, applies them to an in-memory tree, and writes responses
//! and watch events back, ringing the guest doorbell the way the real
//! service would. Tests drive ordering and fault scenarios through the
//! hold/release toggles and raw frame injection.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use log::debug;
use tokio::task::JoinHandle;
use xsring::{
    HEADER_SIZE, MessageHeader, MessageKind,
    ring::{PageHandle, RingReader, RingWriter},
};

use crate::loopback::DoorbellLine;

/// Header fields as read off the wire, kind still raw.
struct RawHeader {
    kind: u32,
    request_id: u32,
    transaction_id: u32,
}

struct TxState {
    tree: BTreeMap<String, String>,
    start_generation: u64,
}

struct WatchRec {
    path: String,
    token: Vec<u8>,
}

struct Inner {
    tree: BTreeMap<String, String>,
    generation: u64,
    transactions: HashMap<u32, TxState>,
    next_transaction: u32,
    watches: Vec<WatchRec>,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    held: Vec<Vec<u8>>,
    holding: bool,
    kinds_seen: Vec<MessageKind>,
}

/// The fake store service.
///
/// Dropping it aborts the pump task; the ring page outlives both sides.
pub struct FakeXenstored {
    inner: Arc<Mutex<Inner>>,
    line: Arc<DoorbellLine>,
    task: JoinHandle<()>,
}

impl FakeXenstored {
    /// Start the daemon on the peer-side endpoints of `page`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn spawn(page: PageHandle, line: Arc<DoorbellLine>) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            tree: BTreeMap::new(),
            generation: 0,
            transactions: HashMap::new(),
            next_transaction: 1,
            watches: Vec::new(),
            inbox: Vec::new(),
            outbox: Vec::new(),
            held: Vec::new(),
            holding: false,
            kinds_seen: Vec::new(),
        }));
        let task = tokio::spawn(pump(page, Arc::clone(&line), Arc::clone(&inner)));
        Self { inner, line, task }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().expect("daemon state poisoned") }

    /// Insert a node quietly: no history bump, no watch events. Setup only.
    pub fn seed(&self, path: &str, value: &str) {
        self.lock().tree.insert(path.to_owned(), value.to_owned());
    }

    /// Mutate the tree as another client would: bumps history, fires watch
    /// events, and wakes the pump to deliver them.
    pub fn write_external(&self, path: &str, value: &str) {
        {
            let mut state = self.lock();
            state.tree.insert(path.to_owned(), value.to_owned());
            state.generation += 1;
            fire_watches(&mut state, path);
        }
        self.line.ring_daemon();
    }

    /// Current value of a node, read straight from the base tree.
    #[must_use]
    pub fn value(&self, path: &str) -> Option<String> { self.lock().tree.get(path).cloned() }

    /// Park request replies instead of sending them, until released. Watch
    /// events keep flowing.
    pub fn hold_replies(&self) { self.lock().holding = true; }

    /// Send parked replies in arrival order and stop holding.
    pub fn release_replies(&self) {
        {
            let mut state = self.lock();
            state.holding = false;
            let held = std::mem::take(&mut state.held);
            for frame in held {
                state.outbox.extend_from_slice(&frame);
            }
        }
        self.line.ring_daemon();
    }

    /// Write a raw frame to the response stream, bypassing the protocol
    /// handlers. For spurious and unknown-kind injection.
    pub fn inject_frame(&self, kind: u32, request_id: u32, transaction_id: u32, payload: &[u8]) {
        {
            let mut state = self.lock();
            state.outbox.extend_from_slice(&kind.to_le_bytes());
            state.outbox.extend_from_slice(&request_id.to_le_bytes());
            state.outbox.extend_from_slice(&transaction_id.to_le_bytes());
            let length = u32::try_from(payload.len()).expect("injected payload fits the header");
            state.outbox.extend_from_slice(&length.to_le_bytes());
            state.outbox.extend_from_slice(payload);
        }
        self.line.ring_daemon();
    }

    /// Kinds handled so far, in arrival order.
    #[must_use]
    pub fn kinds_seen(&self) -> Vec<MessageKind> { self.lock().kinds_seen.clone() }

    /// Number of registered watches.
    #[must_use]
    pub fn watch_count(&self) -> usize { self.lock().watches.len() }
}

impl Drop for FakeXenstored {
    fn drop(&mut self) { self.task.abort(); }
}

/// Event-driven pump: drain requests, flush responses, park until the next
/// guest kick when neither side moved.
async fn pump(page: PageHandle, line: Arc<DoorbellLine>, inner: Arc<Mutex<Inner>>) {
    let requests = page.request_reader();
    let responses = page.response_writer();
    loop {
        let progress = {
            let mut state = inner.lock().expect("daemon state poisoned");
            let consumed = drain_requests(&requests, &mut state);
            let flushed = flush_responses(&responses, &mut state);
            if consumed || flushed {
                // Freed request-ring space and fresh response bytes both
                // warrant a guest wakeup.
                line.ring_guest();
            }
            consumed || flushed
        };
        if !progress {
            line.daemon_notified().await;
        }
    }
}

fn drain_requests(ring: &RingReader, state: &mut Inner) -> bool {
    let mut moved = false;
    let mut chunk = [0u8; 128];
    loop {
        let read = ring.read(&mut chunk);
        if read == 0 {
            break;
        }
        state.inbox.extend_from_slice(&chunk[..read]);
        moved = true;
    }
    while let Some((header, payload)) = take_message(&mut state.inbox) {
        dispatch(state, &header, &payload);
        moved = true;
    }
    moved
}

fn flush_responses(ring: &RingWriter, state: &mut Inner) -> bool {
    if state.outbox.is_empty() {
        return false;
    }
    let written = ring.write(&state.outbox);
    if written == 0 {
        return false;
    }
    state.outbox.drain(..written);
    true
}

fn take_message(inbox: &mut Vec<u8>) -> Option<(RawHeader, Vec<u8>)> {
    if inbox.len() < HEADER_SIZE {
        return None;
    }
    let word =
        |at: usize| u32::from_le_bytes([inbox[at], inbox[at + 1], inbox[at + 2], inbox[at + 3]]);
    let header = RawHeader {
        kind: word(0),
        request_id: word(4),
        transaction_id: word(8),
    };
    let length = word(12) as usize;
    if inbox.len() < HEADER_SIZE + length {
        return None;
    }
    let payload = inbox[HEADER_SIZE..HEADER_SIZE + length].to_vec();
    inbox.drain(..HEADER_SIZE + length);
    Some((header, payload))
}

fn dispatch(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let Some(kind) = MessageKind::from_wire(header.kind) else {
        push_error(state, header, "EINVAL");
        return;
    };
    state.kinds_seen.push(kind);
    debug!("daemon handling {kind:?} request {:#x}", header.request_id);
    match kind {
        MessageKind::Read => handle_read(state, header, payload),
        MessageKind::Write => handle_write(state, header, payload),
        MessageKind::Rm => handle_rm(state, header, payload),
        MessageKind::Directory => handle_directory(state, header, payload),
        MessageKind::Watch => handle_watch(state, header, payload),
        MessageKind::Unwatch => handle_unwatch(state, header, payload),
        MessageKind::TransactionStart => handle_transaction_start(state, header),
        MessageKind::TransactionEnd => handle_transaction_end(state, header, payload),
        _ => push_error(state, header, "EINVAL"),
    }
}

fn handle_read(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let outcome = parse_path(payload).ok_or("EINVAL").and_then(|path| {
        let tree = resolve_tree(state, header.transaction_id).ok_or("EINVAL")?;
        match tree.get(&path) {
            Some(value) => Ok(value.clone().into_bytes()),
            None if has_children(tree, &path) => Ok(Vec::new()),
            None => Err("ENOENT"),
        }
    });
    finish(state, MessageKind::Read, header, outcome);
}

fn handle_write(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let Some((path, value)) = parse_write(payload) else {
        push_error(state, header, "EINVAL");
        return;
    };
    if header.transaction_id == 0 {
        state.tree.insert(path.clone(), value);
        state.generation += 1;
        push_reply(state, MessageKind::Write, header, ok_payload());
        fire_watches(state, &path);
    } else if let Some(tx) = state.transactions.get_mut(&header.transaction_id) {
        tx.tree.insert(path, value);
        push_reply(state, MessageKind::Write, header, ok_payload());
    } else {
        push_error(state, header, "EINVAL");
    }
}

fn handle_rm(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let Some(path) = parse_path(payload) else {
        push_error(state, header, "EINVAL");
        return;
    };
    if header.transaction_id == 0 {
        if remove_subtree(&mut state.tree, &path) {
            state.generation += 1;
            push_reply(state, MessageKind::Rm, header, ok_payload());
            fire_watches(state, &path);
        } else {
            push_error(state, header, "ENOENT");
        }
    } else if let Some(tx) = state.transactions.get_mut(&header.transaction_id) {
        if remove_subtree(&mut tx.tree, &path) {
            push_reply(state, MessageKind::Rm, header, ok_payload());
        } else {
            push_error(state, header, "ENOENT");
        }
    } else {
        push_error(state, header, "EINVAL");
    }
}

fn handle_directory(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let outcome = parse_path(payload).ok_or("EINVAL").and_then(|path| {
        let tree = resolve_tree(state, header.transaction_id).ok_or("EINVAL")?;
        list_children(tree, &path)
    });
    finish(state, MessageKind::Directory, header, outcome);
}

fn handle_watch(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let Some((path, token)) = parse_pair(payload) else {
        push_error(state, header, "EINVAL");
        return;
    };
    state.watches.push(WatchRec {
        path: path.clone(),
        token: token.clone(),
    });
    push_reply(state, MessageKind::Watch, header, ok_payload());
    // The service confirms a new watch with one immediate event for the
    // watched path itself.
    push_event(state, &path, &token);
}

fn handle_unwatch(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    let Some((path, token)) = parse_pair(payload) else {
        push_error(state, header, "EINVAL");
        return;
    };
    let position = state
        .watches
        .iter()
        .position(|watch| watch.path == path && watch.token == token);
    match position {
        Some(at) => {
            state.watches.remove(at);
            push_reply(state, MessageKind::Unwatch, header, ok_payload());
        }
        None => push_error(state, header, "ENOENT"),
    }
}

fn handle_transaction_start(state: &mut Inner, header: &RawHeader) {
    let id = state.next_transaction;
    state.next_transaction += 1;
    state.transactions.insert(
        id,
        TxState {
            tree: state.tree.clone(),
            start_generation: state.generation,
        },
    );
    push_reply(
        state,
        MessageKind::TransactionStart,
        header,
        format!("{id}\0").into_bytes(),
    );
}

fn handle_transaction_end(state: &mut Inner, header: &RawHeader, payload: &[u8]) {
    // Ending destroys the transaction whatever the outcome; a conflicted
    // caller starts a fresh one.
    let Some(tx) = state.transactions.remove(&header.transaction_id) else {
        push_error(state, header, "EINVAL");
        return;
    };
    match payload.first() {
        Some(b'F') => push_reply(state, MessageKind::TransactionEnd, header, ok_payload()),
        Some(b'T') if tx.start_generation != state.generation => {
            push_error(state, header, "EAGAIN");
        }
        Some(b'T') => {
            let changed = diff_keys(&state.tree, &tx.tree);
            state.tree = tx.tree;
            state.generation += 1;
            push_reply(state, MessageKind::TransactionEnd, header, ok_payload());
            for path in changed {
                fire_watches(state, &path);
            }
        }
        _ => push_error(state, header, "EINVAL"),
    }
}

fn parse_path(payload: &[u8]) -> Option<String> {
    let end = payload.iter().position(|&byte| byte == 0)?;
    String::from_utf8(payload[..end].to_vec()).ok()
}

fn parse_write(payload: &[u8]) -> Option<(String, String)> {
    let end = payload.iter().position(|&byte| byte == 0)?;
    let path = String::from_utf8(payload[..end].to_vec()).ok()?;
    let value = String::from_utf8(payload[end + 1..].to_vec()).ok()?;
    Some((path, value))
}

fn parse_pair(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let first = payload.iter().position(|&byte| byte == 0)?;
    let path = String::from_utf8(payload[..first].to_vec()).ok()?;
    let rest = &payload[first + 1..];
    let second = rest.iter().position(|&byte| byte == 0)?;
    Some((path, rest[..second].to_vec()))
}

fn resolve_tree(state: &Inner, transaction_id: u32) -> Option<&BTreeMap<String, String>> {
    if transaction_id == 0 {
        Some(&state.tree)
    } else {
        state.transactions.get(&transaction_id).map(|tx| &tx.tree)
    }
}

fn has_children(tree: &BTreeMap<String, String>, path: &str) -> bool {
    let prefix = format!("{path}/");
    tree.range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

fn list_children(tree: &BTreeMap<String, String>, path: &str) -> Result<Vec<u8>, &'static str> {
    if !tree.contains_key(path) && !has_children(tree, path) {
        return Err("ENOENT");
    }
    let prefix = format!("{path}/");
    let mut out = Vec::new();
    let mut last: Option<String> = None;
    for key in tree.range(prefix.clone()..).map(|(key, _)| key) {
        let Some(rest) = key.strip_prefix(&prefix) else {
            break;
        };
        let child = rest.split('/').next().unwrap_or(rest).to_owned();
        if last.as_deref() != Some(child.as_str()) {
            out.extend_from_slice(child.as_bytes());
            out.push(0);
            last = Some(child);
        }
    }
    Ok(out)
}

fn remove_subtree(tree: &mut BTreeMap<String, String>, path: &str) -> bool {
    let mut removed = tree.remove(path).is_some();
    let prefix = format!("{path}/");
    let before = tree.len();
    tree.retain(|key, _| !key.starts_with(&prefix));
    removed |= tree.len() != before;
    removed
}

fn diff_keys(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(value))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(old.keys().filter(|key| !new.contains_key(*key)).cloned());
    changed
}

fn watch_covers(watch_path: &str, changed: &str) -> bool {
    changed == watch_path
        || changed
            .strip_prefix(watch_path)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn fire_watches(state: &mut Inner, changed: &str) {
    let hits: Vec<Vec<u8>> = state
        .watches
        .iter()
        .filter(|watch| watch_covers(&watch.path, changed))
        .map(|watch| watch.token.clone())
        .collect();
    for token in hits {
        push_event(state, changed, &token);
    }
}

fn push_event(state: &mut Inner, path: &str, token: &[u8]) {
    let mut payload = Vec::with_capacity(path.len() + token.len() + 2);
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    payload.extend_from_slice(token);
    payload.push(0);
    // Events always flow; only request replies can be held back.
    let frame = frame_bytes(MessageKind::WatchEvent, 0, 0, &payload);
    state.outbox.extend_from_slice(&frame);
}

fn finish(
    state: &mut Inner,
    kind: MessageKind,
    header: &RawHeader,
    outcome: Result<Vec<u8>, &'static str>,
) {
    match outcome {
        Ok(payload) => push_reply(state, kind, header, payload),
        Err(errno) => push_error(state, header, errno),
    }
}

fn ok_payload() -> Vec<u8> { b"OK\0".to_vec() }

fn frame_bytes(kind: MessageKind, request_id: u32, transaction_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        kind,
        request_id,
        transaction_id,
        payload_length: u32::try_from(payload.len()).expect("daemon payload fits the header"),
    };
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

fn push_reply(state: &mut Inner, kind: MessageKind, header: &RawHeader, payload: Vec<u8>) {
    let frame = frame_bytes(kind, header.request_id, header.transaction_id, &payload);
    if state.holding {
        state.held.push(frame);
    } else {
        state.outbox.extend_from_slice(&frame);
    }
}

fn push_error(state: &mut Inner, header: &RawHeader, errno: &'static str) {
    let mut payload = errno.as_bytes().to_vec();
    payload.push(0);
    let frame = frame_bytes(MessageKind::Error, header.request_id, header.transaction_id, &payload);
    if state.holding {
        state.held.push(frame);
    } else {
        state.outbox.extend_from_slice(&frame);
    }
}
