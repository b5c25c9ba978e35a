//! Client surface of the store channel.
//!
//! A [`Store`] owns one shared-page channel to the store service: the ring
//! endpoints, the doorbell, and a background drain task that keeps the
//! response ring moving when no caller is waiting. Operations are
//! synchronous at the protocol level: a submitter drives the rings itself,
//! under the channel lock, until its own reply arrives. The lock is the
//! channel's single mutual-exclusion domain, so submission, background
//! draining, and suspend recovery serialise against each other and nothing
//! else.

mod state;

use std::{fmt, panic::Location, sync::Arc};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    sync::{Mutex, Notify},
    task::{JoinHandle, yield_now},
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{BufferSnapshot, StoreBuffer},
    codec::{MessageKind, Segment},
    error::StoreError,
    platform::Platform,
    request::StoreRequest,
    ring::RingCursors,
    suspend::{SuspendCoordinator, SuspendPhase},
    transaction::{EndStatus, Transaction, TransactionSnapshot},
    watch::{WatchHandle, WatchSnapshot},
};
use state::{ChannelFault, ChannelState};

/// Snapshot of channel health for logs and crash dumps.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    /// Machine frame backing the shared page.
    pub frame: u64,
    /// Ring cursor values at the time of the snapshot.
    pub cursors: RingCursors,
    /// Completed suspend/resume cycles.
    pub suspend_cycles: u64,
    /// Requests queued but not yet fully written.
    pub submitted: usize,
    /// Requests on the peer's side awaiting a response.
    pub pending: usize,
    /// Live payload buffers with their owning call sites.
    pub buffers: Vec<BufferSnapshot>,
    /// Registered watches.
    pub watches: Vec<WatchSnapshot>,
    /// Open transactions.
    pub transactions: Vec<TransactionSnapshot>,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frame {:#x}, {}", self.frame, self.cursors)?;
        writeln!(
            f,
            "suspend cycles {}, submitted {}, pending {}",
            self.suspend_cycles, self.submitted, self.pending
        )?;
        for buffer in &self.buffers {
            writeln!(f, "{buffer}")?;
        }
        for watch in &self.watches {
            writeln!(f, "{watch}")?;
        }
        for transaction in &self.transactions {
            writeln!(f, "{transaction}")?;
        }
        Ok(())
    }
}

struct ChannelShell {
    state: ChannelState,
    suspend: SuspendCoordinator<ChannelState>,
}

struct Shared {
    channel: Mutex<ChannelShell>,
}

/// Guest-side client of the store service.
pub struct Store {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    drain: Option<JoinHandle<()>>,
}

impl Store {
    /// Bring the channel up on the platform's shared page and doorbell and
    /// start the background drain task.
    ///
    /// # Errors
    ///
    /// Fails when the doorbell port cannot be bound.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn attach(platform: Arc<dyn Platform>) -> crate::error::Result<Self> {
        let page = platform.store_page();
        let port = platform.store_port();
        let doorbell = platform.open_doorbell(port)?;
        let kick = Arc::new(Notify::new());
        let state = ChannelState::new(page, doorbell, Arc::clone(&kick));
        state.unmask_doorbell();
        info!("store channel attached at {port}, frame {:#x}", page.frame());

        let mut suspend = SuspendCoordinator::new();
        let early = Arc::clone(&platform);
        suspend.register(SuspendPhase::Early, move |state: &mut ChannelState| {
            state.suspend_early(early.as_ref());
        });
        let late = Arc::clone(&platform);
        suspend.register(SuspendPhase::Late, move |state: &mut ChannelState| {
            state.suspend_late(late.as_ref());
        });

        let shared = Arc::new(Shared {
            channel: Mutex::new(ChannelShell { state, suspend }),
        });
        let cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_loop(Arc::clone(&shared), cancel.clone(), kick));
        Ok(Self { shared, cancel, drain: Some(drain) })
    }

    /// Read the value of a node.
    ///
    /// # Errors
    ///
    /// Fails with the peer's errno (`ENOENT` for a missing node), with
    /// [`StoreError::TransactionInactive`] when `transaction` was
    /// invalidated by a suspend cycle, or with the channel's fault.
    #[track_caller]
    pub async fn read(
        &self,
        transaction: Option<&Transaction>,
        prefix: Option<&str>,
        node: &str,
    ) -> crate::error::Result<StoreBuffer> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let transaction_id = transaction_id(state, transaction)?;
        submit(state, MessageKind::Read, transaction_id, path_payload(prefix, node), origin).await
    }

    /// Write `value` to a node, creating it if necessary.
    ///
    /// # Errors
    ///
    /// As for [`read`](Self::read), plus `E2BIG`-class rejections surface
    /// as [`WireError::OversizedPayload`](crate::codec::WireError) before
    /// any byte reaches the ring.
    #[track_caller]
    pub async fn write(
        &self,
        transaction: Option<&Transaction>,
        prefix: Option<&str>,
        node: &str,
        value: &str,
    ) -> crate::error::Result<()> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let transaction_id = transaction_id(state, transaction)?;
        let mut payload = path_payload(prefix, node);
        payload.push(Segment::new(Bytes::copy_from_slice(value.as_bytes())));
        submit(state, MessageKind::Write, transaction_id, payload, origin)
            .await
            .map(drop)
    }

    /// Write a formatted value to a node.
    ///
    /// The value is rendered before submission, so the returned future does
    /// not borrow the format arguments.
    ///
    /// # Errors
    ///
    /// As for [`write`](Self::write).
    #[track_caller]
    pub fn write_fmt<'a>(
        &'a self,
        transaction: Option<&'a Transaction>,
        prefix: Option<&'a str>,
        node: &'a str,
        value: fmt::Arguments<'_>,
    ) -> impl Future<Output = crate::error::Result<()>> + use<'a> {
        let origin = Location::caller();
        let rendered = value.to_string();
        async move {
            let mut shell = self.shared.channel.lock().await;
            let state = &mut shell.state;
            let transaction_id = transaction_id(state, transaction)?;
            let mut payload = path_payload(prefix, node);
            payload.push(Segment::new(Bytes::from(rendered.into_bytes())));
            submit(state, MessageKind::Write, transaction_id, payload, origin)
                .await
                .map(drop)
        }
    }

    /// Delete a node and everything beneath it.
    ///
    /// # Errors
    ///
    /// As for [`read`](Self::read).
    #[track_caller]
    pub async fn remove(
        &self,
        transaction: Option<&Transaction>,
        prefix: Option<&str>,
        node: &str,
    ) -> crate::error::Result<()> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let transaction_id = transaction_id(state, transaction)?;
        submit(state, MessageKind::Rm, transaction_id, path_payload(prefix, node), origin)
            .await
            .map(drop)
    }

    /// List the children of a node.
    ///
    /// The returned buffer holds the child names as a NUL-separated list;
    /// walk it with [`StoreBuffer::entries`].
    ///
    /// # Errors
    ///
    /// As for [`read`](Self::read).
    #[track_caller]
    pub async fn directory(
        &self,
        transaction: Option<&Transaction>,
        prefix: Option<&str>,
        node: &str,
    ) -> crate::error::Result<StoreBuffer> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let transaction_id = transaction_id(state, transaction)?;
        submit(
            state,
            MessageKind::Directory,
            transaction_id,
            path_payload(prefix, node),
            origin,
        )
        .await
    }

    /// Subscribe to changes at a path.
    ///
    /// The registration is recorded before the request is sent, so an event
    /// racing the acknowledgement still routes. `notifier` is signalled
    /// edge-triggered: repeated events collapse and the waiter re-reads the
    /// watched path itself.
    ///
    /// # Errors
    ///
    /// Fails with the peer's errno or the channel's fault; the registration
    /// is unwound on failure.
    #[track_caller]
    pub async fn watch(
        &self,
        prefix: Option<&str>,
        node: &str,
        notifier: Arc<Notify>,
    ) -> crate::error::Result<WatchHandle> {
        let origin = Location::caller();
        let path = join_path(prefix, node);
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        state.ensure_live()?;
        let (id, token) = state
            .watches
            .register(&path, notifier, origin)
            .ok_or(StoreError::WatchTableFull)?;
        let payload = vec![
            Segment::new(Bytes::from(path.into_bytes())),
            Segment::nul(),
            Segment::new(Bytes::from(token.encode().into_bytes())),
            Segment::nul(),
        ];
        match submit(state, MessageKind::Watch, 0, payload, origin).await {
            Ok(ack) => {
                drop(ack);
                Ok(WatchHandle { id })
            }
            Err(error) => {
                state.watches.unregister(id);
                Err(error)
            }
        }
    }

    /// Unsubscribe a watch.
    ///
    /// A watch invalidated by suspend is released locally without a wire
    /// round-trip: the peer that knew about it is gone. A faulted channel
    /// releases locally too, since no peer is left to tell.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::BadHandle`] when the handle no longer names
    /// a live registration (a repeated unsubscribe). A peer error leaves
    /// the registration in place: the peer still holds it.
    #[track_caller]
    pub async fn unwatch(&self, watch: &WatchHandle) -> crate::error::Result<()> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let entry = state.watches.get(watch.id()).ok_or(StoreError::BadHandle)?;
        if !entry.is_active() {
            state.watches.unregister(watch.id());
            return Ok(());
        }
        let token = state.watches.token(watch.id());
        let payload = vec![
            Segment::new(Bytes::copy_from_slice(entry.path().as_bytes())),
            Segment::nul(),
            Segment::new(Bytes::from(token.encode().into_bytes())),
            Segment::nul(),
        ];
        match submit(state, MessageKind::Unwatch, 0, payload, origin).await {
            Ok(ack) => {
                drop(ack);
                state.watches.unregister(watch.id());
                Ok(())
            }
            Err(_) if state.is_faulted() => {
                state.watches.unregister(watch.id());
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Fails with the peer's errno, the channel's fault, or
    /// [`StoreError::MalformedPayload`] when the reply does not carry a
    /// nonzero decimal id.
    #[track_caller]
    pub async fn transaction_start(&self) -> crate::error::Result<Transaction> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let reply = submit(
            state,
            MessageKind::TransactionStart,
            0,
            vec![Segment::nul()],
            origin,
        )
        .await?;
        let peer_id = std::str::from_utf8(reply.value())
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|&id| id != 0)
            .ok_or(StoreError::MalformedPayload { context: "transaction-start" })?;
        drop(reply);
        let key = state.transactions.register(peer_id, origin);
        debug!("transaction {peer_id} opened");
        Ok(Transaction { key })
    }

    /// Commit or abort a transaction, consuming the handle.
    ///
    /// A handle invalidated by suspend finalises locally and reports
    /// [`EndStatus::Retry`] without a wire round-trip, as does the peer's
    /// conflict signal (`EAGAIN`); the caller restarts the whole
    /// transaction in both cases.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::BadHandle`] for an unknown handle or with
    /// the peer's non-retry errno. The record is released in every case.
    #[track_caller]
    pub async fn transaction_end(
        &self,
        transaction: Transaction,
        commit: bool,
    ) -> crate::error::Result<EndStatus> {
        let origin = Location::caller();
        let mut shell = self.shared.channel.lock().await;
        let state = &mut shell.state;
        let entry = state
            .transactions
            .entry(transaction.key)
            .ok_or(StoreError::BadHandle)?;
        if !entry.is_active() {
            state.transactions.remove(transaction.key);
            return Ok(EndStatus::Retry);
        }
        let peer_id = entry.peer_id();
        let flag = if commit {
            Bytes::from_static(b"T\0")
        } else {
            Bytes::from_static(b"F\0")
        };
        let outcome = submit(
            state,
            MessageKind::TransactionEnd,
            peer_id,
            vec![Segment::new(flag)],
            origin,
        )
        .await;
        state.transactions.remove(transaction.key);
        match outcome {
            Ok(ack) => {
                drop(ack);
                debug!("transaction {peer_id} ended");
                Ok(EndStatus::Completed)
            }
            Err(error) if error.is_retry() => Ok(EndStatus::Retry),
            Err(error) => Err(error),
        }
    }

    /// Release a payload buffer. Buffers also release themselves when
    /// dropped; this spelling makes the release visible at the call site.
    pub fn free(buffer: StoreBuffer) {
        drop(buffer);
    }

    /// Snapshot of channel health: cursors, queue depths, and every live
    /// buffer, watch, and transaction with its owning call site.
    pub async fn diagnostics(&self) -> Diagnostics {
        let shell = self.shared.channel.lock().await;
        shell.state.diagnostics(shell.suspend.count())
    }

    /// Run one complete suspend/resume transition.
    ///
    /// The entire transition holds the channel lock, so it cannot overlap a
    /// submission: callers observe the channel strictly before or strictly
    /// after the cycle.
    pub async fn suspend(&self) {
        let mut shell = self.shared.channel.lock().await;
        let shell = &mut *shell;
        shell.suspend.run(&mut shell.state);
    }

    /// Completed suspend/resume cycles since attach.
    pub async fn suspend_count(&self) -> u64 {
        self.shared.channel.lock().await.suspend.count()
    }

    /// Stop the drain task and tear the channel down.
    ///
    /// # Panics
    ///
    /// Panics when any buffer, watch, or transaction is still live: a leak
    /// here means a caller holds a transport-owned resource past the life
    /// of the transport, and continuing would turn it into a dangling
    /// reference to the shared page's peer state.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(drain) = self.drain.take() {
            if let Err(error) = drain.await {
                warn!("drain task join failed: {error}");
            }
        }
        let mut shell = self.shared.channel.lock().await;
        shell.state.close();
        let leaks = shell.state.leak_report();
        assert!(
            leaks.is_empty(),
            "store shut down with unreleased records:\n{}",
            leaks.join("\n")
        );
        info!("store channel shut down");
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Background half of the channel: waits for the peer's doorbell and runs
/// drain passes nobody is foregrounding. Exits on cancellation or fault.
async fn drain_loop(shared: Arc<Shared>, cancel: CancellationToken, kick: Arc<Notify>) {
    loop {
        let (doorbell, epoch) = {
            let mut shell = shared.channel.lock().await;
            shell.state.poll();
            if shell.state.is_faulted() {
                break;
            }
            (shell.state.doorbell(), shell.state.doorbell_epoch())
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = kick.notified() => {}
            result = doorbell.wait() => {
                if let Err(error) = result {
                    let mut shell = shared.channel.lock().await;
                    if shell.state.doorbell_epoch() == epoch {
                        warn!("doorbell connection lost: {error}");
                        shell.state.fail(ChannelFault::DoorbellLost);
                        break;
                    }
                    debug!("doorbell rebound while waiting");
                }
            }
        }
    }
    debug!("drain task stopped");
}

/// Push one prepared request through the channel and busy-wait, with
/// cooperative yields, until its response arrives. The caller's lock is
/// held throughout: the submitter is the drain while it waits.
async fn submit(
    state: &mut ChannelState,
    kind: MessageKind,
    transaction_id: u32,
    payload: Vec<Segment>,
    origin: &'static Location<'static>,
) -> crate::error::Result<StoreBuffer> {
    state.ensure_live()?;
    let request_id = state.allocate_request_id();
    let request = StoreRequest::prepare(kind, request_id, transaction_id, payload, origin)?;
    state.enqueue(request);
    loop {
        state.poll();
        if let Some(outcome) = state.take_completed(request_id) {
            return outcome;
        }
        state.ensure_live()?;
        yield_now().await;
    }
}

/// Resolve an optional transaction handle to the id quoted on the wire.
fn transaction_id(
    state: &ChannelState,
    transaction: Option<&Transaction>,
) -> crate::error::Result<u32> {
    match transaction {
        None => Ok(0),
        Some(handle) => {
            let entry = state
                .transactions
                .entry(handle.key)
                .ok_or(StoreError::BadHandle)?;
            if entry.is_active() {
                Ok(entry.peer_id())
            } else {
                Err(StoreError::TransactionInactive)
            }
        }
    }
}

/// Payload segments for a path-taking operation: `prefix/node` when a
/// prefix is supplied, `node` otherwise, NUL-terminated either way.
fn path_payload(prefix: Option<&str>, node: &str) -> Vec<Segment> {
    let mut payload = Vec::with_capacity(4);
    if let Some(prefix) = prefix {
        payload.push(Segment::new(Bytes::copy_from_slice(prefix.as_bytes())));
        payload.push(Segment::new(Bytes::from_static(b"/")));
    }
    payload.push(Segment::new(Bytes::copy_from_slice(node.as_bytes())));
    payload.push(Segment::nul());
    payload
}

/// Join a prefix and node the way the wire does.
fn join_path(prefix: Option<&str>, node: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}/{node}"),
        None => node.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_payload_joins_with_a_separator() {
        let segments = path_payload(Some("device"), "vif/0");
        let flat: Vec<u8> = segments
            .iter()
            .flat_map(|segment| segment.remaining().to_vec())
            .collect();
        assert_eq!(flat, b"device/vif/0\0");

        let bare: Vec<u8> = path_payload(None, "control")
            .iter()
            .flat_map(|segment| segment.remaining().to_vec())
            .collect();
        assert_eq!(bare, b"control\0");
    }

    #[test]
    fn join_path_matches_the_wire_form() {
        assert_eq!(join_path(Some("device"), "vif"), "device/vif");
        assert_eq!(join_path(None, "control"), "control");
    }
}
