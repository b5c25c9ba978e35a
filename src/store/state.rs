//! Channel state machine.
//!
//! Everything the submitters and the background drain share lives here and
//! is reached only under the store's single lock: the ring endpoints, the
//! request queues, the reusable response slot, and the watch, transaction,
//! and buffer registries. [`ChannelState::poll`] is the only code that
//! moves bytes, and it runs identically whichever party is driving it.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::SystemTime,
};

use log::{debug, info, warn};
use tokio::sync::Notify;

use crate::{
    buffer::{BufferArena, StoreBuffer},
    codec::{MessageHeader, MessageKind, WireError},
    doorbell::Doorbell,
    error::{PeerErrno, StoreError},
    metrics,
    platform::Platform,
    request::{RequestState, StoreRequest},
    response::ResponseSlot,
    ring::PageHandle,
    store::Diagnostics,
    transaction::TransactionRegistry,
    watch::WatchRegistry,
};

/// Terminal failure of the channel plumbing.
///
/// A fault fails every in-flight request and every later submission. There
/// is no recovery short of tearing the store down: once response framing is
/// lost the byte stream has no resynchronisation point.
#[derive(Clone, Debug)]
pub(crate) enum ChannelFault {
    /// The response byte stream lost framing.
    Wire(WireError),
    /// The doorbell binding is gone and could not be replaced.
    DoorbellLost,
}

impl ChannelFault {
    fn to_error(&self) -> StoreError {
        match self {
            Self::Wire(error) => StoreError::Wire(error.clone()),
            Self::DoorbellLost => StoreError::Io(std::io::ErrorKind::BrokenPipe.into()),
        }
    }
}

/// Shared channel state, guarded by the store's lock.
pub(crate) struct ChannelState {
    page: PageHandle,
    doorbell: Arc<dyn Doorbell>,
    doorbell_epoch: u64,
    kick: Arc<Notify>,
    slot: ResponseSlot,
    next_request_id: u16,
    submitted: VecDeque<StoreRequest>,
    pending: Vec<StoreRequest>,
    completed: Vec<StoreRequest>,
    pub(crate) watches: WatchRegistry,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) arena: BufferArena,
    fault: Option<ChannelFault>,
    closed: bool,
}

impl ChannelState {
    pub(crate) fn new(page: PageHandle, doorbell: Arc<dyn Doorbell>, kick: Arc<Notify>) -> Self {
        let clock = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        // Seeded from the clock so a restarted channel does not alias its
        // predecessor's request ids or watch tokens.
        let owner = clock.as_secs().rotate_left(32) ^ u64::from(clock.subsec_nanos());
        let seed = u16::try_from(owner & 0xffff).unwrap_or_default();
        Self {
            page,
            doorbell,
            doorbell_epoch: 0,
            kick,
            slot: ResponseSlot::new(),
            next_request_id: seed,
            submitted: VecDeque::new(),
            pending: Vec::new(),
            completed: Vec::new(),
            watches: WatchRegistry::new(owner),
            transactions: TransactionRegistry::new(),
            arena: BufferArena::new(),
            fault: None,
            closed: false,
        }
    }

    /// Current doorbell binding, for the drain task to wait on.
    pub(crate) fn doorbell(&self) -> Arc<dyn Doorbell> { Arc::clone(&self.doorbell) }

    /// Generation counter of the doorbell binding; bumped on every rebind so
    /// a waiter can tell a replaced doorbell from a lost one.
    pub(crate) fn doorbell_epoch(&self) -> u64 { self.doorbell_epoch }

    /// Re-enable inbound doorbell delivery, kicking the drain task when a
    /// signal arrived while masked.
    pub(crate) fn unmask_doorbell(&self) {
        if self.doorbell.unmask() {
            self.kick.notify_one();
        }
    }

    /// Whether the channel still accepts submissions.
    ///
    /// # Errors
    ///
    /// Reports the stored fault, or [`StoreError::ChannelClosed`] after
    /// shutdown began.
    pub(crate) fn ensure_live(&self) -> crate::error::Result<()> {
        if self.closed {
            return Err(StoreError::ChannelClosed);
        }
        match &self.fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    pub(crate) fn is_faulted(&self) -> bool { self.fault.is_some() }

    /// Next correlation id. The counter is 16 bits wide and free-running;
    /// the peer echoes whatever it is given.
    pub(crate) fn allocate_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        u32::from(id)
    }

    /// Queue a prepared request for transmission.
    pub(crate) fn enqueue(&mut self, mut request: StoreRequest) {
        request.mark_submitted();
        metrics::request_submitted();
        self.submitted.push_back(request);
    }

    /// Collect the outcome of a completed request, if it has one yet.
    pub(crate) fn take_completed(
        &mut self,
        request_id: u32,
    ) -> Option<crate::error::Result<StoreBuffer>> {
        let position = self
            .completed
            .iter()
            .position(|request| request.request_id() == request_id)?;
        Some(self.completed.remove(position).into_outcome())
    }

    /// Drive both rings until neither makes progress: push queued request
    /// bytes, pull and demultiplex response bytes, and ring the doorbell
    /// after traffic in either direction.
    pub(crate) fn poll(&mut self) {
        if self.fault.is_some() {
            return;
        }
        loop {
            let written = self.send_submitted();
            if written != 0 {
                self.doorbell.signal();
            }
            let read = match self.receive_one() {
                Ok(read) => read,
                Err(error) => {
                    self.fail(ChannelFault::Wire(error));
                    return;
                }
            };
            if read != 0 {
                self.doorbell.signal();
            }
            if written == 0 && read == 0 {
                return;
            }
        }
    }

    /// Write queued requests head-first. A request that cannot finish stops
    /// the pass; completed ones move to the pending list in order.
    fn send_submitted(&mut self) -> usize {
        let writer = self.page.request_writer();
        let mut written = 0;
        while let Some(request) = self.submitted.front_mut() {
            written += request.send(&writer);
            if request.state() != RequestState::Pending {
                break;
            }
            if let Some(request) = self.submitted.pop_front() {
                self.pending.push(request);
            }
        }
        written
    }

    /// Pull response bytes into the slot and demultiplex a completed
    /// message.
    fn receive_one(&mut self) -> Result<usize, WireError> {
        let reader = self.page.response_reader();
        let outcome = self.slot.receive(&reader)?;
        if let Some(header) = outcome.message {
            self.process_response(header);
            self.slot.reset();
        }
        Ok(outcome.read)
    }

    /// Route one fully buffered response: administrative kinds are dropped,
    /// watch events go to the watch registry, everything else completes the
    /// pending request its id names.
    fn process_response(&mut self, header: MessageHeader) {
        if header.kind.is_ignorable() {
            warn!(
                "ignoring response kind {:?} (request id {:#06x})",
                header.kind, header.request_id
            );
            metrics::response_discarded(metrics::DiscardReason::Unsolicited);
            return;
        }
        if header.kind == MessageKind::WatchEvent {
            debug_assert_eq!(header.request_id, 0);
            self.process_watch_event();
            return;
        }
        let Some(position) = self
            .pending
            .iter()
            .position(|request| request.request_id() == header.request_id)
        else {
            warn!("spurious response id {:#06x}", header.request_id);
            metrics::response_discarded(metrics::DiscardReason::Spurious);
            return;
        };
        let mut request = self.pending.remove(position);
        debug_assert!(header.kind == MessageKind::Error || header.kind == request.kind());
        let outcome = if header.kind == MessageKind::Error {
            Err(peer_error(self.slot.payload()))
        } else {
            Ok(self.arena.copy_out(self.slot.payload(), request.origin()))
        };
        request.complete(outcome);
        metrics::response_matched();
        self.completed.push(request);
    }

    fn process_watch_event(&mut self) {
        let payload = self.slot.payload();
        let mut parts = payload.split(|&byte| byte == 0);
        let (Some(path), Some(token)) = (parts.next(), parts.next()) else {
            warn!("malformed watch event ({} bytes)", payload.len());
            metrics::response_discarded(metrics::DiscardReason::Malformed);
            return;
        };
        if self.watches.deliver(token, path) {
            metrics::watch_event();
        } else {
            metrics::response_discarded(metrics::DiscardReason::Spurious);
        }
    }

    /// Poison the channel: every queued and pending request completes with
    /// the fault, and later submissions are refused.
    pub(crate) fn fail(&mut self, fault: ChannelFault) {
        if self.fault.is_some() {
            return;
        }
        warn!("store channel failed: {fault:?}");
        for mut request in self.submitted.drain(..).chain(self.pending.drain(..)) {
            request.fail(fault.to_error());
            self.completed.push(request);
        }
        self.fault = Some(fault);
    }

    /// Early suspend phase. The page identity must survive the cycle;
    /// everything the peer knew about the channel does not, so every open
    /// transaction and watch is marked inactive.
    pub(crate) fn suspend_early(&mut self, platform: &dyn Platform) {
        let page = platform.store_page();
        assert_eq!(
            page.frame(),
            self.page.frame(),
            "store ring page moved across suspend"
        );
        self.page = page;
        self.transactions.invalidate_all();
        self.watches.invalidate_all();
    }

    /// Late suspend phase: discard any half-received response, rebind the
    /// doorbell at the freshly reported port, and re-signal every watch so
    /// no waiter sleeps through a change that happened while suspended.
    pub(crate) fn suspend_late(&mut self, platform: &dyn Platform) {
        self.slot.reset();
        let port = platform.store_port();
        match platform.open_doorbell(port) {
            Ok(doorbell) => {
                // The previous binding closes once the drain task drops its
                // clone of the old handle.
                self.doorbell = doorbell;
                self.doorbell_epoch += 1;
                if self.doorbell.unmask() {
                    debug!("doorbell signal was pending across resume");
                }
                info!("doorbell rebound at {port}");
            }
            Err(error) => {
                warn!("doorbell reopen at {port} failed: {error}");
                self.fail(ChannelFault::DoorbellLost);
            }
        }
        self.watches.signal_all();
        // Wake the drain task: it must drop the old doorbell and run a pass
        // for any traffic that arrived while the channel was down.
        self.kick.notify_one();
    }

    /// Refuse further submissions. In-flight requests cannot exist here:
    /// their submitters hold the channel lock until completion.
    pub(crate) fn close(&mut self) {
        debug_assert!(self.submitted.is_empty());
        debug_assert!(self.pending.is_empty());
        self.closed = true;
    }

    /// Human-readable list of every record a caller has not released.
    pub(crate) fn leak_report(&self) -> Vec<String> {
        let mut report: Vec<String> = Vec::new();
        report.extend(self.arena.snapshot().iter().map(ToString::to_string));
        report.extend(self.watches.snapshot().iter().map(ToString::to_string));
        report.extend(self.transactions.snapshot().iter().map(ToString::to_string));
        report
    }

    pub(crate) fn diagnostics(&self, suspend_cycles: u64) -> Diagnostics {
        Diagnostics {
            frame: self.page.frame(),
            cursors: self.page.cursors(),
            suspend_cycles,
            submitted: self.submitted.len(),
            pending: self.pending.len(),
            buffers: self.arena.snapshot(),
            watches: self.watches.snapshot(),
            transactions: self.transactions.snapshot(),
        }
    }
}

/// Map an `Error` response payload to the errno it names.
fn peer_error(payload: &[u8]) -> StoreError {
    let name = payload.split(|&byte| byte == 0).next().unwrap_or_default();
    match std::str::from_utf8(name).ok().and_then(PeerErrno::from_wire_name) {
        Some(errno) => StoreError::Peer(errno),
        None => StoreError::UnknownPeerError {
            name: String::from_utf8_lossy(name).into_owned(),
        },
    }
}
