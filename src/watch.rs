//! Watch registrations and event tokens.
//!
//! A watch asks the peer to send an unsolicited event whenever a path (or
//! anything beneath it) changes. The wire token carries enough to route the
//! event back: the owning channel's instance nonce and a 16-bit watch id.
//! Events whose token fails to parse, names a foreign owner, or names a
//! dead id are spurious; they are logged and absorbed, never delivered.

use std::{collections::HashMap, panic::Location, sync::Arc};

use tokio::sync::Notify;
use tracing::warn;

/// Wire form of a watch token: `TOK|` + 16 hex digits + `|` + 4 hex digits.
pub(crate) const TOKEN_LENGTH: usize = 25;

/// Routing token carried in watch and event payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WatchToken {
    pub owner: u64,
    pub id: u16,
}

impl WatchToken {
    /// Render the wire form.
    pub(crate) fn encode(self) -> String {
        format!("TOK|{:016x}|{:04x}", self.owner, self.id)
    }

    /// Parse a wire token. Anything but the exact shape is rejected.
    pub(crate) fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != TOKEN_LENGTH {
            return None;
        }
        let text = std::str::from_utf8(raw).ok()?;
        let rest = text.strip_prefix("TOK|")?;
        let (owner, id) = rest.split_once('|')?;
        if owner.len() != 16 || id.len() != 4 {
            return None;
        }
        Some(Self {
            owner: u64::from_str_radix(owner, 16).ok()?,
            id: u16::from_str_radix(id, 16).ok()?,
        })
    }
}

/// One registered watch.
pub(crate) struct WatchEntry {
    path: String,
    notifier: Arc<Notify>,
    active: bool,
    origin: &'static Location<'static>,
}

impl WatchEntry {
    pub(crate) fn path(&self) -> &str { &self.path }

    pub(crate) fn is_active(&self) -> bool { self.active }
}

/// Diagnostic view of one registered watch.
#[derive(Clone, Copy, Debug)]
pub struct WatchSnapshot {
    /// Watch id within the owning channel.
    pub id: u16,
    /// Whether the peer currently knows about this watch.
    pub active: bool,
    /// Call site the watch was registered from.
    pub origin: &'static Location<'static>,
}

impl std::fmt::Display for WatchSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "watch {:04x} ({}) from {}",
            self.id,
            if self.active { "active" } else { "inactive" },
            self.origin
        )
    }
}

/// Table of live watches. All access happens under the channel lock.
pub(crate) struct WatchRegistry {
    owner: u64,
    next_id: u16,
    entries: HashMap<u16, WatchEntry>,
}

impl WatchRegistry {
    pub(crate) fn new(owner: u64) -> Self {
        Self { owner, next_id: 0, entries: HashMap::new() }
    }

    /// Record a watch and hand back its id and wire token. The record is
    /// live before the registration request is sent, so an event racing the
    /// reply still routes; a failed send unwinds with [`Self::unregister`].
    ///
    /// Returns `None` when every id is in use.
    pub(crate) fn register(
        &mut self,
        path: &str,
        notifier: Arc<Notify>,
        origin: &'static Location<'static>,
    ) -> Option<(u16, WatchToken)> {
        if self.entries.len() > usize::from(u16::MAX) {
            return None;
        }
        // Ids of long-dead watches recycle; live ones are skipped.
        let mut id = self.next_id;
        while self.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        self.entries.insert(id, WatchEntry {
            path: path.to_owned(),
            notifier,
            active: true,
            origin,
        });
        Some((id, WatchToken { owner: self.owner, id }))
    }

    /// Drop a registration, returning its record when it was live.
    pub(crate) fn unregister(&mut self, id: u16) -> Option<WatchEntry> {
        self.entries.remove(&id)
    }

    pub(crate) fn get(&self, id: u16) -> Option<&WatchEntry> { self.entries.get(&id) }

    /// Wire token for a live watch.
    pub(crate) fn token(&self, id: u16) -> WatchToken {
        WatchToken { owner: self.owner, id }
    }

    /// Route an event to the watch its token names.
    ///
    /// Delivery is edge-triggered: the notifier collapses repeated signals
    /// and the waiter re-reads the watched path itself.
    pub(crate) fn deliver(&self, raw_token: &[u8], changed_path: &[u8]) -> bool {
        let Some(token) = WatchToken::decode(raw_token) else {
            warn!(token = ?raw_token, "spurious watch event: unparseable token");
            return false;
        };
        if token.owner != self.owner {
            warn!(owner = token.owner, "spurious watch event: foreign owner");
            return false;
        }
        let Some(entry) = self.entries.get(&token.id) else {
            warn!(id = token.id, "spurious watch event: unknown watch id");
            return false;
        };
        tracing::debug!(
            id = token.id,
            path = %String::from_utf8_lossy(changed_path),
            "watch event"
        );
        // An inactive watch (suspend in progress) swallows the edge; the
        // late recovery phase re-signals every watch to compensate.
        if entry.active {
            entry.notifier.notify_one();
        }
        true
    }

    /// Mark every watch inactive: the peer that knew about them is gone.
    pub(crate) fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.active = false;
        }
    }

    /// Signal every notifier unconditionally. Watchers re-examine their
    /// paths and re-register; missed edges across suspend are thereby
    /// compensated.
    pub(crate) fn signal_all(&self) {
        for entry in self.entries.values() {
            entry.notifier.notify_one();
        }
    }

    /// Number of live registrations.
    pub(crate) fn outstanding(&self) -> usize { self.entries.len() }

    /// Snapshot for diagnostics and teardown audits, ordered by id.
    pub(crate) fn snapshot(&self) -> Vec<WatchSnapshot> {
        let mut entries: Vec<WatchSnapshot> = self
            .entries
            .iter()
            .map(|(&id, entry)| WatchSnapshot { id, active: entry.active, origin: entry.origin })
            .collect();
        entries.sort_by_key(|snapshot| snapshot.id);
        entries
    }
}

/// Opaque handle naming one watch registration.
///
/// Handles are deliberately not clonable: a registration has one owner,
/// and unsubscription goes through the owning store.
#[derive(Debug, PartialEq, Eq)]
pub struct WatchHandle {
    pub(crate) id: u16,
}

impl WatchHandle {
    /// Watch id, as the wire token carries it.
    #[must_use]
    pub const fn id(&self) -> u16 { self.id }
}
