//! A set of open connections with broadcast and auto-eviction.
//!
//! A [`Registry`] is an ordinary value (cheaply cloneable, internally
//! shared) owned by whatever context creates it; there is no process-wide
//! state. Adding a connection installs a watcher that evicts the entry when
//! the connection reaches `Closed`, which covers both clean closes and
//! error terminations. Membership never extends a connection's lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::connection::{Connection, MessagePayload, ReadyState};

type Members = Mutex<HashMap<u64, Connection>>;

/// A registry of live [`Connection`] handles.
///
/// ```no_run
/// # async fn example(conn: wavesock::Connection) {
/// let registry = wavesock::Registry::new();
/// registry.add(conn);
/// registry.broadcast("ping all");
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Members>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connection and installs its eviction watcher.
    ///
    /// A connection belongs to at most one registry; adding one that is
    /// already registered is a no-op. Returns the connection for chaining.
    pub fn add(&self, conn: Connection) -> Connection {
        if !conn.mark_registered() {
            log::debug!("connection already belongs to a registry");
            return conn;
        }

        self.inner
            .lock()
            .expect("registry lock")
            .insert(conn.id(), conn.clone());

        // The watcher holds the members weakly so an abandoned registry can
        // be dropped while its connections live on.
        let members: Weak<Members> = Arc::downgrade(&self.inner);
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(members) = members.upgrade() {
                members
                    .lock()
                    .expect("registry lock")
                    .remove(&watched.id());
            }
            watched.clear_registered();
        });

        conn
    }

    /// Removes a connection. Returns whether it was present.
    pub fn remove(&self, conn: &Connection) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("registry lock")
            .remove(&conn.id())
            .is_some();
        if removed {
            conn.clear_registered();
        }
        removed
    }

    /// Whether the connection is currently a member.
    pub fn contains(&self, conn: &Connection) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .contains_key(&conn.id())
    }

    /// Sends `data` to every member currently in `Open`, skipping the rest.
    ///
    /// Sends are enqueued without waiting for delivery and individual
    /// failures are swallowed, so one slow or dying peer cannot stall the
    /// others. Returns the number of members the message was enqueued to.
    pub fn broadcast(&self, data: impl Into<MessagePayload>) -> usize {
        let data = data.into();
        let members: Vec<Connection> = self
            .inner
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();

        let mut sent = 0;
        for conn in members {
            if conn.ready_state() == ReadyState::Open {
                conn.send_detached(data.clone());
                sent += 1;
            }
        }
        sent
    }

    /// The number of members.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").len()
    }

    /// Whether the registry has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the current members.
    pub fn members(&self) -> Vec<Connection> {
        self.inner
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }
}
