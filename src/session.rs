// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Sessions handling.
//!
//! The engine itself only moves session cookies around; storage lives
//! behind the [`SessionManager`] trait. The crate ships an in-memory
//! implementation good enough for embedded use and tests.
//!
//! A session created by a handler is only persisted if the handler actually
//! put data in it: a new, never-used session is silently dropped when the
//! response is written, so probing clients don't fill the store.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::SystemTime;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// One client session.
///
/// Cloning produces a snapshot; only `save` on the manager makes changes
/// visible to other requests.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    last_touched: SystemTime,
    data: HashMap<String, String>,
    invalidated: bool,
    fresh: bool,
}

impl Session {
    /// Creates a fresh session with a new random id.
    pub fn new() -> Session {
        Session {
            id: generate_session_id(),
            last_touched: SystemTime::now(),
            data: HashMap::new(),
            invalidated: false,
            fresh: true,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of entries stored in the session.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|v| v.as_str())
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.data.remove(key)
    }

    /// Marks the session as dead. The engine expires its cookie and removes
    /// it from the manager when the response is written.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// True until the session has been saved for the first time.
    #[inline]
    pub fn is_new(&self) -> bool {
        self.fresh
    }

    pub fn last_touched(&self) -> SystemTime {
        self.last_touched
    }

    fn touch(&mut self) {
        self.last_touched = SystemTime::now();
    }

    fn mark_saved(&mut self) {
        self.fresh = false;
        self.touch();
    }
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

/// Storage backend for sessions.
pub trait SessionManager: Send + Sync {
    /// Returns a snapshot of the live session with this id, touching it.
    fn find(&self, id: &str) -> Option<Session>;

    /// Persists the session.
    fn save(&self, session: &Session);

    /// Removes the session with this id.
    fn remove(&self, id: &str);

    /// How long a session lives without being touched.
    fn timeout(&self) -> Duration;
}

/// Mutex-guarded in-memory session store.
pub struct InMemorySessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
}

impl InMemorySessionManager {
    pub fn new(timeout: Duration) -> InMemorySessionManager {
        InMemorySessionManager {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, session: &Session) -> bool {
        match session.last_touched.elapsed() {
            Ok(age) => age > self.timeout,
            Err(_) => false,
        }
    }

    /// Drops every expired session.
    pub fn sweep(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, s| {
            s.last_touched
                .elapsed()
                .map(|age| age <= self.timeout)
                .unwrap_or(true)
        });
    }
}

impl SessionManager for InMemorySessionManager {
    fn find(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let expired = match sessions.get(id) {
            Some(s) => self.expired(s),
            None => return None,
        };
        if expired {
            sessions.remove(id);
            return None;
        }
        let session = sessions.get_mut(id).unwrap();
        session.touch();
        Some(session.clone())
    }

    fn save(&self, session: &Session) {
        let mut stored = session.clone();
        stored.mark_saved();
        self.sessions
            .lock()
            .unwrap()
            .insert(stored.id.clone(), stored);
    }

    fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Spawns the background thread that evicts expired sessions until the
/// server's stopping flag is raised.
pub(crate) fn spawn_sweeper(
    manager: Arc<InMemorySessionManager>,
    stopping: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        // Sweep roughly every 5 seconds, but notice a stop quickly.
        for _ in 0..20 {
            if stopping.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(250));
        }
        manager.sweep();
    })
}

/// The session state attached to one request.
#[derive(Default)]
pub struct SessionBinding {
    pub(crate) attached: Option<Session>,
    // Session ids the client presented on its cookies, live or not.
    pub(crate) cookie_ids: Vec<String>,
}

impl SessionBinding {
    pub fn session(&self) -> Option<&Session> {
        self.attached.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.attached.as_mut()
    }

    pub fn attach(&mut self, session: Session) {
        self.attached = Some(session);
    }

    pub fn clear(&mut self) {
        self.attached = None;
    }
}

/// Generates a string suitable for a session ID.
///
/// The output contains only ASCII letters and digits, so it never needs
/// escaping in a cookie.
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}
