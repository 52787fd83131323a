#![allow(dead_code)]

use mapd_server::config::{CATALOG_DIR, DATA_DIR, SYSTEM_DB};
use mapd_server::handler::{ExecuteOptions, HandlerError, QueryResult, RequestHandler, SessionId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{self, BufRead, Cursor, Read};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SuperUser(bool),
    Connect {
        user: String,
        database: String,
        superuser: bool,
    },
    Execute(String),
    Disconnect(SessionId),
}

/// Handler that records every call and fails on request.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Call>>,
    failing_queries: HashSet<String>,
    refused_users: HashSet<String>,
    superuser: AtomicBool,
    next_session: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_query(mut self, query: &str) -> Self {
        self.failing_queries.insert(query.to_string());
        self
    }

    pub fn refusing_user(mut self, user: &str) -> Self {
        self.refused_users.insert(user.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Connect { .. }))
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Disconnect(_)))
            .count()
    }

    pub fn executed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Execute(query) => Some(query),
                _ => None,
            })
            .collect()
    }

    pub fn has_super_user_rights(&self) -> bool {
        self.superuser.load(Ordering::SeqCst)
    }
}

impl RequestHandler for RecordingHandler {
    fn connect(&self, user: &str, _password: &str, database: &str) -> Result<SessionId, HandlerError> {
        self.calls.lock().push(Call::Connect {
            user: user.to_string(),
            database: database.to_string(),
            superuser: self.has_super_user_rights(),
        });
        if self.refused_users.contains(user) {
            return Err(HandlerError::InvalidCredentials(format!("{} refused", user)));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(SessionId::new(format!("session-{}", id)))
    }

    fn disconnect(&self, session: &SessionId) -> Result<(), HandlerError> {
        self.calls.lock().push(Call::Disconnect(session.clone()));
        Ok(())
    }

    fn sql_execute(
        &self,
        _session: &SessionId,
        query: &str,
        options: &ExecuteOptions,
    ) -> Result<QueryResult, HandlerError> {
        self.calls.lock().push(Call::Execute(query.to_string()));
        if self.failing_queries.contains(query) {
            return Err(HandlerError::Execution(format!("cannot run {}", query)));
        }
        Ok(QueryResult {
            nonce: options.nonce.clone(),
            ..QueryResult::default()
        })
    }

    fn set_super_user_rights(&self, enabled: bool) {
        self.calls.lock().push(Call::SuperUser(enabled));
        self.superuser.store(enabled, Ordering::SeqCst);
    }
}

/// Handler whose statements take a while, tracking peak concurrency.
#[derive(Default)]
pub struct SlowHandler {
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl RequestHandler for SlowHandler {
    fn connect(&self, _user: &str, _password: &str, _database: &str) -> Result<SessionId, HandlerError> {
        Ok(SessionId::generate())
    }

    fn disconnect(&self, _session: &SessionId) -> Result<(), HandlerError> {
        Ok(())
    }

    fn sql_execute(
        &self,
        _session: &SessionId,
        _query: &str,
        _options: &ExecuteOptions,
    ) -> Result<QueryResult, HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(QueryResult::default())
    }

    fn set_super_user_rights(&self, _enabled: bool) {}
}

/// Serves `data` and then fails every further read.
pub struct FailingReader {
    data: Cursor<Vec<u8>>,
}

impl FailingReader {
    pub fn new(data: &str) -> Self {
        Self {
            data: Cursor::new(data.as_bytes().to_vec()),
        }
    }

    fn exhausted(&self) -> bool {
        self.data.position() as usize >= self.data.get_ref().len()
    }
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exhausted() {
            return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
        }
        self.data.read(buf)
    }
}

impl BufRead for FailingReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.exhausted() {
            return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
        }
        self.data.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.data.consume(amt);
    }
}

/// Lays out the directories a bootstrap expects under `dir`.
pub fn seed_data_dir(dir: &Path) {
    std::fs::create_dir_all(dir.join(CATALOG_DIR).join(SYSTEM_DB)).unwrap();
    std::fs::create_dir_all(dir.join(DATA_DIR)).unwrap();
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
