use crate::cluster::ClusterTopology;
use crate::config::{ExecutionPolicy, ServerConfig};
use crate::handler::{
    ExecuteOptions, HandlerError, QueryResult, RequestHandler, SessionId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user: String,
    pub database: String,
    pub superuser: bool,
    pub connected_at: DateTime<Utc>,
}

/// Session and execution-policy front of the query engine.
///
/// Tracks sessions and enforces the policy toggles this layer owns
/// (read-only). Statement execution itself belongs to the engine behind it;
/// accepted statements return an empty result set.
pub struct Processor {
    policy: ExecutionPolicy,
    topology: ClusterTopology,
    sessions: DashMap<SessionId, SessionInfo>,
    super_user_rights: AtomicBool,
    statements_executed: AtomicU64,
}

impl Processor {
    pub fn new(config: &ServerConfig, topology: ClusterTopology) -> Self {
        tracing::info!(
            "Processor on {} with {} db leaves and {} string leaves",
            config.device,
            topology.db_leaves.len(),
            topology.string_leaves.len()
        );

        Self {
            policy: config.execution.clone(),
            topology,
            sessions: DashMap::new(),
            super_user_rights: AtomicBool::new(false),
            statements_executed: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn session(&self, session: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(session).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn statements_executed(&self) -> u64 {
        self.statements_executed.load(Ordering::Relaxed)
    }
}

impl RequestHandler for Processor {
    fn connect(
        &self,
        user: &str,
        _password: &str,
        database: &str,
    ) -> Result<SessionId, HandlerError> {
        if user.is_empty() {
            return Err(HandlerError::InvalidCredentials(
                "user name must not be empty".to_string(),
            ));
        }
        if database.is_empty() {
            return Err(HandlerError::InvalidCredentials(
                "database name must not be empty".to_string(),
            ));
        }

        let session = SessionId::generate();
        let info = SessionInfo {
            user: user.to_string(),
            database: database.to_string(),
            superuser: self.super_user_rights.load(Ordering::SeqCst),
            connected_at: Utc::now(),
        };
        tracing::info!("User {} connected to database {}", user, database);
        self.sessions.insert(session.clone(), info);

        Ok(session)
    }

    fn disconnect(&self, session: &SessionId) -> Result<(), HandlerError> {
        match self.sessions.remove(session) {
            Some((_, info)) => {
                tracing::info!("User {} disconnected from database {}", info.user, info.database);
                Ok(())
            }
            None => Err(HandlerError::InvalidSession(session.to_string())),
        }
    }

    fn sql_execute(
        &self,
        session: &SessionId,
        query: &str,
        options: &ExecuteOptions,
    ) -> Result<QueryResult, HandlerError> {
        let started = Instant::now();

        if !self.sessions.contains_key(session) {
            return Err(HandlerError::InvalidSession(session.to_string()));
        }

        let statement = query.trim();
        if statement.is_empty() {
            return Err(HandlerError::Execution("empty statement".to_string()));
        }
        if self.policy.read_only && !is_read_statement(statement) {
            return Err(HandlerError::ReadOnly);
        }

        self.statements_executed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Executing for session {}: {}", session, statement);

        let elapsed = started.elapsed().as_millis() as u64;
        Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            execution_time_ms: elapsed,
            total_time_ms: elapsed,
            nonce: options.nonce.clone(),
        })
    }

    fn set_super_user_rights(&self, enabled: bool) {
        self.super_user_rights.store(enabled, Ordering::SeqCst);
    }
}

fn is_read_statement(statement: &str) -> bool {
    let keyword = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(keyword.as_str(), "SELECT" | "WITH" | "SHOW" | "EXPLAIN")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(read_only: bool) -> Processor {
        let mut config = ServerConfig::default();
        config.execution.read_only = read_only;
        Processor::new(&config, ClusterTopology::default())
    }

    #[test]
    fn connect_execute_disconnect() {
        let processor = processor(false);
        let session = processor.connect("alice", "", "mydb").unwrap();
        assert_eq!(processor.session_count(), 1);

        let options = ExecuteOptions {
            nonce: "n1".to_string(),
            ..ExecuteOptions::default()
        };
        let result = processor.sql_execute(&session, "SELECT 1;", &options).unwrap();
        assert_eq!(result.nonce, "n1");
        assert_eq!(processor.statements_executed(), 1);

        processor.disconnect(&session).unwrap();
        assert_eq!(processor.session_count(), 0);
    }

    #[test]
    fn unknown_session_is_rejected() {
        let processor = processor(false);
        let bogus = SessionId::new("nope");
        assert!(matches!(
            processor.sql_execute(&bogus, "SELECT 1;", &ExecuteOptions::default()),
            Err(HandlerError::InvalidSession(_))
        ));
        assert!(processor.disconnect(&bogus).is_err());
        assert!(processor.disconnect(&processor.invalid_session_id()).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let processor = processor(true);
        let session = processor.connect("bob", "", "mapd").unwrap();

        assert!(processor
            .sql_execute(&session, "select * from t", &ExecuteOptions::default())
            .is_ok());
        assert_eq!(
            processor.sql_execute(&session, "INSERT INTO t VALUES (1)", &ExecuteOptions::default()),
            Err(HandlerError::ReadOnly)
        );
    }

    #[test]
    fn superuser_flag_is_captured_at_connect() {
        let processor = processor(false);
        processor.set_super_user_rights(true);
        let elevated = processor.connect("admin", "", "mapd").unwrap();
        processor.set_super_user_rights(false);
        let normal = processor.connect("admin", "", "mapd").unwrap();

        assert!(processor.session(&elevated).unwrap().superuser);
        assert!(!processor.session(&normal).unwrap().superuser);
    }
}
