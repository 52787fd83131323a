use crate::handler::{ExecuteOptions, HandlerError, RequestHandler, SessionId};
use crate::warmup::script::{ScriptEvent, WarmupScript};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarmupError {
    #[error("failed to open warmup script {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read warmup script after line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect as {user} to database {database}: {source}")]
    Connect {
        user: String,
        database: String,
        #[source]
        source: HandlerError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub blocks: usize,
    pub queries_executed: usize,
    pub queries_failed: usize,
    pub malformed_lines: usize,
    pub completed: bool,
}

enum LineOutcome {
    Continue,
    EndBlock,
    Abort(WarmupError),
}

/// Superuser rights for exactly one connect call, revoked on drop whatever
/// the connect returned.
struct SuperUserRights<'a> {
    handler: &'a dyn RequestHandler,
}

impl<'a> SuperUserRights<'a> {
    fn grant(handler: &'a dyn RequestHandler) -> Self {
        handler.set_super_user_rights(true);
        Self { handler }
    }
}

impl Drop for SuperUserRights<'_> {
    fn drop(&mut self) {
        self.handler.set_super_user_rights(false);
    }
}

/// The warmup's one open session. Dropping it disconnects, so every exit
/// from the replay releases the session.
struct WarmupSession<'a> {
    handler: &'a dyn RequestHandler,
    id: SessionId,
}

impl<'a> WarmupSession<'a> {
    fn new(handler: &'a dyn RequestHandler) -> Self {
        Self {
            handler,
            id: handler.invalid_session_id(),
        }
    }

    fn open(&mut self, user: &str, database: &str) -> Result<(), HandlerError> {
        self.close();
        let id = {
            let _rights = SuperUserRights::grant(self.handler);
            self.handler.connect(user, "", database)?
        };
        self.id = id;
        Ok(())
    }

    fn close(&mut self) {
        if self.id == self.handler.invalid_session_id() {
            return;
        }
        if let Err(e) = self.handler.disconnect(&self.id) {
            tracing::warn!("Failed to disconnect warmup session: {}", e);
        }
        self.id = self.handler.invalid_session_id();
    }
}

impl Drop for WarmupSession<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Replays the warmup script at `script_path` against `handler`.
///
/// Best effort: failures are logged as warnings and never returned. An empty
/// path is a no-op.
pub fn run(handler: &dyn RequestHandler, script_path: &Path) -> WarmupReport {
    if script_path.as_os_str().is_empty() {
        return WarmupReport::default();
    }

    tracing::info!("Running DB warmup with queries from {}", script_path.display());

    match WarmupScript::open(script_path) {
        Ok(script) => run_script(handler, script),
        Err(source) => {
            log_abort(&WarmupError::Open {
                path: script_path.to_path_buf(),
                source,
            });
            WarmupReport::default()
        }
    }
}

pub fn run_script<R: BufRead>(handler: &dyn RequestHandler, script: WarmupScript<R>) -> WarmupReport {
    let mut report = WarmupReport::default();

    match replay(handler, script, &mut report) {
        Ok(()) => {
            report.completed = true;
            tracing::info!(
                "Warmup finished: {} blocks, {} queries executed, {} failed",
                report.blocks,
                report.queries_executed,
                report.queries_failed
            );
        }
        Err(e) => log_abort(&e),
    }

    report
}

#[allow(clippy::while_let_on_iterator)]
fn replay<R: BufRead>(
    handler: &dyn RequestHandler,
    mut script: WarmupScript<R>,
    report: &mut WarmupReport,
) -> Result<(), WarmupError> {
    let mut session = WarmupSession::new(handler);

    while let Some(event) = script.next() {
        let outcome = match event {
            Ok(event) => apply(&mut session, event, report),
            Err(source) => LineOutcome::Abort(WarmupError::Read {
                line: script.line_number(),
                source,
            }),
        };

        match outcome {
            LineOutcome::Continue => {}
            LineOutcome::EndBlock => session.close(),
            LineOutcome::Abort(e) => return Err(e),
        }
    }

    Ok(())
}

fn apply(session: &mut WarmupSession<'_>, event: ScriptEvent, report: &mut WarmupReport) -> LineOutcome {
    match event {
        ScriptEvent::BeginBlock { user, database } => match session.open(&user, &database) {
            Ok(()) => {
                report.blocks += 1;
                LineOutcome::Continue
            }
            Err(source) => LineOutcome::Abort(WarmupError::Connect {
                user,
                database,
                source,
            }),
        },
        ScriptEvent::Query(query) => {
            let result = session
                .handler
                .sql_execute(&session.id, &query, &ExecuteOptions::default());
            match result {
                Ok(_) => report.queries_executed += 1,
                Err(e) => {
                    report.queries_failed += 1;
                    tracing::warn!("Warmup query failed, continuing: {}: {}", query, e);
                }
            }
            LineOutcome::Continue
        }
        ScriptEvent::EndBlock => LineOutcome::EndBlock,
        ScriptEvent::Malformed { line_number, line } => {
            report.malformed_lines += 1;
            tracing::warn!(
                "Syntax error in the warmup script at line {}: missing expected keyword USER. \
                 Following line will be ignored: {}",
                line_number,
                line
            );
            LineOutcome::Continue
        }
    }
}

fn log_abort(e: &WarmupError) {
    tracing::warn!(
        "Warmup aborted: {}. Warmup may not be fully completed. \
         Will proceed nevertheless.",
        e
    );
}
