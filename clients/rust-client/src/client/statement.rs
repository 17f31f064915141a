use std::sync::Arc;

use parking_lot::Mutex;

use super::cursor::{Cursor, CursorState};
use super::session::{AckAction, AckMode, Session, Shared};
use crate::protocol::{
    BindParameter, DriverError, Execute, PrepareStatement, PrepareStatementAck,
    Request, UnprepareStatement, Value,
};

/// Client view of a server-side prepared statement
#[derive(Debug, Default)]
pub(crate) struct StatementState {
    pub(crate) stmth: u32,
    pub(crate) par_names: Vec<String>,
    pub(crate) failure: Option<DriverError>,
    /// Dropped before the prepare was acknowledged
    pub(crate) orphaned: bool,
}

impl StatementState {
    pub(crate) fn fail(&mut self, err: &DriverError) {
        self.failure = Some(err.clone());
    }

    fn is_resolved(&self) -> bool {
        self.stmth != 0 || self.failure.is_some()
    }
}

/// Apply a PrepareStatement ack, returning any releases owed to the server
pub(crate) fn prepared(
    statement: &Shared<StatementState>,
    cursor: Option<&Shared<CursorState>>,
    ack: PrepareStatementAck,
) -> Vec<Request> {
    let mut releases = Vec::new();
    let mut st = statement.lock();
    st.stmth = ack.stmth;
    st.par_names = ack.par_names;

    if let Some(cursor) = cursor {
        let mut cs = cursor.lock();
        match ack.cursor {
            Some(info) => {
                // Unpreparing the statement closes its cursors too
                if let Some(release) = cs.configure(info) {
                    if !st.orphaned {
                        releases.push(release);
                    }
                }
            }
            None => cs.fail(&DriverError::InvalidState(
                "Statement produced no cursor".to_string(),
            )),
        }
    }

    if st.orphaned {
        releases.push(Request::UnprepareStatement(UnprepareStatement {
            stmth: st.stmth,
        }));
        st.stmth = 0;
    }
    releases
}

/// What a PrepareStatement request asks the server to do after preparing
pub(crate) enum ExecuteNow {
    No,
    Immediate,
    Cursor(u32),
}

pub(crate) struct StatementInner {
    pub(crate) session: Arc<Session>,
    pub(crate) state: Shared<StatementState>,
    text: String,
}

impl Drop for StatementInner {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if st.stmth != 0 {
            if self.session.connh() != 0 {
                self.session
                    .release(Request::UnprepareStatement(UnprepareStatement {
                        stmth: st.stmth,
                    }));
            }
            st.stmth = 0;
        } else if st.failure.is_none() {
            st.orphaned = true;
        }
    }
}

/// A prepared statement
///
/// Cloning shares the same server statement; it is unprepared once the last
/// clone and every cursor created from it are dropped.
#[derive(Clone)]
pub struct Statement {
    inner: Arc<StatementInner>,
}

impl Statement {
    fn create(session: Arc<Session>, text: &str) -> Self {
        Self {
            inner: Arc::new(StatementInner {
                session,
                state: Arc::new(Mutex::new(StatementState::default())),
                text: text.to_string(),
            }),
        }
    }

    /// Send a PrepareStatement for `text` on connection `connh`
    pub(crate) async fn prepare(
        session: &Arc<Session>,
        connh: u32,
        text: &str,
        now: ExecuteNow,
        mode: AckMode,
    ) -> Result<(Statement, Option<Cursor>), DriverError> {
        let statement = Statement::create(session.clone(), text);
        let batch = session.prefetch().batch;
        let (request, flags) = match now {
            ExecuteNow::No => (0, 0),
            ExecuteNow::Immediate => (batch, 0),
            ExecuteNow::Cursor(flags) => (batch, flags),
        };
        let cursor = match now {
            ExecuteNow::Cursor(_) => Some(Cursor::new(session.clone(), statement.inner.clone())),
            _ => None,
        };

        session
            .dispatch(
                Request::PrepareStatement(PrepareStatement {
                    connh,
                    text: text.to_string(),
                    request,
                    flags,
                }),
                AckAction::Prepare {
                    statement: statement.inner.state.clone(),
                    cursor: cursor.as_ref().map(|c| c.state().clone()),
                },
                mode.creating(),
            )
            .await?;
        Ok((statement, cursor))
    }

    pub fn text(&self) -> &str {
        &self.inner.text
    }

    /// Server handle, waiting for the prepare ack if needed
    pub async fn handle(&self) -> Result<u32, DriverError> {
        let state = self.inner.state.clone();
        self.inner
            .session
            .resolve(|| state.lock().is_resolved())
            .await?;
        let st = state.lock();
        if let Some(e) = &st.failure {
            return Err(e.clone());
        }
        if st.stmth == 0 {
            return Err(DriverError::InvalidState(
                "Statement was never prepared".to_string(),
            ));
        }
        Ok(st.stmth)
    }

    pub async fn parameters(&self) -> Result<usize, DriverError> {
        self.handle().await?;
        Ok(self.inner.state.lock().par_names.len())
    }

    pub async fn parameter_idx(&self, name: &str) -> Result<Option<usize>, DriverError> {
        self.handle().await?;
        Ok(self
            .inner
            .state
            .lock()
            .par_names
            .iter()
            .position(|n| n == name))
    }

    pub async fn parameter_name(&self, idx: usize) -> Result<Option<String>, DriverError> {
        self.handle().await?;
        Ok(self.inner.state.lock().par_names.get(idx).cloned())
    }

    pub async fn bind(
        &self,
        idx: usize,
        value: impl Into<Value>,
        mode: AckMode,
    ) -> Result<(), DriverError> {
        let stmth = self.handle().await?;
        let index = u32::try_from(idx)
            .map_err(|_| DriverError::InvalidCommand(format!("Parameter {} out of range", idx)))?;
        self.inner
            .session
            .dispatch(
                Request::BindParameter(BindParameter {
                    stmth,
                    index,
                    value: value.into(),
                }),
                AckAction::Discard,
                mode,
            )
            .await
    }

    /// Execute with a result cursor; `flags` must not be zero
    pub async fn execute(&self, flags: u32, mode: AckMode) -> Result<Cursor, DriverError> {
        if flags == 0 {
            return Err(DriverError::InvalidCommand(
                "Cursor flags must not be zero, use immediate() instead".to_string(),
            ));
        }
        let stmth = self.handle().await?;
        let cursor = Cursor::new(self.inner.session.clone(), self.inner.clone());
        self.inner
            .session
            .dispatch(
                Request::Execute(Execute {
                    stmth,
                    request: self.inner.session.prefetch().batch,
                    flags,
                }),
                AckAction::Execute(cursor.state().clone()),
                mode.creating(),
            )
            .await?;
        Ok(cursor)
    }

    /// Execute without producing a cursor
    pub async fn immediate(&self, mode: AckMode) -> Result<(), DriverError> {
        let stmth = self.handle().await?;
        self.inner
            .session
            .dispatch(
                Request::Execute(Execute {
                    stmth,
                    request: 0,
                    flags: 0,
                }),
                AckAction::Discard,
                mode,
            )
            .await
    }

    /// Prepare the same text again as an independent statement
    pub async fn copy(&self, mode: AckMode) -> Result<Statement, DriverError> {
        let connh = self.inner.session.connh();
        if connh == 0 {
            return Err(DriverError::InvalidState("Database is not open".to_string()));
        }
        let (statement, _) = Statement::prepare(
            &self.inner.session,
            connh,
            &self.inner.text,
            ExecuteNow::No,
            mode,
        )
        .await?;
        Ok(statement)
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("text", &self.inner.text)
            .field("stmth", &self.inner.state.lock().stmth)
            .finish()
    }
}
