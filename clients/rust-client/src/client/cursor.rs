//! Result cursor with a two-slot prefetch buffer.
//!
//! Slot 0 holds the rows around the read position, slot 1 the batch after
//! it. When the reader gets within the low-water mark of the end of slot 0,
//! the next batch is requested without waiting; crossing into slot 1
//! retires slot 0. Random access outside both slots discards them and
//! fetches from the requested row. Every discard bumps a fetch epoch so a
//! late ack for a discarded range is ignored.

use std::sync::Arc;

use parking_lot::Mutex;

use super::session::{AckAction, AckMode, Prefetch, Session, Shared};
use super::statement::StatementInner;
use crate::protocol::{
    Ack, CloseCursor, ColType, ColumnData, CursorInfo, CursorRequest, DriverError, Request,
    RequestRows, RequestRowsAck, Value,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct Buffer {
    data: Option<Vec<ColumnData>>,
    rows: i64,
    rows_to_go: i64,
}

#[derive(Debug, Default)]
pub(crate) struct CursorState {
    cursh: u32,
    flags: u32,
    columns: u32,
    rows: i64,
    configured: bool,
    /// Row number of the first row in slot 0
    begin: i64,
    buffers: [Buffer; 2],
    in_flight: bool,
    epoch: u64,
    orphaned: bool,
    failure: Option<DriverError>,
}

enum Step {
    Ready(bool),
    Poll,
    Fetch(RequestRows, u64),
}

impl CursorState {
    pub(crate) fn fail(&mut self, err: &DriverError) {
        self.failure = Some(err.clone());
    }

    fn check(&self) -> Result<(), DriverError> {
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Close owed to the server when the cursor was dropped before its handle arrived
    fn orphan_release(&mut self) -> Option<Request> {
        if self.orphaned && self.cursh != 0 {
            let cursh = std::mem::take(&mut self.cursh);
            return Some(Request::CloseCursor(CloseCursor { cursh }));
        }
        None
    }

    pub(crate) fn configure(&mut self, info: CursorInfo) -> Option<Request> {
        self.cursh = info.cursh;
        self.flags = info.flags;
        self.columns = info.columns;
        self.rows = info.rows;
        self.begin = 0;
        self.buffers = Default::default();
        self.load(0, info.data, info.rows_to_go);
        self.configured = true;
        self.orphan_release()
    }

    pub(crate) fn copied(&mut self, cursh: u32) -> Option<Request> {
        self.cursh = cursh;
        self.orphan_release()
    }

    pub(crate) fn fill(&mut self, epoch: u64, ack: RequestRowsAck) {
        if epoch != self.epoch {
            tracing::trace!("Dropping rows fetched for a discarded range");
            return;
        }
        self.in_flight = false;
        let slot = if self.buffers[0].data.is_some() { 1 } else { 0 };
        self.load(slot, ack.data, ack.rows_to_go);
    }

    pub(crate) fn rows_failed(&mut self, epoch: u64, err: &DriverError) {
        if epoch == self.epoch {
            self.in_flight = false;
            self.fail(err);
        }
    }

    fn load(&mut self, slot: usize, data: Vec<ColumnData>, rows_to_go: i64) {
        let rows = match self.columns {
            0 => 0,
            columns => (data.len() / columns as usize) as i64,
        };
        self.buffers[slot] = Buffer {
            data: Some(data),
            rows,
            rows_to_go,
        };
    }

    fn retire(&mut self) {
        self.begin += self.buffers[0].rows;
        self.buffers.swap(0, 1);
        self.buffers[1] = Buffer::default();
    }

    fn refetch(&mut self, row: i64, batch: u32) -> Step {
        if self.cursh == 0 {
            return Step::Poll;
        }
        self.buffers = Default::default();
        self.epoch += 1;
        self.begin = row;
        self.in_flight = true;
        Step::Fetch(
            RequestRows {
                cursh: self.cursh,
                start: row,
                request: batch,
            },
            self.epoch,
        )
    }

    /// Work out what it takes to make `row` readable from slot 0
    fn step(&mut self, row: i64, prefetch: Prefetch) -> Result<Step, DriverError> {
        self.check()?;
        if !self.configured {
            return Ok(Step::Poll);
        }
        if self.columns == 0 {
            return Ok(Step::Ready(false));
        }

        loop {
            if self.buffers[0].data.is_none() {
                if self.in_flight {
                    return Ok(Step::Poll);
                }
                return Ok(self.refetch(row, prefetch.batch));
            }

            let end0 = self.begin + self.buffers[0].rows;
            if row >= self.begin && row < end0 {
                return Ok(Step::Ready(true));
            }
            if row < self.begin {
                return Ok(self.refetch(row, prefetch.batch));
            }

            if self.buffers[1].data.is_some() {
                if row < end0 + self.buffers[1].rows {
                    self.retire();
                    continue;
                }
                if self.buffers[1].rows_to_go == 0 {
                    return Ok(Step::Ready(false));
                }
            } else if self.in_flight {
                return Ok(Step::Poll);
            } else if self.buffers[0].rows_to_go == 0 {
                return Ok(Step::Ready(false));
            }
            return Ok(self.refetch(row, prefetch.batch));
        }
    }

    /// Request the batch after slot 0 once `row` is within the low-water mark
    fn prefetch(&mut self, row: i64, prefetch: Prefetch) -> Option<(RequestRows, u64)> {
        if self.cursh == 0 || self.in_flight || self.buffers[1].data.is_some() {
            return None;
        }
        let head = &self.buffers[0];
        if head.data.is_none() || head.rows_to_go == 0 {
            return None;
        }
        let end0 = self.begin + head.rows;
        if row < end0 - prefetch.ask_for_more as i64 {
            return None;
        }
        self.in_flight = true;
        Some((
            RequestRows {
                cursh: self.cursh,
                start: end0,
                request: prefetch.batch,
            },
            self.epoch,
        ))
    }

    fn cell(&self, row: i64, column: u32) -> Option<&ColumnData> {
        let offset = (row - self.begin) * self.columns as i64 + column as i64;
        let offset = usize::try_from(offset).ok()?;
        self.buffers[0].data.as_ref()?.get(offset)
    }

    /// Client-side copy sharing buffered rows but no server handle
    fn duplicate(&self) -> CursorState {
        CursorState {
            cursh: 0,
            flags: self.flags,
            columns: self.columns,
            rows: self.rows,
            configured: self.configured,
            begin: self.begin,
            buffers: self.buffers.clone(),
            in_flight: false,
            epoch: 0,
            orphaned: false,
            failure: None,
        }
    }
}

/// One cell read from a cursor
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub flags: u32,
    pub column: u32,
    /// Row number, -1 for headers
    pub row: i64,
    pub value: Value,
}

/// Result set of an executed statement
///
/// Rows are fetched in batches ahead of the read position. Reading methods
/// wait for outstanding acks only when the rows they need are not buffered.
pub struct Cursor {
    session: Arc<Session>,
    state: Shared<CursorState>,
    _statement: Arc<StatementInner>,
    position: i64,
    col_types: Option<Vec<ColType>>,
    headers: Option<Vec<ColumnData>>,
}

impl Cursor {
    pub(crate) fn new(session: Arc<Session>, statement: Arc<StatementInner>) -> Self {
        Self {
            session,
            state: Arc::new(Mutex::new(CursorState::default())),
            _statement: statement,
            position: 0,
            col_types: None,
            headers: None,
        }
    }

    pub(crate) fn state(&self) -> &Shared<CursorState> {
        &self.state
    }

    async fn configured(&self) -> Result<(), DriverError> {
        let state = self.state.clone();
        self.session
            .resolve(|| {
                let st = state.lock();
                st.configured || st.failure.is_some()
            })
            .await?;
        let st = self.state.lock();
        st.check()?;
        if !st.configured {
            return Err(DriverError::InvalidState(
                "Cursor was never created".to_string(),
            ));
        }
        Ok(())
    }

    /// Server handle, waiting for the creating ack if needed
    pub async fn handle(&self) -> Result<u32, DriverError> {
        let state = self.state.clone();
        self.session
            .resolve(|| {
                let st = state.lock();
                st.cursh != 0 || st.failure.is_some()
            })
            .await?;
        let st = self.state.lock();
        st.check()?;
        if st.cursh == 0 {
            return Err(DriverError::InvalidState(
                "Cursor has no server handle".to_string(),
            ));
        }
        Ok(st.cursh)
    }

    pub async fn flags(&self) -> Result<u32, DriverError> {
        self.configured().await?;
        Ok(self.state.lock().flags)
    }

    pub async fn columns(&self) -> Result<u32, DriverError> {
        self.configured().await?;
        Ok(self.state.lock().columns)
    }

    /// Total row count, or -1 when the server does not know it
    pub async fn rows(&self) -> Result<i64, DriverError> {
        self.configured().await?;
        Ok(self.state.lock().rows)
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Make `row` readable, returning false when it lies past the last row
    async fn locate(&mut self, row: i64) -> Result<bool, DriverError> {
        loop {
            let prefetch = self.session.prefetch();
            let step = self.state.lock().step(row, prefetch)?;
            match step {
                Step::Ready(found) => {
                    if found {
                        let next = self.state.lock().prefetch(row, prefetch);
                        if let Some((request, epoch)) = next {
                            self.fetch(request, epoch)?;
                        }
                    }
                    return Ok(found);
                }
                Step::Poll => {
                    if !self.session.poll_ack(None).await? {
                        self.state.lock().check()?;
                        return Err(DriverError::InvalidState(
                            "Cursor is waiting for rows that were never requested".to_string(),
                        ));
                    }
                }
                Step::Fetch(request, epoch) => self.fetch(request, epoch)?,
            }
        }
    }

    fn fetch(&self, request: RequestRows, epoch: u64) -> Result<(), DriverError> {
        self.session
            .send_async(
                Request::RequestRows(request),
                AckAction::Rows {
                    cursor: self.state.clone(),
                    epoch,
                },
            )
            .map(|_| ())
    }

    pub async fn at_end(&mut self) -> Result<bool, DriverError> {
        let row = self.position;
        Ok(!self.locate(row).await?)
    }

    /// Advance one row, returning the new position
    pub async fn forwards(&mut self) -> Result<i64, DriverError> {
        if self.at_end().await? {
            return Ok(self.position);
        }
        self.position += 1;
        let row = self.position;
        self.locate(row).await?;
        Ok(self.position)
    }

    /// Step back one row, returning the new position
    pub async fn backwards(&mut self) -> Result<i64, DriverError> {
        if self.position > 0 {
            self.position -= 1;
        }
        let row = self.position;
        self.locate(row).await?;
        Ok(self.position)
    }

    /// Move to an absolute row
    pub async fn seek(&mut self, row: i64) -> Result<i64, DriverError> {
        if row < 0 {
            return Err(DriverError::InvalidCommand(format!(
                "Row {} is out of range",
                row
            )));
        }
        self.position = row;
        self.locate(row).await?;
        Ok(row)
    }

    /// Value of column `column` in the current row
    pub async fn data(&mut self, column: u32) -> Result<Column, DriverError> {
        self.configured().await?;
        let columns = self.state.lock().columns;
        if column >= columns {
            return Err(DriverError::InvalidCommand(format!(
                "Column {} does not exist",
                column
            )));
        }
        let row = self.position;
        if !self.locate(row).await? {
            return Err(DriverError::InvalidState(format!(
                "No row at position {}",
                row
            )));
        }
        let st = self.state.lock();
        let cell = st.cell(row, column).ok_or_else(|| {
            DriverError::ProtocolError(format!("Row {} missing from buffer", row))
        })?;
        Ok(Column {
            flags: cell.flags,
            column,
            row,
            value: cell.value.clone(),
        })
    }

    /// Declared type of a column, fetched once per cursor
    pub async fn column_type(&mut self, column: u32) -> Result<ColType, DriverError> {
        if self.col_types.is_none() {
            let cursh = self.handle().await?;
            match self
                .session
                .round_trip(Request::RequestColTypes(CursorRequest { cursh }))
                .await?
            {
                Ack::RequestColTypes(ack) => self.col_types = Some(ack.types),
                other => {
                    return Err(DriverError::ProtocolError(format!(
                        "Unexpected acknowledgment {:?}",
                        other.kind()
                    )))
                }
            }
        }
        self.col_types
            .as_ref()
            .and_then(|types| types.get(column as usize))
            .copied()
            .ok_or_else(|| DriverError::InvalidCommand(format!("Column {} does not exist", column)))
    }

    /// Header (column name) of a column, fetched once per cursor
    pub async fn header(&mut self, column: u32) -> Result<Column, DriverError> {
        if self.headers.is_none() {
            let cursh = self.handle().await?;
            match self
                .session
                .round_trip(Request::RequestColHeaders(CursorRequest { cursh }))
                .await?
            {
                Ack::RequestColHeaders(ack) => self.headers = Some(ack.headers),
                other => {
                    return Err(DriverError::ProtocolError(format!(
                        "Unexpected acknowledgment {:?}",
                        other.kind()
                    )))
                }
            }
        }
        let cell = self
            .headers
            .as_ref()
            .and_then(|headers| headers.get(column as usize))
            .ok_or_else(|| DriverError::InvalidCommand(format!("Header {} does not exist", column)))?;
        Ok(Column {
            flags: cell.flags,
            column,
            row: -1,
            value: cell.value.clone(),
        })
    }

    /// Independent cursor over the same results, at the same position
    pub async fn copy(&self, mode: AckMode) -> Result<Cursor, DriverError> {
        let cursh = self.handle().await?;
        let copy = Cursor {
            session: self.session.clone(),
            state: Arc::new(Mutex::new(self.state.lock().duplicate())),
            _statement: self._statement.clone(),
            position: self.position,
            col_types: self.col_types.clone(),
            headers: self.headers.clone(),
        };
        self.session
            .dispatch(
                Request::CopyCursor(CursorRequest { cursh }),
                AckAction::CopyCursor(copy.state.clone()),
                mode.creating(),
            )
            .await?;
        Ok(copy)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if st.cursh != 0 {
            if self.session.connh() != 0 {
                self.session.release(Request::CloseCursor(CloseCursor { cursh: st.cursh }));
            }
            st.cursh = 0;
        } else if st.failure.is_none() {
            st.orphaned = true;
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Cursor")
            .field("cursh", &st.cursh)
            .field("position", &self.position)
            .field("begin", &st.begin)
            .finish()
    }
}
