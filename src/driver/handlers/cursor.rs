use crate::driver::protocol::{
    Ack, ColHeadersAck, ColTypesAck, ColumnData, CopyCursorAck, CursorInfo, DriverError,
    HandleKind, RequestRows, RequestRowsAck, MAX_MESSAGE_SIZE,
};
use crate::driver::DriverHandler;
use crate::error::DbResult;
use crate::sqldb::{shared, SharedCursor, SqlCursor};

/// Upper bound on rows returned by one request
pub const MAX_BATCH_ROWS: u32 = 10_000;

/// Upper bound on the encoded cells of one batch, leaving room for the ack
/// envelope inside a single frame
pub const MAX_BATCH_BYTES: usize = MAX_MESSAGE_SIZE - 64 * 1024;

/// Worst-case msgpack overhead of one named `ColumnData` around its payload
const CELL_OVERHEAD: usize = 48;

fn cell_size(cell: &ColumnData) -> usize {
    CELL_OVERHEAD + cell.value.len()
}

/// Read up to `request` rows starting at `start`, row-major
///
/// A batch also stops before its cells would pass [`MAX_BATCH_BYTES`], but
/// always holds at least one row. Rows-to-go is 0 once the cursor is
/// exhausted, -1 when the total is unknown, otherwise the number of rows
/// after the last one returned.
pub fn fetch_rows(
    cursor: &mut dyn SqlCursor,
    start: i64,
    request: u32,
) -> DbResult<(Vec<ColumnData>, i64)> {
    let columns = cursor.columns() as usize;
    let mut request = request.min(MAX_BATCH_ROWS) as usize;
    let rows = cursor.rows();
    if rows >= 0 {
        request = request.min((rows - start).max(0) as usize);
    }
    let mut data = Vec::with_capacity(request * columns);

    if cursor.seek(start)? {
        let mut fetched = 0;
        let mut bytes = 0;
        while fetched < request && !cursor.at_end() {
            let mut row = Vec::with_capacity(columns);
            for col in 0..columns {
                row.push(ColumnData::new(cursor.data(col as u32)?));
            }
            let row_bytes: usize = row.iter().map(cell_size).sum();
            if fetched > 0 && bytes + row_bytes > MAX_BATCH_BYTES {
                break;
            }
            bytes += row_bytes;
            data.extend(row);
            fetched += 1;
            cursor.next()?;
        }
    }

    let rows = cursor.rows();
    let rows_to_go = if cursor.at_end() {
        0
    } else if rows < 0 {
        -1
    } else {
        rows - cursor.at()
    };
    Ok((data, rows_to_go))
}

/// Describe a freshly executed cursor together with its first batch
pub(crate) fn cursor_info(cursor: &mut dyn SqlCursor, request: u32) -> DbResult<CursorInfo> {
    let (data, rows_to_go) = fetch_rows(cursor, 0, request)?;
    Ok(CursorInfo {
        cursh: 0,
        flags: cursor.flags(),
        columns: cursor.columns(),
        rows: cursor.rows(),
        data,
        rows_to_go,
    })
}

fn lookup(handler: &DriverHandler, cursh: u32) -> Result<SharedCursor, DriverError> {
    Ok(handler
        .server
        .handles()
        .cursor(cursh, handler.session)?
        .cursor
        .clone())
}

pub fn handle_close_cursor(handler: &DriverHandler, cursh: u32) -> Result<Ack, DriverError> {
    handler
        .server
        .handles()
        .remove_tree(HandleKind::Cursor, cursh, handler.session)?;
    Ok(Ack::CloseCursor)
}

pub fn handle_request_rows(handler: &DriverHandler, req: RequestRows) -> Result<Ack, DriverError> {
    let cursor = lookup(handler, req.cursh)?;
    let (data, rows_to_go) = {
        let mut cursor = cursor.lock();
        fetch_rows(cursor.as_mut(), req.start, req.request)?
    };
    Ok(Ack::RequestRows(RequestRowsAck { data, rows_to_go }))
}

pub fn handle_col_types(handler: &DriverHandler, cursh: u32) -> Result<Ack, DriverError> {
    let cursor = lookup(handler, cursh)?;
    let cursor = cursor.lock();
    let types = (0..cursor.columns())
        .map(|col| cursor.column_type(col))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Ack::RequestColTypes(ColTypesAck { types }))
}

pub fn handle_col_headers(handler: &DriverHandler, cursh: u32) -> Result<Ack, DriverError> {
    let cursor = lookup(handler, cursh)?;
    let cursor = cursor.lock();
    let headers = (0..cursor.columns())
        .map(|col| cursor.header(col).map(ColumnData::header))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Ack::RequestColHeaders(ColHeadersAck { headers }))
}

/// Duplicate a cursor under the same statement
pub fn handle_copy_cursor(handler: &DriverHandler, cursh: u32) -> Result<Ack, DriverError> {
    let (parent, cursor) = {
        let handles = handler.server.handles();
        let entry = handles.cursor(cursh, handler.session)?;
        (entry.parent, entry.cursor.clone())
    };

    let copy = cursor.lock().copy()?;
    let cursh = handler
        .server
        .handles()
        .insert_cursor(handler.session, parent, shared(copy))?;
    Ok(Ack::CopyCursor(CopyCursorAck { cursh }))
}
