use crate::driver::protocol::{
    Ack, BindParameter, CursorInfo, DriverError, Execute, ExecuteAck, HandleKind,
    PrepareStatement, PrepareStatementAck,
};
use crate::driver::DriverHandler;
use crate::error::DbResult;
use crate::sqldb::{shared, SharedCursor, SqlStatement};

use super::connection::release;
use super::cursor::cursor_info;

/// Run a prepared statement, building the cursor info for its first batch
///
/// Zero flags executes immediately and yields no cursor. The returned
/// info still carries a zero handle.
fn run(
    stmt: &mut dyn SqlStatement,
    request: u32,
    flags: u32,
) -> DbResult<Option<(SharedCursor, CursorInfo)>> {
    match stmt.execute(flags)? {
        Some(mut cursor) => {
            let info = cursor_info(cursor.as_mut(), request)?;
            Ok(Some((shared(cursor), info)))
        }
        None => Ok(None),
    }
}

/// Prepare a statement, optionally executing it right away
///
/// A non-zero `request` executes with `flags` and returns that many rows
/// with the ack. Handles are registered only after every driver step has
/// succeeded.
pub fn handle_prepare(handler: &DriverHandler, prepare: PrepareStatement) -> Result<Ack, DriverError> {
    let db = handler
        .server
        .handles()
        .connection(prepare.connh, handler.session)?
        .db
        .clone();

    let mut stmt = db.lock().prepare(&prepare.text)?;
    let par_names = (0..stmt.parameter_count())
        .map(|idx| stmt.parameter_name(idx))
        .collect::<DbResult<Vec<_>>>()?;

    let executed = if prepare.request != 0 {
        run(stmt.as_mut(), prepare.request, prepare.flags)?
    } else {
        None
    };

    let (cursor, mut info) = match executed {
        Some((cursor, info)) => (Some(cursor), Some(info)),
        None => (None, None),
    };

    let (stmth, cursh) = handler.server.handles().insert_statement(
        handler.session,
        prepare.connh,
        shared(stmt),
        cursor,
    )?;

    if let (Some(info), Some(cursh)) = (info.as_mut(), cursh) {
        info.cursh = cursh;
    }

    tracing::debug!(
        "Prepared {:#010x} on {:#010x}: {}",
        stmth,
        prepare.connh,
        prepare.text
    );
    Ok(Ack::PrepareStatement(PrepareStatementAck {
        stmth,
        par_names,
        cursor: info,
    }))
}

/// Release a statement and every cursor it produced
pub fn handle_unprepare(handler: &DriverHandler, stmth: u32) -> Result<Ack, DriverError> {
    let removed = handler
        .server
        .handles()
        .remove_tree(HandleKind::Statement, stmth, handler.session)?;
    release(removed)?;
    Ok(Ack::UnprepareStatement)
}

pub fn handle_bind(handler: &DriverHandler, bind: BindParameter) -> Result<Ack, DriverError> {
    let stmt = handler
        .server
        .handles()
        .statement(bind.stmth, handler.session)?
        .stmt
        .clone();

    stmt.lock().bind(bind.index as usize, &bind.value)?;
    Ok(Ack::BindParameter)
}

pub fn handle_execute(handler: &DriverHandler, execute: Execute) -> Result<Ack, DriverError> {
    let stmt = handler
        .server
        .handles()
        .statement(execute.stmth, handler.session)?
        .stmt
        .clone();

    let executed = {
        let mut stmt = stmt.lock();
        run(stmt.as_mut(), execute.request, execute.flags)?
    };

    let cursor = match executed {
        Some((cursor, mut info)) => {
            info.cursh = handler
                .server
                .handles()
                .insert_cursor(handler.session, execute.stmth, cursor)?;
            Some(info)
        }
        None => None,
    };

    Ok(Ack::Execute(ExecuteAck { cursor }))
}
