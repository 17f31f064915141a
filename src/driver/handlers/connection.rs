use crate::driver::handles::Entry;
use crate::driver::protocol::{Ack, DriverError, HandleKind, KeyAck, Open, OpenAck};
use crate::driver::DriverHandler;
use crate::sqldb::{shared, OpenTarget};

pub fn handle_request_key(handler: &DriverHandler) -> Result<Ack, DriverError> {
    Ok(Ack::RequestKey(KeyAck {
        public_key: handler.server.public_key(),
    }))
}

/// Open a database the allow-list permits
///
/// The connection handle is only registered once the local driver has
/// opened the database.
pub fn handle_open(handler: &DriverHandler, open: Open) -> Result<Ack, DriverError> {
    if !handler.server.is_permitted(&open) {
        tracing::warn!(
            "Refused {}:{} for user '{}'",
            open.driver,
            open.dbname,
            open.user
        );
        return Err(DriverError::NotPermitted(format!(
            "{}:{} for user '{}'",
            open.driver, open.dbname, open.user
        )));
    }

    let password = match &open.password {
        Some(sealed) => Some(handler.server.unseal(sealed)?),
        None => None,
    };

    let mut db = handler.server.registry().create(&open.driver)?;
    let target = OpenTarget {
        dbname: &open.dbname,
        user: &open.user,
        host: open.host.as_deref(),
        port: open.port,
    };
    db.open(&target, password.as_deref())?;

    let connh = handler
        .server
        .handles()
        .insert_connection(handler.session, shared(db))?;

    tracing::info!(
        "Opened {}:{} for '{}' as {:#010x}",
        open.driver,
        open.dbname,
        open.user,
        connh
    );
    Ok(Ack::Open(OpenAck { connh }))
}

/// Close a connection together with its statements and cursors
pub fn handle_close(handler: &DriverHandler, connh: u32) -> Result<Ack, DriverError> {
    let removed = handler
        .server
        .handles()
        .remove_tree(HandleKind::Connection, connh, handler.session)?;

    release(removed)?;
    tracing::info!("Closed connection {:#010x}", connh);
    Ok(Ack::Close)
}

/// Drop removed entries children first, closing databases last
pub(crate) fn release(removed: Vec<Entry>) -> Result<(), DriverError> {
    let mut result = Ok(());
    for entry in removed {
        if let Entry::Connection(conn) = entry {
            if let Err(e) = conn.db.lock().close() {
                result = Err(DriverError::from(e));
            }
        }
    }
    result
}
