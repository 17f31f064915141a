use sqlipc_client::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Unknown database driver '{0}'")]
    UnknownDriver(String),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Parameter {0} out of range")]
    ParameterOutOfRange(u32),

    #[error("Column {0} out of range")]
    ColumnOutOfRange(u32),

    #[error("Handle table is full")]
    HandleTableFull,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        DbError::ConfigError(err.to_string())
    }
}

impl From<regex::Error> for DbError {
    fn from(err: regex::Error) -> Self {
        DbError::ConfigError(err.to_string())
    }
}

impl From<DbError> for DriverError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotPermitted(msg) => DriverError::NotPermitted(msg),
            DbError::AuthError(msg) => DriverError::AuthError(msg),
            DbError::DatabaseError(msg) => DriverError::DatabaseError(msg),
            DbError::SqliteError(e) => DriverError::DatabaseError(e.to_string()),
            other => DriverError::DatabaseError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbError::UnknownDriver("oracle".to_string());
        assert_eq!(err.to_string(), "Unknown database driver 'oracle'");

        let err = DbError::ColumnOutOfRange(7);
        assert_eq!(err.to_string(), "Column 7 out of range");

        let err = DbError::HandleTableFull;
        assert_eq!(err.to_string(), "Handle table is full");
    }

    #[test]
    fn test_driver_error_mapping() {
        let err: DriverError = DbError::NotPermitted("mysql:db".to_string()).into();
        assert_eq!(err, DriverError::NotPermitted("mysql:db".to_string()));

        let err: DriverError = DbError::AuthError("bad tag".to_string()).into();
        assert_eq!(err, DriverError::AuthError("bad tag".to_string()));

        let err: DriverError = DbError::DatabaseError("near \"SELEC\"".to_string()).into();
        assert_eq!(err, DriverError::DatabaseError("near \"SELEC\"".to_string()));

        let err: DriverError = DbError::ParameterOutOfRange(3).into();
        match err {
            DriverError::DatabaseError(msg) => assert!(msg.contains("Parameter 3")),
            _ => panic!("Expected DatabaseError"),
        }
    }

    #[test]
    fn test_sqlite_error_converts() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: DbError = conn.execute("NOT SQL", []).unwrap_err().into();
        assert!(matches!(err, DbError::SqliteError(_)));
        let err: DriverError = err.into();
        assert!(matches!(err, DriverError::DatabaseError(_)));
    }
}
