//! Admission allow-list
//!
//! Driver, database and user are matched as glob patterns (`*` and `?`).
//! An entry without a host, or with port 0, accepts any host or port.

use regex::Regex;

use crate::config::PermitConfig;
use crate::driver::protocol::Open;
use crate::error::DbResult;

/// Convert a glob pattern to an anchored regex
pub fn glob_to_regex(pattern: &str) -> DbResult<Regex> {
    let mut regex_pattern = String::new();
    regex_pattern.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex_pattern.push_str(".*"),
            '?' => regex_pattern.push('.'),
            '^' | '$' | '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                regex_pattern.push('\\');
                regex_pattern.push(c);
            }
            _ => regex_pattern.push(c),
        }
    }
    regex_pattern.push('$');
    Ok(Regex::new(&regex_pattern)?)
}

#[derive(Debug, Clone)]
pub struct PermittedDatabase {
    config: PermitConfig,
    driver: Regex,
    dbname: Regex,
    user: Regex,
}

impl PermittedDatabase {
    pub fn new(driver: &str, dbname: &str, user: &str) -> DbResult<Self> {
        Self::from_config(&PermitConfig {
            driver: driver.to_string(),
            dbname: dbname.to_string(),
            user: user.to_string(),
            host: None,
            port: 0,
        })
    }

    pub fn from_config(config: &PermitConfig) -> DbResult<Self> {
        Ok(Self {
            driver: glob_to_regex(&config.driver)?,
            dbname: glob_to_regex(&config.dbname)?,
            user: glob_to_regex(&config.user)?,
            config: config.clone(),
        })
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.config.host = Some(host.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn config(&self) -> &PermitConfig {
        &self.config
    }

    /// True when this entry was built from the same patterns, host and port
    pub fn is(&self, driver: &str, dbname: &str, user: &str, host: Option<&str>, port: u16) -> bool {
        self.config.driver == driver
            && self.config.dbname == dbname
            && self.config.user == user
            && self.config.host.as_deref() == host
            && self.config.port == port
    }

    pub fn matches(&self, open: &Open) -> bool {
        let host_ok = match (&self.config.host, &open.host) {
            (None, _) => true,
            (Some(permitted), Some(host)) => permitted.eq_ignore_ascii_case(host),
            (Some(_), None) => false,
        };
        let port_ok = self.config.port == 0 || self.config.port == open.port;

        host_ok
            && port_ok
            && self.driver.is_match(&open.driver)
            && self.dbname.is_match(&open.dbname)
            && self.user.is_match(&open.user)
    }
}
