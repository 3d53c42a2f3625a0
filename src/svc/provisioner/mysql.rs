//! # MySql driver
//!
//! This module provide the provisioner of mysql compatible servers. A new
//! connection is opened for each operation and closed once done.

use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlConnection},
    ConnectOptions, Connection, Executor,
};
use tracing::{debug, info};

use crate::svc::provisioner::{self, Credentials, Endpoint, Error, Provisioner};

// -----------------------------------------------------------------------------
// Constants

pub const KIND: &str = "mysql";

/// host part of the managed users, they may connect from anywhere
pub const USER_HOST: &str = "%";

// -----------------------------------------------------------------------------
// Statement helpers

/// returns the identifier quoted with backticks
pub fn identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// returns the value as a single quoted string literal
pub fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// returns the account name of the given user
pub fn account(user: &str) -> String {
    format!("{}@{}", literal(user), literal(USER_HOST))
}

// -----------------------------------------------------------------------------
// Statement structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Statement {
    pub action: &'static str,
    pub sql: String,
    /// the statement embeds a password, server errors about it are not reported
    pub sensitive: bool,
}

impl Statement {
    fn new(action: &'static str, sql: String) -> Self {
        Self {
            action,
            sql,
            sensitive: false,
        }
    }

    fn sensitive(action: &'static str, sql: String) -> Self {
        Self {
            action,
            sql,
            sensitive: true,
        }
    }
}

/// returns the statements which create the database and the user owning it,
/// each one is idempotent
pub fn create_statements(name: &str, user: &Credentials) -> Vec<Statement> {
    let account = account(&user.user);
    let password = literal(&user.password);

    vec![
        Statement::new(
            "create database",
            format!("CREATE DATABASE IF NOT EXISTS {}", identifier(name)),
        ),
        Statement::sensitive(
            "create user",
            format!("CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {password}"),
        ),
        Statement::sensitive(
            "set user password",
            format!("ALTER USER {account} IDENTIFIED BY {password}"),
        ),
        Statement::new(
            "grant privileges",
            format!(
                "GRANT ALL PRIVILEGES ON {}.* TO {account}",
                identifier(name)
            ),
        ),
    ]
}

/// returns the statements which drop the database and its user, each one is
/// idempotent
pub fn delete_statements(name: &str, user: &str) -> Vec<Statement> {
    vec![
        Statement::new(
            "delete database",
            format!("DROP DATABASE IF EXISTS {}", identifier(name)),
        ),
        Statement::new(
            "delete user",
            format!("DROP USER IF EXISTS {}", account(user)),
        ),
    ]
}

// -----------------------------------------------------------------------------
// Driver structure

#[derive(Clone, Copy, Default, Debug)]
pub struct Driver;

impl provisioner::Driver for Driver {
    fn provisioner(&self, endpoint: Endpoint, root: Credentials) -> Box<dyn Provisioner> {
        Box::new(Server { endpoint, root })
    }
}

// -----------------------------------------------------------------------------
// Server structure

#[derive(Clone, Debug)]
pub struct Server {
    endpoint: Endpoint,
    root: Credentials,
}

impl Server {
    async fn connect(&self) -> Result<MySqlConnection, Error> {
        debug!(
            endpoint = self.endpoint.to_string(),
            user = &self.root.user,
            "Open connection to mysql server",
        );

        MySqlConnectOptions::new()
            .host(&self.endpoint.host)
            .port(self.endpoint.port)
            .username(&self.root.user)
            .password(&self.root.password)
            .connect()
            .await
            .map_err(|err| Error::Connect(self.endpoint.to_string(), err))
    }

    /// runs the statements in order on a fresh connection, the connection is
    /// closed whatever the outcome
    async fn run(&self, statements: Vec<Statement>) -> Result<(), Error> {
        let mut conn = self.connect().await?;
        let mut result = Ok(());

        for statement in statements {
            debug!(
                endpoint = self.endpoint.to_string(),
                action = statement.action,
                "Execute statement on mysql server",
            );

            if let Err(err) = conn.execute(statement.sql.as_str()).await {
                let code = err
                    .as_database_error()
                    .map(|db| db.code().map(|code| code.to_string()).unwrap_or_default());

                result = Err(match code {
                    Some(code) if statement.sensitive => Error::Rejected(statement.action, code),
                    _ => Error::Execute(statement.action, err),
                });
                break;
            }
        }

        if let Err(err) = conn.close().await {
            debug!(
                endpoint = self.endpoint.to_string(),
                error = err.to_string(),
                "Could not close connection to mysql server gracefully",
            );
        }

        result
    }
}

#[async_trait]
impl Provisioner for Server {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, user)))]
    async fn create_database(&self, name: &str, user: &Credentials) -> Result<(), Error> {
        self.run(create_statements(name, user)).await?;

        info!(
            endpoint = self.endpoint.to_string(),
            database = name,
            user = &user.user,
            "Database and user created on mysql server",
        );

        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete_database(&self, name: &str, user: &str) -> Result<(), Error> {
        self.run(delete_statements(name, user)).await?;

        info!(
            endpoint = self.endpoint.to_string(),
            database = name,
            user = user,
            "Database and user dropped on mysql server",
        );

        Ok(())
    }
}
