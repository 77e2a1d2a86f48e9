//! Default revocation sweeps
//!
//! When DeleteUser carries no statements the SQL plugins remove access
//! themselves. A sweep first proves the user exists, then synthesizes the
//! revokes from live catalog data and runs every statement on its own,
//! outside a transaction, collecting failures instead of stopping. The
//! account is dropped last. Failures only surface when that final DROP
//! fails as well; otherwise they are logged and the sweep succeeds.
//!
//! Ordering is fixed: schema revokes, `public` revokes, the database-level
//! revoke, session termination, then DROP.

use tracing::{debug, warn};

use dbsecrets_plugin::security::{escape_string_literal, quote_bracket_identifier, quote_identifier};
use dbsecrets_plugin::{Error, Result};

use crate::connection::Connection;
use crate::dialect::SessionTermination;
use crate::types::{Row, Value};

const ROLE_SCHEMAS_QUERY: &str = "SELECT DISTINCT table_schema::text FROM information_schema.role_column_grants WHERE grantee=$1";
const CURRENT_DATABASE_QUERY: &str = "SELECT current_database()::text";

const MSSQL_SESSIONS_QUERY: &str = "SELECT session_id FROM sys.dm_exec_sessions WHERE login_name = @P1";
const MSSQL_DATABASES_QUERY: &str = "SELECT name FROM sys.databases WHERE state = 0";
const MSSQL_CURRENT_DATABASE_QUERY: &str = "SELECT DB_NAME()";

/// Run an existence probe. Without a probe the user is assumed to exist.
pub(crate) async fn user_exists(
    conn: &dyn Connection,
    query: Option<&str>,
    username: &str,
) -> Result<bool> {
    let Some(query) = query else {
        return Ok(true);
    };
    let row = conn.query_one(query, &[Value::from(username)]).await?;
    Ok(row
        .as_ref()
        .and_then(|r| r.get(0))
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

/// Revokes for one schema
fn schema_revokes(schema: &str, user: &str) -> [String; 2] {
    let schema = quote_identifier(schema);
    [
        format!("REVOKE ALL PRIVILEGES ON ALL TABLES IN SCHEMA {schema} FROM {user}"),
        format!("REVOKE USAGE ON SCHEMA {schema} FROM {user}"),
    ]
}

/// Procedure terminating every Redshift session owned by `username`
pub fn terminate_loop_statements(username: &str) -> [String; 2] {
    let literal = escape_string_literal(username);
    [
        format!(
            "CREATE OR REPLACE PROCEDURE terminateloop() AS $$ \
             DECLARE r RECORD; \
             BEGIN \
             FOR r IN SELECT process FROM stv_sessions WHERE user_name='{literal}' LOOP \
             EXECUTE 'SELECT pg_terminate_backend(' || r.process || ')'; \
             END LOOP; \
             END; \
             $$ LANGUAGE plpgsql;"
        ),
        "CALL terminateloop();".to_string(),
    ]
}

fn texts(rows: &[Row]) -> Vec<String> {
    rows.iter().filter_map(Row::first_text).collect()
}

/// Execute each statement on its own, collecting failures
async fn execute_all(conn: &dyn Connection, statements: &[String], errors: &mut Vec<Error>) {
    for sql in statements {
        if let Err(e) = conn.execute(sql, &[]).await {
            warn!(error = %e, "revocation statement failed, continuing");
            errors.push(e);
        }
    }
}

async fn finish(conn: &dyn Connection, drop_sql: &str, mut errors: Vec<Error>) -> Result<()> {
    match conn.execute(drop_sql, &[]).await {
        Ok(_) => {
            if !errors.is_empty() {
                warn!(
                    failures = errors.len(),
                    "user dropped although some revocation statements failed"
                );
            }
            Ok(())
        }
        Err(e) => {
            errors.push(e);
            Err(Error::PartialRevocation { errors })
        }
    }
}

/// Revocation sweep for PostgreSQL, YugabyteDB and Redshift
pub async fn postgres_sweep(
    conn: &dyn Connection,
    exists_query: Option<&str>,
    username: &str,
    termination: SessionTermination,
) -> Result<()> {
    if !user_exists(conn, exists_query, username).await? {
        debug!(username, "user does not exist, nothing to revoke");
        return Ok(());
    }

    let user = quote_identifier(username);
    let mut errors = Vec::new();
    let mut statements = Vec::new();

    match conn
        .query(ROLE_SCHEMAS_QUERY, &[Value::from(username)])
        .await
    {
        Ok(rows) => {
            for schema in texts(&rows) {
                if schema.eq_ignore_ascii_case("public") {
                    continue;
                }
                statements.extend(schema_revokes(&schema, &user));
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to list granted schemas, continuing");
            errors.push(e);
        }
    }
    statements.extend(schema_revokes("public", &user));

    let drop_sql = match termination {
        SessionTermination::RevokeConnect => {
            match conn.query_one(CURRENT_DATABASE_QUERY, &[]).await {
                Ok(row) => {
                    if let Some(database) = row.and_then(|row| row.first_text()) {
                        statements.push(format!(
                            "REVOKE CONNECT ON DATABASE {} FROM {user}",
                            quote_identifier(&database)
                        ));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to read current database, continuing");
                    errors.push(e);
                }
            }
            format!("DROP ROLE IF EXISTS {user}")
        }
        SessionTermination::TerminateLoop => {
            statements.extend(terminate_loop_statements(username));
            format!("DROP USER IF EXISTS {user}")
        }
    };

    execute_all(conn, &statements, &mut errors).await;
    finish(conn, &drop_sql, errors).await
}

/// Revocation sweep for SQL Server logins
pub async fn sqlserver_sweep(
    conn: &dyn Connection,
    exists_query: Option<&str>,
    username: &str,
) -> Result<()> {
    if !user_exists(conn, exists_query, username).await? {
        debug!(username, "login does not exist, nothing to revoke");
        return Ok(());
    }

    let login = quote_bracket_identifier(username);
    let literal = escape_string_literal(username);
    let mut errors = Vec::new();

    execute_all(conn, &[format!("ALTER LOGIN {login} DISABLE")], &mut errors).await;

    match conn
        .query(MSSQL_SESSIONS_QUERY, &[Value::from(username)])
        .await
    {
        Ok(rows) => {
            let kills: Vec<String> = rows
                .iter()
                .filter_map(|row| row.get(0).and_then(Value::as_i64))
                .map(|session| format!("KILL {session}"))
                .collect();
            execute_all(conn, &kills, &mut errors).await;
        }
        Err(e) => errors.push(e),
    }

    let original = conn
        .query_one(MSSQL_CURRENT_DATABASE_QUERY, &[])
        .await
        .ok()
        .flatten()
        .and_then(|row| row.first_text());

    match conn.query(MSSQL_DATABASES_QUERY, &[]).await {
        Ok(rows) => {
            let drops: Vec<String> = texts(&rows)
                .iter()
                .map(|database| {
                    format!(
                        "USE {}; IF EXISTS (SELECT name FROM sys.database_principals WHERE name = N'{literal}') BEGIN DROP USER {login} END",
                        quote_bracket_identifier(database)
                    )
                })
                .collect();
            execute_all(conn, &drops, &mut errors).await;
        }
        Err(e) => errors.push(e),
    }

    if let Some(database) = original {
        execute_all(
            conn,
            &[format!("USE {}", quote_bracket_identifier(&database))],
            &mut errors,
        )
        .await;
    }

    finish(conn, &format!("DROP LOGIN {login}"), errors).await
}
