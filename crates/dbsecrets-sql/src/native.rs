//! Native drivers compiled into this crate

use std::sync::Arc;

use dbsecrets_plugin::{Error, Result};

use crate::connection::{ConnectionFactory, DatabaseType};
use crate::database::{Connector, SqlConfig};

/// [`Connector`] backed by the enabled driver features
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

impl Connector for NativeConnector {
    fn connection_factory(
        &self,
        database_type: DatabaseType,
        config: &SqlConfig,
    ) -> Result<Arc<dyn ConnectionFactory>> {
        match database_type {
            #[cfg(feature = "postgres")]
            DatabaseType::PostgreSQL => Ok(Arc::new(
                crate::postgres::PgConnectionFactory::from_config(config)?,
            )),
            #[cfg(feature = "sqlserver")]
            DatabaseType::SqlServer => Ok(Arc::new(
                crate::sqlserver::SqlServerConnectionFactory::from_config(config)?,
            )),
            #[cfg(feature = "snowflake")]
            DatabaseType::Snowflake => Ok(Arc::new(
                crate::snowflake::SnowflakeConnectionFactory::from_config(config)?,
            )),
            #[allow(unreachable_patterns)]
            other => {
                let _ = config;
                Err(Error::unsupported(format!(
                    "{other} support is not compiled in"
                )))
            }
        }
    }
}
