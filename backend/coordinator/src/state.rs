//! Shared application state: the protocol instance and its persistence.
//!
//! Every mutating call goes through [`AppState::mutate`], which holds the
//! write lock for the whole command. Commands are therefore applied one at
//! a time, and a command's events and resulting snapshot are committed to
//! SQLite before the next command can observe its effects.

use std::sync::Arc;

use ecotask_protocol::{Address, Clock, EcoTaskProtocol, ErrorKind};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db;
use crate::errors::{CoordinatorError, Result};

pub struct AppState {
    pub pool: SqlitePool,
    pub protocol: RwLock<EcoTaskProtocol>,
}

impl AppState {
    pub fn new(pool: SqlitePool, protocol: EcoTaskProtocol) -> Self {
        Self {
            pool,
            protocol: RwLock::new(protocol),
        }
    }

    /// Rebuild the protocol from the persisted snapshot, or start empty on a
    /// fresh database.
    pub async fn restore(
        pool: SqlitePool,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let protocol = match db::load_snapshot(&pool).await? {
            Some((store, next_seq)) => {
                info!(next_seq, "Restored protocol snapshot");
                EcoTaskProtocol::from_store(config.protocol.clone(), clock, store, next_seq)
                    .map_err(|e| CoordinatorError::Snapshot(e.to_string()))?
            }
            None => {
                info!("No snapshot found, starting with an empty protocol");
                EcoTaskProtocol::new(config.protocol.clone(), clock)?
            }
        };
        Ok(Self::new(pool, protocol))
    }

    /// Make sure the protocol has a SuperAdmin before serving requests.
    ///
    /// The SuperAdmin is only ever installed from configuration; there is no
    /// route for it. A fresh database therefore needs `SUPER_ADMIN`, while a
    /// restored one keeps whoever holds the role.
    pub async fn ensure_super_admin(&self, configured: Option<&str>) -> Result<()> {
        match configured {
            Some(super_admin) => self.bootstrap_super_admin(&Address::from(super_admin)).await,
            None => match self.protocol.read().await.super_admin() {
                Some(current) => {
                    debug!(%current, "Using persisted SuperAdmin");
                    Ok(())
                }
                None => Err(CoordinatorError::Config(
                    "SUPER_ADMIN must be set to initialise a fresh database".to_string(),
                )),
            },
        }
    }

    /// Install `super_admin` unless access control is already initialised.
    pub async fn bootstrap_super_admin(&self, super_admin: &Address) -> Result<()> {
        match self.mutate(|p| p.init(super_admin)).await {
            Ok(()) => {
                info!(%super_admin, "SuperAdmin installed");
                Ok(())
            }
            Err(CoordinatorError::Protocol(e)) if e.kind() == ErrorKind::AlreadyDone => {
                debug!("Access control already initialised");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one command and persist its events together with the new
    /// snapshot. If the command or the write fails, the in-memory protocol
    /// is rolled back to where it was before the call.
    pub async fn mutate<T>(
        &self,
        command: impl FnOnce(&mut EcoTaskProtocol) -> ecotask_protocol::Result<T>,
    ) -> Result<T> {
        let mut protocol = self.protocol.write().await;
        let checkpoint = protocol.checkpoint();

        // A closure may chain several core calls; undo the earlier ones if a
        // later one fails.
        let value = match command(&mut protocol) {
            Ok(value) => value,
            Err(err) => {
                protocol.rollback(checkpoint);
                return Err(err.into());
            }
        };
        let events = protocol.drain_events();
        let next_seq = protocol.next_event_seq();

        if let Err(err) = db::persist(&self.pool, protocol.store(), next_seq, &events).await {
            error!(error = %err, "Failed to persist command, rolling back");
            protocol.rollback(checkpoint);
            return Err(err);
        }
        Ok(value)
    }
}
