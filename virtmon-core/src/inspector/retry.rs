//! Cached hypervisor connection with a single reconnect on loss.

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Opens connections to the hypervisor.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send + Sync;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// Holds one cached connection.
///
/// When an operation fails with `ConnectionLost`, the cached handle is
/// dropped and the operation is retried exactly once on a fresh connection.
/// Any other error is returned as is.
pub struct Reconnecting<C: Connector> {
    connector: C,
    cached: Mutex<Option<Arc<C::Connection>>>,
}

impl<C: Connector> Reconnecting<C> {
    pub fn new(connector: C) -> Self {
        Self { connector, cached: Mutex::new(None) }
    }

    /// Current connection, opening one if needed.
    pub async fn connection(&self) -> Result<Arc<C::Connection>> {
        let mut cached = self.cached.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        debug!("Opening hypervisor connection");
        let conn = Arc::new(self.connector.connect().await?);
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    /// Run `op` against the connection, reconnecting once if it was lost.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<C::Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Err(e) if e.is_connection_lost() => {
                warn!(error = %e, "Hypervisor connection lost, reconnecting");
                self.invalidate().await;
                let conn = self.connection().await?;
                op(conn).await
            }
            other => other,
        }
    }
}
