use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Context};
use crate::table::Registry;

/// Digests every open table whose row-store log crossed a threshold.
pub struct DigestTask {
    registry: Arc<Registry>,
}

impl DigestTask {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for DigestTask {
    fn name(&self) -> &'static str {
        "digest"
    }

    fn interval(&self) -> Duration {
        self.registry.config().digest_interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        for table in self.registry.tables() {
            match table.should_digest() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(table = table.name(), error = %e, "failed to check row log");
                    continue;
                }
            }

            let name = table.name().to_string();
            let digested = tokio::task::spawn_blocking(move || table.digest())
                .await
                .map_err(|e| Error::InvalidState(format!("digest task join error: {}", e)))?;
            match digested {
                Ok(records) => debug!(table = %name, records, run_id = ctx.run_id, "background digest"),
                Err(e) => error!(table = %name, error = %e, "background digest failed"),
            }
        }
        Ok(())
    }
}
