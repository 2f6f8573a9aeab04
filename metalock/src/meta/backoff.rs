//! Run a closure inside one metadata transaction.
//!
//! Commit on `Ok`, roll back on `Err`. Transient backend errors (see
//! [`MetaError::is_retryable`]) rerun the whole closure with exponential
//! backoff; every other error, lock conflicts included, is returned as is.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::meta::config::LockConfig;
use crate::meta::store::{MetaError, MetaStore, MetaTxn};

pub(crate) async fn run_in_txn<S, T, F>(
    store: &S,
    config: &LockConfig,
    mut f: F,
) -> Result<T, MetaError>
where
    S: MetaStore + ?Sized,
    F: for<'t> FnMut(&'t mut dyn MetaTxn) -> BoxFuture<'t, Result<T, MetaError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match store.begin().await {
            Ok(mut txn) => {
                let outcome = f(txn.as_mut()).await;
                match outcome {
                    Ok(value) => txn.commit().await.map(|_| value),
                    Err(e) => {
                        if let Err(rollback_err) = txn.rollback().await {
                            warn!("rollback failed: {rollback_err}");
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < config.txn_max_retries => {
                attempt += 1;
                let delay = config.txn_backoff(attempt);
                debug!(attempt, ?delay, "transient meta error, retrying transaction: {e}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
