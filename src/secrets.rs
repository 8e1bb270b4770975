//! # Secret-store client contract.
//!
//! The supervisor consumes secrets through the [`SecretClient`] trait; the
//! real store backend is an external collaborator and is not part of this
//! crate. What ships here is the contract, the renewal-notice plumbing,
//! and [`NoopClient`], which satisfies the interface with empty results
//! for deployments that run without a secret store (`--no-vault`).
//!
//! Renewal notifications fan out over a broadcast channel; the supervisor
//! runs [`watch_renewals`] to log successful renewals and forward critical
//! failures onto its internal failure channel, which tears the supervisor
//! down with exit code 1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::SecretError;
use crate::logging::Logger;

/// A database username/password pair leased from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseCredential {
    pub username: String,
    pub password: String,
}

/// An AWS access key leased from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Opaque handle to a leased secret, used by the backend to drive renewal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lease(u64);

impl Lease {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// One renewal event emitted by the client's background task.
#[derive(Debug, Clone)]
pub struct RenewalNotice {
    /// Name of the renewed credential.
    pub name: String,
    /// When the renewal happened (or failed).
    pub time: SystemTime,
    /// Whether failure of this renewal should tear the supervisor down.
    pub critical: bool,
    /// The failure, if the renewal did not succeed.
    pub error: Option<String>,
}

/// Contract between the supervisor and a secret store.
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Authenticates against the store. Called once before any fetch.
    async fn authenticate(&self) -> Result<(), SecretError>;

    /// Background renewal task; runs until `token` is cancelled.
    async fn run(&self, token: CancellationToken);

    /// Subscribes to renewal notifications.
    fn notifications(&self) -> broadcast::Receiver<RenewalNotice>;

    /// Login token obtained during authentication, exported to children as
    /// `VAULT_TOKEN` when configured.
    fn token(&self) -> Option<String> {
        None
    }

    /// Fetches a database credential at `path`.
    async fn database_credential(
        &self,
        path: &str,
    ) -> Result<(DatabaseCredential, Lease), SecretError>;

    /// Fetches a free-form key/value secret at `path`.
    async fn secret(&self, path: &str) -> Result<(HashMap<String, String>, Lease), SecretError>;

    /// Fetches an AWS IAM user credential at `path`.
    async fn aws_iam_user(&self, path: &str) -> Result<(AwsCredential, Lease), SecretError>;
}

/// How the secret client should be constructed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions {
    /// When false, a [`NoopClient`] is used instead of a real store.
    pub enabled: bool,
    /// Resolve the store address via DNS SRV before connecting.
    pub discover: bool,
}

/// Builds the secret client for the given options.
///
/// The real store client is linked in by the deployment build; this crate
/// carries only the contract and the no-op implementation, so enabling the
/// store here fails fast instead of silently running without secrets.
pub async fn connect(opts: &ClientOptions) -> Result<Arc<dyn SecretClient>, SecretError> {
    if !opts.enabled {
        return Ok(Arc::new(NoopClient::new()));
    }
    Err(SecretError::Backend {
        reason: format!(
            "no secret-store backend linked into this binary (srv discovery {}); rerun with --no-vault",
            if opts.discover { "requested" } else { "off" },
        ),
    })
}

/// Secret client that satisfies the interface with empty results.
///
/// Used when the supervisor runs without a secret store. Fetches succeed
/// with empty credentials, authentication is a no-op, and the renewal task
/// emits nothing.
pub struct NoopClient {
    notify: broadcast::Sender<RenewalNotice>,
}

impl NoopClient {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(8);
        Self { notify }
    }
}

impl Default for NoopClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretClient for NoopClient {
    async fn authenticate(&self) -> Result<(), SecretError> {
        Ok(())
    }

    async fn run(&self, token: CancellationToken) {
        token.cancelled().await;
    }

    fn notifications(&self) -> broadcast::Receiver<RenewalNotice> {
        self.notify.subscribe()
    }

    async fn database_credential(
        &self,
        _path: &str,
    ) -> Result<(DatabaseCredential, Lease), SecretError> {
        Ok((DatabaseCredential::default(), Lease::default()))
    }

    async fn secret(&self, _path: &str) -> Result<(HashMap<String, String>, Lease), SecretError> {
        Ok((HashMap::new(), Lease::default()))
    }

    async fn aws_iam_user(&self, _path: &str) -> Result<(AwsCredential, Lease), SecretError> {
        Ok((AwsCredential::default(), Lease::default()))
    }
}

/// Forwards critical renewal failures onto the supervisor's failure
/// channel; successful renewals are logged and dropped.
pub async fn watch_renewals(
    mut notices: broadcast::Receiver<RenewalNotice>,
    logger: Logger,
    failures: mpsc::Sender<SecretError>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            res = notices.recv() => match res {
                Ok(notice) => {
                    if notice.critical {
                        if let Some(reason) = notice.error {
                            let _ = failures
                                .send(SecretError::Renewal {
                                    name: notice.name,
                                    reason,
                                })
                                .await;
                            continue;
                        }
                    }
                    logger
                        .log(format!("credential {} renewed", notice.name))
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_client_serves_empty_results() {
        let client = NoopClient::new();
        client.authenticate().await.unwrap();
        assert!(client.token().is_none());

        let (cred, _) = client.database_credential("db/any").await.unwrap();
        assert_eq!(cred, DatabaseCredential::default());
        let (map, _) = client.secret("kv/any").await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn connect_without_store_yields_noop() {
        let opts = ClientOptions {
            enabled: false,
            discover: false,
        };
        assert!(connect(&opts).await.is_ok());
    }

    #[tokio::test]
    async fn connect_with_store_enabled_fails_fast() {
        let opts = ClientOptions {
            enabled: true,
            discover: true,
        };
        assert!(matches!(
            connect(&opts).await,
            Err(SecretError::Backend { .. })
        ));
    }

    #[tokio::test]
    async fn critical_renewal_failures_reach_the_failure_channel() {
        let (notify, _) = broadcast::channel(8);
        let (logger, mut _logs) = Logger::new(8);
        let (fail_tx, mut fail_rx) = mpsc::channel(1);
        let token = CancellationToken::new();

        let watcher = tokio::spawn(watch_renewals(
            notify.subscribe(),
            logger,
            fail_tx,
            token.clone(),
        ));

        notify
            .send(RenewalNotice {
                name: "db-lease".to_string(),
                time: SystemTime::now(),
                critical: true,
                error: Some("permission denied".to_string()),
            })
            .unwrap();

        let err = fail_rx.recv().await.unwrap();
        assert!(matches!(err, SecretError::Renewal { .. }));
        token.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn successful_renewals_are_only_logged() {
        let (notify, _) = broadcast::channel(8);
        let (logger, mut logs) = Logger::new(8);
        let (fail_tx, mut fail_rx) = mpsc::channel(1);
        let token = CancellationToken::new();

        let watcher = tokio::spawn(watch_renewals(
            notify.subscribe(),
            logger,
            fail_tx,
            token.clone(),
        ));

        notify
            .send(RenewalNotice {
                name: "db-lease".to_string(),
                time: SystemTime::now(),
                critical: true,
                error: None,
            })
            .unwrap();

        let rec = logs.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&rec.message).contains("db-lease"));
        assert!(fail_rx.try_recv().is_err());
        token.cancel();
        watcher.await.unwrap();
    }
}
