pub mod keys;
pub mod passwd;
#[cfg(unix)]
pub mod unix;

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    domain::{AccountDefaults, ChangeSet, DesiredAccount, LiveAccount},
    fetcher::BoxFuture,
    paths::Paths,
};

#[derive(Debug)]
pub enum DriverError {
    Io {
        context: String,
        source: std::io::Error,
    },
    Command {
        program: &'static str,
        details: String,
    },
    Vanished {
        username: String,
    },
    Refused(String),
    Unsupported,
}

impl DriverError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Command { program, details } => write!(f, "{program}: {details}"),
            Self::Vanished { username } => {
                write!(f, "account {username} is missing after it was created")
            }
            Self::Refused(msg) => write!(f, "refused: {msg}"),
            Self::Unsupported => write!(f, "account management is not supported on this platform"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Applies account changes to the operating system. Each call is independent;
/// none of them retries internally.
pub trait AccountDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<LiveAccount>, DriverError>>;

    fn create<'a>(&'a self, account: &'a DesiredAccount) -> BoxFuture<'a, Result<(), DriverError>>;

    fn apply_change_set<'a>(
        &'a self,
        live: &'a LiveAccount,
        changes: &'a ChangeSet,
    ) -> BoxFuture<'a, Result<(), DriverError>>;

    /// Locks the account out and terminates its processes. Safe to repeat.
    fn disable<'a>(&'a self, live: &'a LiveAccount) -> BoxFuture<'a, Result<(), DriverError>>;
}

/// Reads through to another driver and only logs what it would change.
pub struct DryRunDriver {
    inner: Arc<dyn AccountDriver>,
}

impl DryRunDriver {
    pub fn new(inner: Arc<dyn AccountDriver>) -> Self {
        Self { inner }
    }
}

impl AccountDriver for DryRunDriver {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn lookup<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<LiveAccount>, DriverError>> {
        self.inner.lookup(username)
    }

    fn create<'a>(&'a self, account: &'a DesiredAccount) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(async move {
            info!(
                username = %account.username,
                shell = %account.shell,
                home_dir = %account.home_dir,
                groups = account.groups.len(),
                keys = account.authorized_keys.len(),
                "dry run: would create account"
            );
            Ok(())
        })
    }

    fn apply_change_set<'a>(
        &'a self,
        live: &'a LiveAccount,
        changes: &'a ChangeSet,
    ) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(async move {
            info!(
                username = %live.username,
                fields = %changes.changed_fields().join(","),
                "dry run: would update account"
            );
            Ok(())
        })
    }

    fn disable<'a>(&'a self, live: &'a LiveAccount) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(async move {
            info!(username = %live.username, uid = live.uid, "dry run: would disable account");
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct UnsupportedDriver;

impl AccountDriver for UnsupportedDriver {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn lookup<'a>(
        &'a self,
        _username: &'a str,
    ) -> BoxFuture<'a, Result<Option<LiveAccount>, DriverError>> {
        Box::pin(async { Err(DriverError::Unsupported) })
    }

    fn create<'a>(&'a self, _account: &'a DesiredAccount) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(async { Err(DriverError::Unsupported) })
    }

    fn apply_change_set<'a>(
        &'a self,
        _live: &'a LiveAccount,
        _changes: &'a ChangeSet,
    ) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(async { Err(DriverError::Unsupported) })
    }

    fn disable<'a>(&'a self, _live: &'a LiveAccount) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(async { Err(DriverError::Unsupported) })
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub paths: Paths,
    pub defaults: AccountDefaults,
    pub command_timeout: Duration,
}

#[cfg(unix)]
pub fn platform_driver(settings: DriverSettings) -> Arc<dyn AccountDriver> {
    Arc::new(unix::UnixAccountDriver::new(settings))
}

#[cfg(not(unix))]
pub fn platform_driver(_settings: DriverSettings) -> Arc<dyn AccountDriver> {
    Arc::new(UnsupportedDriver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingDriver {
        calls: Mutex<Vec<&'static str>>,
    }

    impl AccountDriver for CountingDriver {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn lookup<'a>(
            &'a self,
            username: &'a str,
        ) -> BoxFuture<'a, Result<Option<LiveAccount>, DriverError>> {
            self.calls.lock().unwrap().push("lookup");
            Box::pin(async move {
                Ok(Some(LiveAccount {
                    username: username.to_string(),
                    uid: 1000,
                    ..Default::default()
                }))
            })
        }

        fn create<'a>(&'a self, _: &'a DesiredAccount) -> BoxFuture<'a, Result<(), DriverError>> {
            self.calls.lock().unwrap().push("create");
            Box::pin(async { Ok(()) })
        }

        fn apply_change_set<'a>(
            &'a self,
            _: &'a LiveAccount,
            _: &'a ChangeSet,
        ) -> BoxFuture<'a, Result<(), DriverError>> {
            self.calls.lock().unwrap().push("apply");
            Box::pin(async { Ok(()) })
        }

        fn disable<'a>(&'a self, _: &'a LiveAccount) -> BoxFuture<'a, Result<(), DriverError>> {
            self.calls.lock().unwrap().push("disable");
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn dry_run_reads_through_but_never_mutates() {
        let inner = Arc::new(CountingDriver::default());
        let driver = DryRunDriver::new(inner.clone());

        let live = driver.lookup("alice").await.unwrap().unwrap();
        assert_eq!(live.uid, 1000);
        driver.create(&DesiredAccount::default()).await.unwrap();
        driver
            .apply_change_set(&live, &ChangeSet::default())
            .await
            .unwrap();
        driver.disable(&live).await.unwrap();

        assert_eq!(*inner.calls.lock().unwrap(), vec!["lookup"]);
        assert_eq!(driver.name(), "dry-run");
    }

    #[tokio::test]
    async fn unsupported_driver_errors_on_everything() {
        let driver = UnsupportedDriver;
        assert!(matches!(
            driver.lookup("alice").await,
            Err(DriverError::Unsupported)
        ));
        assert!(driver.disable(&LiveAccount::default()).await.is_err());
    }
}
