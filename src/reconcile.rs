use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    accounts::AccountDriver,
    domain::{
        AccountAction, AccountDefaults, ChangeSet, DesiredAccount, LiveAccount, MemberStatus,
        MembershipEntry, normalize_keys,
    },
    fetcher::{DesiredStateFetcher, FetchError},
};

/// What to do with one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Create(DesiredAccount),
    Disable(LiveAccount),
    Update(LiveAccount, ChangeSet),
    NoOp,
}

pub fn plan(desired: &DesiredAccount, live: Option<LiveAccount>, defaults: &AccountDefaults) -> Plan {
    let Some(live) = live else {
        return match desired.action {
            AccountAction::Disable => Plan::NoOp,
            AccountAction::Create | AccountAction::Null => {
                Plan::Create(desired.clone().with_defaults(defaults))
            }
        };
    };

    if desired.action == AccountAction::Disable {
        return Plan::Disable(live);
    }

    let changes = diff(desired, &live, defaults);
    if changes.is_empty() {
        Plan::NoOp
    } else {
        Plan::Update(live, changes)
    }
}

/// Empty desired values never replace live ones.
pub fn diff(desired: &DesiredAccount, live: &LiveAccount, defaults: &AccountDefaults) -> ChangeSet {
    let mut changes = ChangeSet {
        reenable: live.login_disabled && desired.action == AccountAction::Create,
        ..Default::default()
    };

    let shell = if desired.shell.is_empty()
        && changes.reenable
        && live.shell == defaults.nologin_shell
    {
        defaults.shell.as_str()
    } else {
        desired.shell.as_str()
    };
    if !shell.is_empty() && shell != live.shell {
        changes.shell = Some(shell.to_string());
    }

    if !desired.full_name.is_empty() && desired.full_name != live.full_name {
        changes.full_name = Some(desired.full_name.clone());
    }
    if !desired.primary_group.is_empty() && desired.primary_group != live.primary_group {
        changes.primary_group = Some(desired.primary_group.clone());
    }
    // The primary group never shows up in the live supplementary list.
    let primary = if desired.primary_group.is_empty() {
        &live.primary_group
    } else {
        &desired.primary_group
    };
    let groups = desired
        .groups
        .iter()
        .filter(|g| *g != primary)
        .cloned()
        .collect::<BTreeSet<_>>();
    if !groups.is_empty() && groups != live.groups {
        changes.groups = Some(groups);
    }

    let keys = normalize_keys(&desired.authorized_keys);
    if !keys.is_empty() && keys != live.authorized_keys {
        changes.authorized_keys = Some(keys);
    }

    changes
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UserOutcome {
    Created,
    Disabled,
    Updated { fields: Vec<&'static str> },
    NoOp,
    Skipped,
    Failed { error: String },
}

impl UserOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Disabled => "disabled",
            Self::Updated { .. } => "updated",
            Self::NoOp => "no_op",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserReport {
    pub username: String,
    #[serde(flatten)]
    pub outcome: UserOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub users: Vec<UserReport>,
}

impl ReconcileReport {
    pub fn count(&self, kind: &str) -> usize {
        self.users
            .iter()
            .filter(|u| u.outcome.as_str() == kind)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }
}

pub struct Reconciler {
    fetcher: Arc<dyn DesiredStateFetcher>,
    driver: Arc<dyn AccountDriver>,
    defaults: AccountDefaults,
}

impl Reconciler {
    pub fn new(
        fetcher: Arc<dyn DesiredStateFetcher>,
        driver: Arc<dyn AccountDriver>,
        defaults: AccountDefaults,
    ) -> Self {
        Self {
            fetcher,
            driver,
            defaults,
        }
    }

    /// Reconciles every entry in order. A store failure aborts the whole batch;
    /// driver failures only fail the user they happened for.
    pub async fn reconcile_all(
        &self,
        entries: &[MembershipEntry],
    ) -> Result<ReconcileReport, FetchError> {
        let mut report = ReconcileReport::default();
        for entry in entries {
            let outcome = self.reconcile_one(entry).await?;
            match &outcome {
                UserOutcome::Failed { error } => {
                    warn!(username = %entry.username, driver = self.driver.name(), error = %error, "reconcile failed");
                }
                UserOutcome::NoOp | UserOutcome::Skipped => {
                    debug!(username = %entry.username, outcome = outcome.as_str(), "reconciled");
                }
                _ => {
                    info!(username = %entry.username, outcome = outcome.as_str(), "reconciled");
                }
            }
            report.users.push(UserReport {
                username: entry.username.clone(),
                outcome,
            });
        }
        Ok(report)
    }

    async fn reconcile_one(&self, entry: &MembershipEntry) -> Result<UserOutcome, FetchError> {
        let Some(mut desired) = self.fetcher.get(&entry.username).await? else {
            warn!(username = %entry.username, "user not found upstream");
            return Ok(UserOutcome::Skipped);
        };
        if desired.username.is_empty() {
            desired.username = entry.username.clone();
        } else if desired.username != entry.username {
            warn!(
                username = %entry.username,
                record_username = %desired.username,
                "record names a different user, skipping"
            );
            return Ok(UserOutcome::Skipped);
        }
        if entry.status == MemberStatus::Disabled {
            desired.action = AccountAction::Disable;
        }

        let live = match self.driver.lookup(&desired.username).await {
            Ok(live) => live,
            Err(err) => {
                return Ok(UserOutcome::Failed {
                    error: err.to_string(),
                });
            }
        };
        desired.exists_locally = live.is_some();
        debug!(
            username = %desired.username,
            action = desired.action.as_str(),
            exists_locally = desired.exists_locally,
            "planning"
        );

        let result = match plan(&desired, live, &self.defaults) {
            Plan::NoOp => Ok(UserOutcome::NoOp),
            Plan::Create(account) => self
                .driver
                .create(&account)
                .await
                .map(|()| UserOutcome::Created),
            Plan::Disable(live) => self
                .driver
                .disable(&live)
                .await
                .map(|()| UserOutcome::Disabled),
            Plan::Update(live, changes) => self
                .driver
                .apply_change_set(&live, &changes)
                .await
                .map(|()| UserOutcome::Updated {
                    fields: changes.changed_fields(),
                }),
        };

        Ok(result.unwrap_or_else(|err| UserOutcome::Failed {
            error: err.to_string(),
        }))
    }
}
