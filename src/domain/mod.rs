use std::{collections::BTreeSet, path::PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Enabled,
    Disabled,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

/// One roster row as it arrives in a group payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub username: String,
    pub status: MemberStatus,
    #[serde(default, alias = "common_groups", deserialize_with = "null_as_default")]
    pub groups: Vec<String>,
}

impl Member {
    pub fn new(username: impl Into<String>, status: MemberStatus) -> Self {
        Self {
            username: username.into(),
            status,
            groups: Vec::new(),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// A member after duplicates across all rosters of a batch have been merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub username: String,
    pub status: MemberStatus,
    pub source_groups: BTreeSet<String>,
}

/// Position of a notification in the upstream change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Watermark {
    pub create_index: i64,
    pub modify_index: i64,
    pub lock_index: i64,
    pub last_seen_at_ms: i64,
}

impl Watermark {
    pub fn candidate(create_index: i64, modify_index: i64, lock_index: i64) -> Self {
        Self {
            create_index,
            modify_index,
            lock_index,
            last_seen_at_ms: 0,
        }
    }

    /// Only `modify_index` takes part in ordering.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.modify_index > other.modify_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountAction {
    Create,
    Disable,
    #[default]
    Null,
}

impl AccountAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Disable => "disable",
            Self::Null => "null",
        }
    }
}

/// Target configuration for one account, as stored upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DesiredAccount {
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub full_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: BTreeSet<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub primary_group: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub home_dir: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub shell: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub action: AccountAction,
    #[serde(default, deserialize_with = "null_as_default")]
    pub authorized_keys: BTreeSet<String>,
    #[serde(skip)]
    pub exists_locally: bool,
}

impl DesiredAccount {
    /// Fills unset shell and home directory from platform defaults.
    pub fn with_defaults(mut self, defaults: &AccountDefaults) -> Self {
        if self.shell.is_empty() {
            self.shell = defaults.shell.clone();
        }
        if self.home_dir.is_empty() {
            self.home_dir = defaults
                .home_base
                .join(&self.username)
                .to_string_lossy()
                .into_owned();
        }
        self
    }
}

/// The OS's current view of an account.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveAccount {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub full_name: String,
    pub home_dir: PathBuf,
    pub shell: String,
    pub primary_group: String,
    pub groups: BTreeSet<String>,
    pub authorized_keys: BTreeSet<String>,
    pub login_disabled: bool,
}

/// Fields that differ between desired and live state. `None` means unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSet {
    pub shell: Option<String>,
    pub full_name: Option<String>,
    pub groups: Option<BTreeSet<String>>,
    pub primary_group: Option<String>,
    pub authorized_keys: Option<BTreeSet<String>>,
    pub reenable: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.reenable {
            out.push("reenable");
        }
        if self.shell.is_some() {
            out.push("shell");
        }
        if self.full_name.is_some() {
            out.push("full_name");
        }
        if self.primary_group.is_some() {
            out.push("primary_group");
        }
        if self.groups.is_some() {
            out.push("groups");
        }
        if self.authorized_keys.is_some() {
            out.push("authorized_keys");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDefaults {
    pub shell: String,
    pub home_base: PathBuf,
    pub nologin_shell: String,
}

impl Default for AccountDefaults {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            home_base: PathBuf::from("/home"),
            nologin_shell: "/sbin/nologin".to_string(),
        }
    }
}

/// Trims every key line and drops blank ones.
pub fn normalize_keys<I, S>(keys: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| k.as_ref().trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
