use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tracing::{debug, info, warn};

use super::{
    AccountDriver, DriverError, DriverSettings,
    keys::{read_authorized_keys, remove_authorized_keys, write_authorized_keys},
    passwd::{parse_group, parse_passwd, parse_shadow_entry},
};
use crate::{
    domain::{AccountDefaults, ChangeSet, DesiredAccount, LiveAccount},
    fetcher::BoxFuture,
    paths::Paths,
    processes::{ProcessTerminator, ProcfsTerminator, TerminateError},
};

/// Shadow-utils backed driver (`useradd`, `usermod`, `groupadd`).
pub struct UnixAccountDriver {
    paths: Paths,
    defaults: AccountDefaults,
    command_timeout: Duration,
    terminator: Arc<dyn ProcessTerminator>,
}

impl UnixAccountDriver {
    pub fn new(settings: DriverSettings) -> Self {
        let terminator = Arc::new(ProcfsTerminator::new(settings.paths.proc_dir()));
        Self::with_terminator(settings, terminator)
    }

    pub fn with_terminator(settings: DriverSettings, terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self {
            paths: settings.paths,
            defaults: settings.defaults,
            command_timeout: settings.command_timeout,
            terminator,
        }
    }

    fn home_on_disk(&self, home: &Path) -> PathBuf {
        self.paths.map_abs(home)
    }

    /// Shadow-utils operate on the alternate root too when one is configured.
    fn with_root(&self, mut args: Vec<String>) -> Vec<String> {
        if self.paths.is_alternate_root() {
            let mut out = vec![
                "--root".to_string(),
                self.paths.root().to_string_lossy().into_owned(),
            ];
            out.append(&mut args);
            args = out;
        }
        args
    }

    async fn run(&self, program: &'static str, args: Vec<String>) -> Result<(), DriverError> {
        let args = self.with_root(args);
        debug!(program, args = %args.join(" "), "running");
        run_command_with_timeout(program, &args, self.command_timeout).await
    }

    fn read_live(&self, username: &str) -> Result<Option<LiveAccount>, DriverError> {
        let passwd_path = self.paths.etc_passwd();
        let passwd = fs::read_to_string(&passwd_path)
            .map_err(|e| DriverError::io(format!("read {}", passwd_path.display()), e))?;
        let Some(entry) = parse_passwd(&passwd)
            .into_iter()
            .find(|e| e.name == username)
        else {
            return Ok(None);
        };

        let groups = read_optional(&self.paths.etc_group())?
            .map(|c| parse_group(&c))
            .unwrap_or_default();
        let primary_group = groups
            .iter()
            .find(|g| g.gid == entry.gid)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| entry.gid.to_string());
        let supplementary = groups
            .iter()
            .filter(|g| g.members.iter().any(|m| m == username))
            .map(|g| g.name.clone())
            .collect::<BTreeSet<_>>();

        let shadow = read_optional(&self.paths.etc_shadow())?
            .and_then(|c| parse_shadow_entry(&c, username));
        let today = chrono::Utc::now().timestamp().div_euclid(86_400);
        // The shell alone is not a disabled marker; records may ask for it.
        let login_disabled = shadow.is_some_and(|s| s.password_locked || s.is_expired(today));

        let home_dir = PathBuf::from(&entry.home);
        let authorized_keys = read_authorized_keys(&self.home_on_disk(&home_dir))
            .map_err(|e| DriverError::io(format!("read authorized keys of {username}"), e))?;

        Ok(Some(LiveAccount {
            username: entry.name.clone(),
            uid: entry.uid,
            gid: entry.gid,
            full_name: entry.full_name().to_string(),
            home_dir,
            shell: entry.shell.clone(),
            primary_group,
            groups: supplementary,
            authorized_keys,
            login_disabled,
        }))
    }

    async fn ensure_groups<'g>(
        &self,
        wanted: impl IntoIterator<Item = &'g String>,
    ) -> Result<(), DriverError> {
        let existing = read_optional(&self.paths.etc_group())?
            .map(|c| parse_group(&c))
            .unwrap_or_default()
            .into_iter()
            .map(|g| g.name)
            .collect::<BTreeSet<_>>();

        for group in wanted {
            if group.is_empty() || existing.contains(group) {
                continue;
            }
            info!(group = %group, "creating missing group");
            self.run("groupadd", vec![group.clone()]).await?;
        }
        Ok(())
    }

    fn write_keys(&self, live: &LiveAccount, keys: &BTreeSet<String>) -> Result<(), DriverError> {
        write_authorized_keys(&self.home_on_disk(&live.home_dir), keys, live.uid, live.gid)
            .map_err(|e| DriverError::io(format!("write authorized keys of {}", live.username), e))
    }

    async fn create_account(&self, account: &DesiredAccount) -> Result<(), DriverError> {
        let account = account.clone().with_defaults(&self.defaults);
        let mut wanted = account.groups.iter().collect::<Vec<_>>();
        if !account.primary_group.is_empty() {
            wanted.push(&account.primary_group);
        }
        self.ensure_groups(wanted).await?;
        self.run("useradd", useradd_args(&account)).await?;

        if account.authorized_keys.is_empty() {
            return Ok(());
        }
        let live = self
            .read_live(&account.username)?
            .ok_or_else(|| DriverError::Vanished {
                username: account.username.clone(),
            })?;
        self.write_keys(&live, &account.authorized_keys)
    }

    async fn update_account(&self, live: &LiveAccount, changes: &ChangeSet) -> Result<(), DriverError> {
        let mut wanted = Vec::new();
        if let Some(groups) = &changes.groups {
            wanted.extend(groups.iter());
        }
        if let Some(primary) = &changes.primary_group {
            wanted.push(primary);
        }
        self.ensure_groups(wanted).await?;

        if let Some(args) = usermod_args(&live.username, changes) {
            self.run("usermod", args).await?;
        }
        if changes.reenable
            && let Err(err) = self
                .run("usermod", vec!["--unlock".to_string(), live.username.clone()])
                .await
        {
            // Fails for accounts that never had a password; the expiry reset
            // is enough for those.
            debug!(username = %live.username, error = %err, "password unlock skipped");
        }
        if let Some(keys) = &changes.authorized_keys {
            self.write_keys(live, keys)?;
        }
        Ok(())
    }

    async fn disable_account(&self, live: &LiveAccount) -> Result<(), DriverError> {
        if live.uid == 0 {
            return Err(DriverError::Refused(format!(
                "{} has uid 0 and will not be disabled",
                live.username
            )));
        }

        self.run("usermod", disable_args(&live.username, &self.defaults.nologin_shell))
            .await?;

        let removed = remove_authorized_keys(&self.home_on_disk(&live.home_dir))
            .map_err(|e| DriverError::io(format!("remove authorized keys of {}", live.username), e))?;
        debug!(username = %live.username, removed, "authorized keys stripped");

        let terminator = self.terminator.clone();
        let uid = live.uid;
        let killed = tokio::task::spawn_blocking(move || terminator.kill_all(uid))
            .await
            .map_err(|e| DriverError::io("process sweep", io::Error::other(e.to_string())))?;
        match killed {
            Ok(n) => info!(username = %live.username, uid, killed = n, "processes terminated"),
            Err(TerminateError::RootRefused) => {
                return Err(DriverError::Refused("uid 0".to_string()));
            }
            Err(err) => warn!(username = %live.username, uid, error = %err, "process sweep failed"),
        }
        Ok(())
    }
}

impl AccountDriver for UnixAccountDriver {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn lookup<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<LiveAccount>, DriverError>> {
        Box::pin(async move { self.read_live(username) })
    }

    fn create<'a>(&'a self, account: &'a DesiredAccount) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(self.create_account(account))
    }

    fn apply_change_set<'a>(
        &'a self,
        live: &'a LiveAccount,
        changes: &'a ChangeSet,
    ) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(self.update_account(live, changes))
    }

    fn disable<'a>(&'a self, live: &'a LiveAccount) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(self.disable_account(live))
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, DriverError> {
    match fs::read_to_string(path) {
        Ok(c) => Ok(Some(c)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DriverError::io(format!("read {}", path.display()), e)),
    }
}

/// Expects shell and home to be filled in already.
pub fn useradd_args(account: &DesiredAccount) -> Vec<String> {
    let mut args = vec!["-m".to_string(), "-s".to_string(), account.shell.clone()];
    if !account.full_name.is_empty() {
        args.extend(["-c".to_string(), account.full_name.clone()]);
    }
    if !account.groups.is_empty() {
        args.extend(["-G".to_string(), join(&account.groups)]);
    }
    if !account.home_dir.is_empty() {
        args.extend(["-d".to_string(), account.home_dir.clone()]);
    }
    if account.primary_group.is_empty() {
        args.push("-U".to_string());
    } else {
        args.extend(["-g".to_string(), account.primary_group.clone()]);
    }
    args.push(account.username.clone());
    args
}

/// `None` when nothing `usermod` handles has changed.
pub fn usermod_args(username: &str, changes: &ChangeSet) -> Option<Vec<String>> {
    let mut args = Vec::new();
    if changes.reenable {
        args.extend(["-e".to_string(), String::new()]);
    }
    if let Some(shell) = &changes.shell {
        args.extend(["-s".to_string(), shell.clone()]);
    }
    if let Some(full_name) = &changes.full_name {
        args.extend(["-c".to_string(), full_name.clone()]);
    }
    if let Some(primary) = &changes.primary_group {
        args.extend(["-g".to_string(), primary.clone()]);
    }
    if let Some(groups) = &changes.groups {
        args.extend(["-G".to_string(), join(groups)]);
    }
    if args.is_empty() {
        return None;
    }
    args.push(username.to_string());
    Some(args)
}

/// Locks the password, expires the account, sets the no-login shell and drops
/// all supplementary groups.
pub fn disable_args(username: &str, nologin_shell: &str) -> Vec<String> {
    vec![
        "-L".to_string(),
        "-e".to_string(),
        "1".to_string(),
        "-s".to_string(),
        nologin_shell.to_string(),
        "-G".to_string(),
        String::new(),
        username.to_string(),
    ]
}

fn join(groups: &BTreeSet<String>) -> String {
    groups.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

async fn run_command_with_timeout(
    program: &'static str,
    args: &[String],
    timeout: Duration,
) -> Result<(), DriverError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(DriverError::Command {
                program,
                details: format!("spawn: {err}"),
            });
        }
        Err(_) => {
            return Err(DriverError::Command {
                program,
                details: format!("timed out after {}s", timeout.as_secs()),
            });
        }
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(DriverError::Command {
        program,
        details: format!("exited with {}: {stderr}", output.status),
    })
}
