//! Readers for the flat account databases under `/etc`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

impl PasswdEntry {
    /// The full name is the GECOS text before the first comma.
    pub fn full_name(&self) -> &str {
        self.gecos.split(',').next().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

fn data_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

/// Malformed lines are skipped.
pub fn parse_passwd(contents: &str) -> Vec<PasswdEntry> {
    data_lines(contents)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                gecos: fields[4].to_string(),
                home: fields[5].to_string(),
                shell: fields[6].to_string(),
            })
        })
        .collect()
}

pub fn parse_group(contents: &str) -> Vec<GroupEntry> {
    data_lines(contents)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields[3]
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowEntry {
    /// A `!` in front of a real hash. A bare `!` or `!!` only means no
    /// password was ever set.
    pub password_locked: bool,
    /// Account expiry in days since the epoch.
    pub expire_day: Option<i64>,
}

impl ShadowEntry {
    pub fn is_expired(&self, today: i64) -> bool {
        self.expire_day.is_some_and(|day| day <= today)
    }
}

pub fn parse_shadow_entry(contents: &str, username: &str) -> Option<ShadowEntry> {
    data_lines(contents).find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() != Some(&username) {
            return None;
        }
        let password = fields.get(1).copied().unwrap_or("");
        let expire_day = fields
            .get(7)
            .and_then(|f| f.trim().parse::<i64>().ok());
        Some(ShadowEntry {
            password_locked: password.starts_with('!') && !password.trim_start_matches('!').is_empty(),
            expire_day,
        })
    })
}
