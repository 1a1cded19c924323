use std::collections::BTreeSet;

use tracing::debug;

use crate::domain::{Member, MemberStatus, MembershipEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupError {
    NoGroups,
}

impl std::fmt::Display for DedupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoGroups => write!(f, "no groups of users provided"),
        }
    }
}

impl std::error::Error for DedupError {}

/// Merges per-group rosters into one roster with unique usernames.
///
/// A user enabled in any roster stays enabled. Group tags of all duplicates are
/// unioned. The result is sorted by username.
pub fn dedupe_members(rosters: Vec<Vec<Member>>) -> Result<Vec<MembershipEntry>, DedupError> {
    if rosters.is_empty() {
        return Err(DedupError::NoGroups);
    }

    let mut members: Vec<Member> = if rosters.len() == 1 {
        rosters.into_iter().flatten().collect()
    } else {
        let total = rosters.iter().map(Vec::len).sum();
        let mut all = Vec::with_capacity(total);
        for roster in rosters {
            all.extend(roster);
        }
        all
    };

    // Stable, so the first occurrence of a username leads its run.
    members.sort_by(|a, b| a.username.cmp(&b.username));

    let mut out: Vec<MembershipEntry> = Vec::with_capacity(members.len());
    for member in members {
        match out.last_mut() {
            Some(run) if run.username == member.username => {
                if member.status == MemberStatus::Enabled {
                    run.status = MemberStatus::Enabled;
                }
                run.source_groups.extend(member.groups);
            }
            _ => out.push(MembershipEntry {
                username: member.username,
                status: member.status,
                source_groups: member.groups.into_iter().collect::<BTreeSet<_>>(),
            }),
        }
    }

    debug!(
        users = out.len(),
        "deduplicated roster: {}",
        out.iter()
            .map(|e| format!("{}={}", e.username, e.status.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    );
    Ok(out)
}
