use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum IssueKind {
    #[serde(rename = "ITA")]
    Ita,
    #[serde(rename = "ITP")]
    Itp,
    #[serde(rename = "O")]
    O,
    #[serde(rename = "RFA")]
    Rfa,
    #[serde(rename = "RFH")]
    Rfh,
    #[serde(rename = "RFP")]
    Rfp,
}

impl IssueKind {
    pub const ALL: [IssueKind; 6] = [
        Self::Ita,
        Self::Itp,
        Self::O,
        Self::Rfa,
        Self::Rfh,
        Self::Rfp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ita => "ITA",
            Self::Itp => "ITP",
            Self::O => "O",
            Self::Rfa => "RFA",
            Self::Rfh => "RFH",
            Self::Rfp => "RFP",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ita => "ITA (Intent to adopt)",
            Self::Itp => "ITP (Intent to package)",
            Self::O => "O (Orphaned)",
            Self::Rfa => "RFA (Request for adoption)",
            Self::Rfh => "RFH (Request for help)",
            Self::Rfp => "RFP (request for packaging)",
        }
    }

    /// ITP and RFP issues are about software that is not in Debian yet.
    pub fn has_existing_package(self) -> bool {
        !matches!(self, Self::Itp | Self::Rfp)
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "ITA" => Ok(Self::Ita),
            "ITP" => Ok(Self::Itp),
            "O" => Ok(Self::O),
            "RFA" => Ok(Self::Rfa),
            "RFH" => Ok(Self::Rfh),
            "RFP" => Ok(Self::Rfp),
            other => bail!("unknown issue kind {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    #[serde(rename = "MOD")]
    Modified,
    #[serde(rename = "OPEN")]
    Opened,
    #[serde(rename = "CLOSE")]
    Closed,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [Self::Modified, Self::Opened, Self::Closed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Modified => "MOD",
            Self::Opened => "OPEN",
            Self::Closed => "CLOSE",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Modified => "Modified",
            Self::Opened => "Opened",
            Self::Closed => "Closed",
        }
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "MOD" => Ok(Self::Modified),
            "OPEN" => Ok(Self::Opened),
            "CLOSE" => Ok(Self::Closed),
            other => bail!("unknown event kind {other:?}"),
        }
    }
}

const SECONDS_PER_DAY: i64 = 86_400;

/// A row of `debian_wnpp`. Stamps are UNIX seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub ident: i64,
    pub open_person: Option<String>,
    pub open_stamp: i64,
    pub mod_stamp: i64,
    pub kind: IssueKind,
    pub project: Option<String>,
    pub description: Option<String>,
    pub charge_person: Option<String>,
    pub cron_stamp: i64,
    pub has_smaller_sibling: bool,
}

impl Issue {
    pub fn age_days(&self, until: i64) -> i64 {
        (until - self.open_stamp).div_euclid(SECONDS_PER_DAY)
    }

    pub fn dust_days(&self, until: i64) -> i64 {
        (until - self.mod_stamp).div_euclid(SECONDS_PER_DAY)
    }

    pub fn has_existing_package(&self) -> bool {
        self.kind.has_existing_package()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PopconEntry {
    pub package: String,
    pub inst: Option<i64>,
    pub vote: Option<i64>,
    pub old: Option<i64>,
    pub recent: Option<i64>,
    pub nofiles: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindChange {
    pub old_kind: Option<IssueKind>,
    pub new_kind: Option<IssueKind>,
}

/// A row of `debian_log_index`, joined with its `debian_log_mods` row if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub log_id: i64,
    pub ident: Option<i64>,
    pub kind: Option<IssueKind>,
    pub project: Option<String>,
    pub description: Option<String>,
    pub log_stamp: Option<i64>,
    pub event: EventKind,
    pub event_stamp: Option<i64>,
    pub kind_change: Option<KindChange>,
}

/// A log entry that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub ident: i64,
    pub kind: IssueKind,
    pub project: Option<String>,
    pub description: Option<String>,
    pub log_stamp: i64,
    pub event: EventKind,
    pub event_stamp: i64,
}

impl NewLogEntry {
    pub fn from_issue(issue: &Issue, event: EventKind, event_stamp: i64, now: i64) -> Self {
        Self {
            ident: issue.ident,
            kind: issue.kind,
            project: issue.project.clone(),
            description: issue.description.clone(),
            log_stamp: now,
            event,
            event_stamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(kind: IssueKind) -> Issue {
        Issue {
            ident: 1,
            open_person: None,
            open_stamp: 1_000_000,
            mod_stamp: 2_000_000,
            kind,
            project: Some("package1".to_string()),
            description: None,
            charge_person: None,
            cron_stamp: 2_000_000,
            has_smaller_sibling: false,
        }
    }

    #[test]
    fn kinds_round_trip_through_their_codes() {
        for kind in IssueKind::ALL {
            assert_eq!(kind.as_str().parse::<IssueKind>().expect("parse"), kind);
        }
        for event in EventKind::ALL {
            assert_eq!(event.as_str().parse::<EventKind>().expect("parse"), event);
        }
        assert!("XYZ".parse::<IssueKind>().is_err());
    }

    #[test]
    fn existing_package_depends_on_kind() {
        assert!(!issue(IssueKind::Itp).has_existing_package());
        assert!(!issue(IssueKind::Rfp).has_existing_package());
        assert!(issue(IssueKind::O).has_existing_package());
        assert!(issue(IssueKind::Rfa).has_existing_package());
    }

    #[test]
    fn age_and_dust_count_whole_days() {
        let issue = issue(IssueKind::Rfa);
        let until = 2_000_000 + 3 * SECONDS_PER_DAY + 10;
        assert_eq!(issue.dust_days(until), 3);
        assert_eq!(issue.age_days(until), (until - 1_000_000) / SECONDS_PER_DAY);
    }
}
