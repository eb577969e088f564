use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::config::DashboardConfig;
use crate::debbugs::{DebbugsApi, DebbugsClientConfig, IssueProperties, IssueProperty, SoapDebbugsClient};
use crate::models::{EventKind, Issue, IssueKind, KindChange, NewLogEntry};
use crate::runtime::ResolvedPaths;
use crate::store;

pub const MAX_DESCRIPTION_LENGTH: usize = 255;

const SUBJECT_PATTERN: &str = r"^(?:[Ss]ubject: )?(?P<kind>[A-Z]{1,3}): ?(?P<package>[^ ]+)(?:(?: --| -| —|:) (?P<description>.*))?$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportDebbugsOptions {
    pub batch_size: usize,
    pub stale_seconds: i64,
}

impl Default for ImportDebbugsOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            stale_seconds: 2 * 60 * 60,
        }
    }
}

impl ImportDebbugsOptions {
    pub fn from_config(config: &DashboardConfig) -> Self {
        Self {
            batch_size: config.debbugs_batch_size(),
            stale_seconds: i64::try_from(config.debbugs_stale_hours().saturating_mul(3600))
                .unwrap_or(i64::MAX),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportDebbugsReport {
    pub remote_open: usize,
    pub closed: usize,
    pub created: usize,
    pub updated: usize,
    pub refreshed: usize,
    pub kind_changes: usize,
    pub malformed: usize,
    pub request_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSubject {
    pub kind: IssueKind,
    pub package: String,
    pub description: Option<String>,
}

/// Splits WNPP subjects such as `ITP: foo -- a tool for bar`.
pub struct SubjectParser {
    pattern: Regex,
}

impl SubjectParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(SUBJECT_PATTERN).context("failed to compile subject pattern")?;
        Ok(Self { pattern })
    }

    pub fn parse(&self, subject: &str) -> Result<ParsedSubject> {
        // Subjects may carry one trailing newline.
        let subject = subject.strip_suffix('\n').unwrap_or(subject);
        let captures = self
            .pattern
            .captures(subject)
            .ok_or_else(|| anyhow!("Malformed subject {subject:?}"))?;
        let kind_code = &captures["kind"];
        let kind = kind_code
            .parse::<IssueKind>()
            .map_err(|_| anyhow!("Malformed subject {subject:?}: unknown kind {kind_code:?}"))?;
        Ok(ParsedSubject {
            kind,
            package: captures["package"].to_string(),
            description: captures
                .name("description")
                .map(|description| description.as_str().to_string()),
        })
    }
}

pub fn import_debbugs(paths: &ResolvedPaths, config: &DashboardConfig) -> Result<ImportDebbugsReport> {
    let mut client = SoapDebbugsClient::new(DebbugsClientConfig::from_config(config))?;
    let mut connection = store::open_database(paths)?;
    let now = store::unix_timestamp()?;
    import_debbugs_with_api(
        &mut connection,
        &mut client,
        &ImportDebbugsOptions::from_config(config),
        now,
    )
}

pub fn import_debbugs_with_api<A: DebbugsApi>(
    connection: &mut Connection,
    api: &mut A,
    options: &ImportDebbugsOptions,
    now: i64,
) -> Result<ImportDebbugsReport> {
    if options.batch_size == 0 {
        bail!("batch size must be at least 1");
    }
    let parser = SubjectParser::new()?;
    let remote_open: BTreeSet<i64> = api
        .fetch_ids_of_open_issues()
        .context("failed to fetch ids of open WNPP issues")?
        .into_iter()
        .collect();

    let mut report = ImportDebbugsReport {
        remote_open: remote_open.len(),
        ..ImportDebbugsReport::default()
    };

    report.closed = close_all_issues_but(connection, &remote_open, now)?;
    add_new_issues(connection, api, &parser, &remote_open, options, now, &mut report)?;
    update_stale_issues(connection, api, &parser, &remote_open, options, now, &mut report)?;

    report.request_count = api.request_count();
    info!("Successfully synced with Debbugs.");
    Ok(report)
}

fn close_all_issues_but(
    connection: &mut Connection,
    remote_open: &BTreeSet<i64>,
    now: i64,
) -> Result<usize> {
    info!("[1/3] Closing issues locally that have been closed remotely...");
    let local_ids = store::all_issue_ids(connection)?;
    let closed_ids: Vec<i64> = local_ids.difference(remote_open).copied().collect();
    if closed_ids.is_empty() {
        info!("No existing issues deleted.");
        return Ok(0);
    }

    let transaction = connection
        .transaction()
        .context("failed to start close transaction")?;
    let mut closed = 0usize;
    for ident in &closed_ids {
        let Some(issue) = store::load_issue(&transaction, *ident)? else {
            continue;
        };
        info!("Detected that issue #{ident} has been closed, remotely");
        store::insert_log_entry(
            &transaction,
            &NewLogEntry::from_issue(&issue, EventKind::Closed, now, now),
        )?;
        closed += store::delete_issue(&transaction, *ident)?;
    }
    transaction
        .commit()
        .context("failed to commit close transaction")?;
    info!("Logged closing of {closed} issue(s)");
    info!("Deleted {closed} issue(s)");
    Ok(closed)
}

fn add_new_issues<A: DebbugsApi>(
    connection: &mut Connection,
    api: &mut A,
    parser: &SubjectParser,
    remote_open: &BTreeSet<i64>,
    options: &ImportDebbugsOptions,
    now: i64,
    report: &mut ImportDebbugsReport,
) -> Result<()> {
    let local_ids = store::all_issue_ids(connection)?;
    let new_ids: Vec<i64> = remote_open.difference(&local_ids).copied().collect();
    let mut left_to_import = new_ids.len();
    info!(
        "[2/3] Starting to import {left_to_import} (={}-{}) new remote issue(s) locally...",
        remote_open.len(),
        local_ids.len()
    );

    for batch in new_ids.chunks(options.batch_size) {
        info!(
            "Importing next {} issue(s) of {left_to_import} left to import...",
            batch.len()
        );
        left_to_import -= batch.len();

        let remote = fetch_batch(api, batch)?;
        let mut issues = Vec::with_capacity(batch.len());
        for ident in batch {
            let Some(properties) = remote.get(ident) else {
                warn!("Issue {ident} is missing from the Debbugs response, skipped");
                continue;
            };
            info!("Processing upcoming issue {ident}...");
            match issue_from_properties(parser, *ident, properties, now) {
                Ok(issue) => issues.push(issue),
                Err(problem) => {
                    error!("{problem:#}");
                    report.malformed += 1;
                }
            }
        }

        if issues.is_empty() {
            info!("No new issues created.");
            continue;
        }

        let transaction = connection
            .transaction()
            .context("failed to start import transaction")?;
        for issue in &issues {
            store::insert_log_entry(
                &transaction,
                &NewLogEntry::from_issue(issue, EventKind::Opened, issue.open_stamp, now),
            )?;
        }
        info!("Logged upcoming creation of {} issue(s)", issues.len());
        for issue in &issues {
            store::insert_issue(&transaction, issue)?;
        }
        transaction
            .commit()
            .context("failed to commit import transaction")?;
        info!("Created {} new issues", issues.len());
        report.created += issues.len();
    }
    Ok(())
}

fn update_stale_issues<A: DebbugsApi>(
    connection: &mut Connection,
    api: &mut A,
    parser: &SubjectParser,
    remote_open: &BTreeSet<i64>,
    options: &ImportDebbugsOptions,
    now: i64,
    report: &mut ImportDebbugsReport,
) -> Result<()> {
    let stale_ids: Vec<i64> = store::stale_issue_ids(connection, now - options.stale_seconds)?
        .into_iter()
        .filter(|ident| remote_open.contains(ident))
        .collect();
    let mut left_to_update = stale_ids.len();
    info!("[3/3] Starting to apply remote changes to {left_to_update} stale local issue(s)...");
    if stale_ids.is_empty() {
        info!("No stale issues found, none updated.");
        return Ok(());
    }

    for batch in stale_ids.chunks(options.batch_size) {
        info!(
            "Updating next {} stale issue(s) of {left_to_update} left to update...",
            batch.len()
        );
        left_to_update -= batch.len();

        let local = store::load_issues(connection, batch)?;
        let remote = fetch_batch(api, batch)?;

        let mut refreshed = Vec::with_capacity(local.len());
        let mut modified = Vec::new();
        for issue in local {
            info!("Processing existing issue {}...", issue.ident);
            let Some(properties) = remote.get(&issue.ident) else {
                warn!(
                    "Issue {} is missing from the Debbugs response, skipped",
                    issue.ident
                );
                continue;
            };
            let future = match issue_from_properties(parser, issue.ident, properties, now) {
                Ok(future) => future,
                Err(problem) => {
                    error!("{problem:#}");
                    report.malformed += 1;
                    continue;
                }
            };

            let changes = diff_issues(&issue, &future);
            for change in &changes {
                info!("--- {}.{} = {}", issue.ident, change.field, change.old);
                info!("+++ {}.{} = {}", issue.ident, change.field, change.new);
            }
            if !changes.is_empty() {
                let kind_change = (issue.kind != future.kind).then(|| KindChange {
                    old_kind: Some(issue.kind),
                    new_kind: Some(future.kind),
                });
                modified.push((future.clone(), kind_change));
            }
            refreshed.push(future);
        }

        let transaction = connection
            .transaction()
            .context("failed to start update transaction")?;
        let mut kind_changes = 0usize;
        for (issue, kind_change) in &modified {
            let log_id = store::insert_log_entry(
                &transaction,
                &NewLogEntry::from_issue(issue, EventKind::Modified, issue.mod_stamp, now),
            )?;
            if let Some(kind_change) = kind_change {
                store::insert_kind_change(&transaction, log_id, kind_change)?;
                kind_changes += 1;
            }
        }
        info!("Logged upcoming updates to {} issue(s)", modified.len());
        if kind_changes > 0 {
            info!("Logged upcoming changes in kind of {kind_changes} issue(s)");
        } else {
            info!("No changes in kind recognized.");
        }
        for issue in &refreshed {
            store::update_issue(&transaction, issue)?;
        }
        transaction
            .commit()
            .context("failed to commit update transaction")?;
        info!("Updated {} existing issues", refreshed.len());

        report.updated += modified.len();
        report.refreshed += refreshed.len();
        report.kind_changes += kind_changes;
    }
    Ok(())
}

fn fetch_batch<A: DebbugsApi>(
    api: &mut A,
    issue_ids: &[i64],
) -> Result<std::collections::BTreeMap<i64, IssueProperties>> {
    let flat_ids = issue_ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    info!("Fetching {} issue(s): {flat_ids}...", issue_ids.len());
    api.fetch_issues(issue_ids)
        .with_context(|| format!("failed to fetch issues {flat_ids}"))
}

/// Builds the local row for `ident` from its Debbugs properties.
pub fn issue_from_properties(
    parser: &SubjectParser,
    ident: i64,
    properties: &IssueProperties,
    now: i64,
) -> Result<Issue> {
    let property = |name: IssueProperty| properties.get(name.as_str()).map(String::as_str);

    let subject = property(IssueProperty::Subject).unwrap_or("");
    let parsed = parser.parse(subject)?;
    let open_stamp = parse_epoch_seconds(property(IssueProperty::Date))
        .with_context(|| format!("issue {ident} has no usable {:?}", IssueProperty::Date.as_str()))?;
    let mod_stamp = parse_epoch_seconds(property(IssueProperty::LastModified)).with_context(|| {
        format!(
            "issue {ident} has no usable {:?}",
            IssueProperty::LastModified.as_str()
        )
    })?;

    Ok(Issue {
        ident,
        open_person: property(IssueProperty::Originator).map(str::to_string),
        open_stamp,
        mod_stamp,
        kind: parsed.kind,
        project: Some(parsed.package),
        description: parsed
            .description
            .map(|description| truncate_chars(&description, MAX_DESCRIPTION_LENGTH)),
        charge_person: property(IssueProperty::Owner).map(str::to_string),
        cron_stamp: now,
        has_smaller_sibling: has_smaller_sibling(ident, property(IssueProperty::MergedWith)),
    })
}

/// Epoch seconds as sent by Debbugs, either integral or decimal.
pub fn parse_epoch_seconds(value: Option<&str>) -> Result<i64> {
    let value = value.map(str::trim).unwrap_or("");
    if value.is_empty() {
        bail!("missing timestamp");
    }
    if let Ok(seconds) = value.parse::<i64>() {
        return Ok(seconds);
    }
    let seconds = value
        .parse::<f64>()
        .with_context(|| format!("invalid timestamp {value:?}"))?;
    if !seconds.is_finite() {
        bail!("invalid timestamp {value:?}");
    }
    Ok(seconds.trunc() as i64)
}

/// Cuts `text` to at most `max_length` characters, marking the cut with `…`.
pub fn truncate_chars(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let mut output: String = text.chars().take(max_length.saturating_sub(1)).collect();
    output.push('…');
    output
}

fn has_smaller_sibling(ident: i64, merged_with: Option<&str>) -> bool {
    merged_with
        .unwrap_or("")
        .split(|character: char| character.is_whitespace() || character == ',')
        .filter_map(|token| token.parse::<i64>().ok())
        .any(|sibling| sibling < ident)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldChange {
    field: &'static str,
    old: String,
    new: String,
}

fn quote(value: Option<&str>) -> String {
    match value {
        Some(text) => format!("{text:?}"),
        None => "None".to_string(),
    }
}

/// Changed fields in name order; `cron_stamp` never counts as a change.
fn diff_issues(current: &Issue, future: &Issue) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let mut compare = |field: &'static str, old: String, new: String| {
        if old != new {
            changes.push(FieldChange { field, old, new });
        }
    };
    compare(
        "charge_person",
        quote(current.charge_person.as_deref()),
        quote(future.charge_person.as_deref()),
    );
    compare(
        "description",
        quote(current.description.as_deref()),
        quote(future.description.as_deref()),
    );
    compare(
        "has_smaller_sibling",
        current.has_smaller_sibling.to_string(),
        future.has_smaller_sibling.to_string(),
    );
    compare(
        "kind",
        quote(Some(current.kind.as_str())),
        quote(Some(future.kind.as_str())),
    );
    compare(
        "mod_stamp",
        current.mod_stamp.to_string(),
        future.mod_stamp.to_string(),
    );
    compare(
        "open_person",
        quote(current.open_person.as_deref()),
        quote(future.open_person.as_deref()),
    );
    compare(
        "open_stamp",
        current.open_stamp.to_string(),
        future.open_stamp.to_string(),
    );
    compare(
        "project",
        quote(current.project.as_deref()),
        quote(future.project.as_deref()),
    );
    changes
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::debbugs::test_support::MockDebbugs;
    use crate::store::test_support::{migrated_database, sample_issue};

    const NOW: i64 = 1_700_000_000;

    fn count(connection: &Connection, sql: &str) -> i64 {
        connection
            .query_row(sql, [], |row| row.get(0))
            .expect("count query")
    }

    #[test]
    fn subjects_are_split_into_kind_package_and_description() {
        let parser = SubjectParser::new().expect("parser");
        let cases = [
            ("ITP: foo -- bar", IssueKind::Itp, "foo", Some("bar")),
            ("Subject: RFP: foo -- bar", IssueKind::Rfp, "foo", Some("bar")),
            ("subject: O: foo - bar", IssueKind::O, "foo", Some("bar")),
            ("RFA:foo: bar baz", IssueKind::Rfa, "foo", Some("bar baz")),
            ("RFH: foo \u{2014} bar", IssueKind::Rfh, "foo", Some("bar")),
            ("ITA: foo", IssueKind::Ita, "foo", None),
        ];
        for (subject, kind, package, description) in cases {
            let parsed = parser.parse(subject).expect(subject);
            assert_eq!(parsed.kind, kind, "{subject}");
            assert_eq!(parsed.package, package, "{subject}");
            assert_eq!(parsed.description.as_deref(), description, "{subject}");
        }
    }

    #[test]
    fn malformed_subjects_are_rejected() {
        let parser = SubjectParser::new().expect("parser");
        for subject in ["", "foo -- bar", "ITP foo -- bar", "XYZ: foo -- bar", "itp: foo"] {
            let error = parser.parse(subject).expect_err(subject);
            assert!(error.to_string().starts_with("Malformed subject"), "{subject}");
        }
    }

    #[test]
    fn one_trailing_newline_is_ignored() {
        let parser = SubjectParser::new().expect("parser");
        let parsed = parser.parse("ITP: foo -- bar\n").expect("parse");
        assert_eq!(parsed.kind, IssueKind::Itp);
        assert_eq!(parsed.package, "foo");
        assert_eq!(parsed.description.as_deref(), Some("bar"));
        assert!(parser.parse("ITP: foo -- bar\n\n").is_err());
    }

    #[test]
    fn descriptions_are_truncated_with_an_ellipsis() {
        let long = "x".repeat(300);
        let truncated = truncate_chars(&long, MAX_DESCRIPTION_LENGTH);
        assert_eq!(truncated.chars().count(), MAX_DESCRIPTION_LENGTH);
        assert!(truncated.ends_with('…'));
        assert_eq!(truncate_chars("short", MAX_DESCRIPTION_LENGTH), "short");
        assert_eq!(truncate_chars(&"ä".repeat(255), 255), "ä".repeat(255));
    }

    #[test]
    fn epoch_seconds_accept_integers_and_decimals() {
        assert_eq!(parse_epoch_seconds(Some("1600000000")).expect("int"), 1_600_000_000);
        assert_eq!(parse_epoch_seconds(Some("1600000000.75")).expect("float"), 1_600_000_000);
        assert!(parse_epoch_seconds(None).is_err());
        assert!(parse_epoch_seconds(Some("yesterday")).is_err());
    }

    #[test]
    fn merged_issues_with_smaller_ids_mark_a_sibling() {
        assert!(has_smaller_sibling(500, Some("400 600")));
        assert!(!has_smaller_sibling(500, Some("600 700")));
        assert!(!has_smaller_sibling(500, None));
    }

    #[test]
    fn import_closes_adds_and_updates() {
        let temp = tempdir().expect("tempdir");
        let (_paths, mut connection) = migrated_database(temp.path());

        // 1 is closed remotely, 2 is stale and changed, 3 is fresh and left alone.
        store::insert_issue(&connection, &sample_issue(1, IssueKind::O)).expect("insert 1");
        let mut stale = sample_issue(2, IssueKind::O);
        stale.cron_stamp = NOW - 3 * 3600;
        store::insert_issue(&connection, &stale).expect("insert 2");
        let mut fresh = sample_issue(3, IssueKind::Rfp);
        fresh.cron_stamp = NOW - 60;
        store::insert_issue(&connection, &fresh).expect("insert 3");

        let mut api = MockDebbugs::default()
            .with_issue(
                2,
                &[
                    ("subject", "ITA: package2 -- new description"),
                    ("date", "1600000000"),
                    ("last_modified", "1650000000"),
                    ("owner", "Adopter <adopter@example.org>"),
                    ("originator", "reporter2@example.org"),
                ],
            )
            .with_issue(3, &[("subject", "RFP: package3 -- description3")])
            .with_issue(
                10,
                &[
                    ("subject", "RFP: newthing -- brand new"),
                    ("date", "1690000000"),
                    ("last_modified", "1690000100"),
                ],
            )
            .with_issue(11, &[("subject", "nonsense"), ("date", "1"), ("last_modified", "1")]);

        let report = import_debbugs_with_api(
            &mut connection,
            &mut api,
            &ImportDebbugsOptions::default(),
            NOW,
        )
        .expect("import");

        assert_eq!(report.remote_open, 4);
        assert_eq!(report.closed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.kind_changes, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.request_count, 3);
        assert_eq!(api.fetched_batches, vec![vec![10, 11], vec![2]]);

        assert!(store::load_issue(&connection, 1).expect("load").is_none());
        let created = store::load_issue(&connection, 10).expect("load").expect("created");
        assert_eq!(created.kind, IssueKind::Rfp);
        assert_eq!(created.project.as_deref(), Some("newthing"));
        assert_eq!(created.open_stamp, 1_690_000_000);
        assert_eq!(created.cron_stamp, NOW);

        let updated = store::load_issue(&connection, 2).expect("load").expect("updated");
        assert_eq!(updated.kind, IssueKind::Ita);
        assert_eq!(updated.description.as_deref(), Some("new description"));
        assert_eq!(
            updated.charge_person.as_deref(),
            Some("Adopter <adopter@example.org>")
        );
        assert_eq!(updated.cron_stamp, NOW);

        assert_eq!(
            store::load_issue(&connection, 3).expect("load"),
            Some(fresh)
        );

        let events = store::recent_log_entries(&connection, "1 = 1", 10).expect("log");
        let summary: Vec<(Option<i64>, EventKind, Option<i64>)> = events
            .iter()
            .map(|entry| (entry.ident, entry.event, entry.event_stamp))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Some(1), EventKind::Closed, Some(NOW)),
                (Some(10), EventKind::Opened, Some(1_690_000_000)),
                (Some(2), EventKind::Modified, Some(1_650_000_000)),
            ]
        );
        let modification = &events[2];
        assert_eq!(
            modification.kind_change,
            Some(KindChange {
                old_kind: Some(IssueKind::O),
                new_kind: Some(IssueKind::Ita),
            })
        );
    }

    #[test]
    fn unchanged_stale_issues_only_refresh_cron_stamp() {
        let temp = tempdir().expect("tempdir");
        let (_paths, mut connection) = migrated_database(temp.path());

        let mut issue = sample_issue(5, IssueKind::Rfh);
        issue.cron_stamp = NOW - 10 * 3600;
        store::insert_issue(&connection, &issue).expect("insert");

        let mut api = MockDebbugs::default().with_issue(
            5,
            &[
                ("subject", "RFH: package5 -- description5"),
                ("date", "1600000000"),
                ("last_modified", "1600100000"),
                ("originator", "reporter5@example.org"),
            ],
        );

        let report = import_debbugs_with_api(
            &mut connection,
            &mut api,
            &ImportDebbugsOptions::default(),
            NOW,
        )
        .expect("import");

        assert_eq!(report.updated, 0);
        assert_eq!(report.refreshed, 1);
        assert_eq!(count(&connection, "SELECT COUNT(*) FROM debian_log_index"), 0);
        let refreshed = store::load_issue(&connection, 5).expect("load").expect("issue");
        assert_eq!(refreshed.cron_stamp, NOW);
        assert_eq!(refreshed, Issue { cron_stamp: NOW, ..issue });
    }

    #[test]
    fn new_issues_are_fetched_in_batches() {
        let temp = tempdir().expect("tempdir");
        let (_paths, mut connection) = migrated_database(temp.path());

        let mut api = MockDebbugs::default();
        for ident in 1..=5 {
            let subject = format!("RFP: p{ident} -- d{ident}");
            api = api.with_issue(
                ident,
                &[
                    ("subject", subject.as_str()),
                    ("date", "1600000000"),
                    ("last_modified", "1600000000"),
                ],
            );
        }

        let options = ImportDebbugsOptions {
            batch_size: 2,
            ..ImportDebbugsOptions::default()
        };
        let report =
            import_debbugs_with_api(&mut connection, &mut api, &options, NOW).expect("import");

        assert_eq!(report.created, 5);
        assert_eq!(
            api.fetched_batches,
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
        assert_eq!(count(&connection, "SELECT COUNT(*) FROM debian_wnpp"), 5);
        assert_eq!(
            count(
                &connection,
                "SELECT COUNT(*) FROM debian_log_index WHERE event = 'OPEN'"
            ),
            5
        );
    }
}
