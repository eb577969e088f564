use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::links::{escape_html, parse_query, wnpp_issue_url};
use crate::models::{EventKind, LogEntry};
use crate::runtime::ResolvedPaths;
use crate::store;

pub const DEFAULT_MAX_ENTRIES: usize = 30;
pub const FEED_TTL_MINUTES: u32 = 15;
pub const FEED_DESCRIPTION: &str = "Debian news feed on packaging bugs";
pub const FEED_STYLESHEET: &str = "/static/rss.xsl";

const GOOD_NEWS_SQL: &str =
    "(l.event = 'CLOSE' OR (l.event IN ('MOD', 'OPEN') AND COALESCE(l.kind, '') IN ('ITA', 'ITP')))";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsDataSet {
    All,
    BadNews,
    GoodNews,
    HelpExisting,
    NewPackages,
}

impl NewsDataSet {
    pub const ALL: [NewsDataSet; 5] = [
        Self::All,
        Self::BadNews,
        Self::GoodNews,
        Self::HelpExisting,
        Self::NewPackages,
    ];

    /// Unknown names fall back to [`NewsDataSet::All`].
    pub fn from_query_value(value: Option<&str>) -> Self {
        match value {
            Some("bad_news") => Self::BadNews,
            Some("good_news") => Self::GoodNews,
            Some("help_existing") => Self::HelpExisting,
            Some("new_packages") => Self::NewPackages,
            _ => Self::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::BadNews => "bad_news",
            Self::GoodNews => "good_news",
            Self::HelpExisting => "help_existing",
            Self::NewPackages => "new_packages",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::All => "Debian Packaging News",
            Self::BadNews => "Bad News on Debian Packages",
            Self::GoodNews => "Good News on Debian Packages",
            Self::HelpExisting => "Existing Debian Packages In Need For Help",
            Self::NewPackages => "New Debian Packages",
        }
    }

    fn condition(self) -> String {
        match self {
            Self::All => "1".to_string(),
            Self::BadNews => format!("NOT {GOOD_NEWS_SQL}"),
            Self::GoodNews => GOOD_NEWS_SQL.to_string(),
            Self::HelpExisting => {
                "l.event IN ('MOD', 'OPEN') AND l.kind IN ('O', 'RFA', 'RFH')".to_string()
            }
            Self::NewPackages => "l.event = 'CLOSE' AND l.kind = 'ITP'".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleFormat {
    Verbose,
    Compact,
}

impl TitleFormat {
    /// `1` selects the compact format, anything else the verbose one.
    pub fn from_query_value(value: Option<&str>) -> Self {
        match value {
            Some("1") => Self::Compact,
            _ => Self::Verbose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedQuery {
    pub data_set: NewsDataSet,
    pub title_format: TitleFormat,
}

impl FeedQuery {
    pub fn from_raw_query(raw_query: Option<&str>) -> Result<Self> {
        let pairs = parse_query(raw_query.unwrap_or(""))?;
        let last = |key: &str| {
            pairs
                .iter()
                .rev()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };
        Ok(Self {
            data_set: NewsDataSet::from_query_value(last("data")),
            title_format: TitleFormat::from_query_value(last("title_format")),
        })
    }
}

pub fn news_entries(
    connection: &Connection,
    data_set: NewsDataSet,
    max_entries: usize,
) -> Result<Vec<LogEntry>> {
    store::recent_log_entries(connection, &data_set.condition(), max_entries)
        .with_context(|| format!("failed to load {} news", data_set.as_str()))
}

pub fn item_title(entry: &LogEntry, format: TitleFormat) -> String {
    let kind_display = match (&entry.kind_change, entry.event) {
        (Some(change), EventKind::Modified) => format!(
            "{} -> {}",
            display_or_none(change.old_kind.map(|kind| kind.as_str())),
            display_or_none(change.new_kind.map(|kind| kind.as_str()))
        ),
        _ => display_or_none(entry.kind.map(|kind| kind.as_str())).to_string(),
    };
    let project = display_or_none(entry.project.as_deref());
    let description = display_or_none(entry.description.as_deref());

    match format {
        TitleFormat::Verbose => format!(
            "{} [{kind_display}] {project} -- {description}",
            entry.event.display_name()
        ),
        TitleFormat::Compact if entry.event == EventKind::Closed => {
            format!("CLOSED : {project} -- {description}")
        }
        TitleFormat::Compact => format!(
            "#{} {kind_display}: {project} -- {description}",
            display_or_none(entry.ident.map(|ident| ident.to_string()).as_deref())
        ),
    }
}

fn display_or_none(value: Option<&str>) -> &str {
    value.unwrap_or("None")
}

fn rfc2822(stamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(stamp, 0).map(|moment| moment.to_rfc2822())
}

/// Renders an RSS 2.0 document; `feed_url` is the absolute URL the feed was requested at.
pub fn render_feed(entries: &[LogEntry], query: FeedQuery, feed_url: &str, now: i64) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str(&format!(
        "<?xml-stylesheet type=\"text/xsl\" href=\"{FEED_STYLESHEET}\"?>\n"
    ));
    xml.push_str("<rss version=\"2.0\" xmlns:atom=\"http://www.w3.org/2005/Atom\">\n<channel>\n");
    xml.push_str(&format!(
        "<title>{}</title>\n<link>{}</link>\n<description>{}</description>\n",
        escape_html(query.data_set.title()),
        escape_html(feed_url),
        escape_html(FEED_DESCRIPTION)
    ));
    xml.push_str(&format!(
        "<atom:link href=\"{}\" rel=\"self\"/>\n<language>en-us</language>\n",
        escape_html(feed_url)
    ));
    let last_build = entries
        .iter()
        .filter_map(|entry| entry.event_stamp)
        .max()
        .unwrap_or(now);
    if let Some(last_build) = rfc2822(last_build) {
        xml.push_str(&format!("<lastBuildDate>{last_build}</lastBuildDate>\n"));
    }
    xml.push_str(&format!("<ttl>{FEED_TTL_MINUTES}</ttl>\n"));

    for entry in entries {
        let ident = entry.ident.map(|ident| ident.to_string()).unwrap_or_default();
        let issue_url = entry.ident.map(wnpp_issue_url).unwrap_or_default();
        xml.push_str("<item>\n");
        xml.push_str(&format!(
            "<title>{}</title>\n<link>{}</link>\n<description>{}</description>\n",
            escape_html(&item_title(entry, query.title_format)),
            escape_html(&issue_url),
            escape_html(&issue_url)
        ));
        xml.push_str(&format!(
            "<author>{ident}@bugs.debian.org (Debian WNPP issue {ident})</author>\n"
        ));
        if let Some(pub_date) = entry.event_stamp.and_then(rfc2822) {
            xml.push_str(&format!("<pubDate>{pub_date}</pubDate>\n"));
        }
        xml.push_str(&format!(
            "<guid>http://wnpp.debian.net/{ident}/{}</guid>\n",
            entry.event_stamp.unwrap_or_default()
        ));
        xml.push_str("</item>\n");
    }

    xml.push_str("</channel>\n</rss>\n");
    xml
}

/// Deletes log entries that no feed data set would show when serving `spare`
/// entries each, limited to entries older than `started_at`.
pub fn truncate_changelog_with_connection(
    connection: &mut Connection,
    spare: usize,
    started_at: i64,
) -> Result<usize> {
    let transaction = connection
        .transaction()
        .context("failed to start changelog truncation")?;
    let mut keep = BTreeSet::new();
    for data_set in NewsDataSet::ALL {
        for entry in news_entries(&transaction, data_set, spare)? {
            keep.insert(entry.log_id);
        }
    }
    let deleted = store::delete_log_entries_except(&transaction, &keep, started_at)?;
    transaction
        .commit()
        .context("failed to commit changelog truncation")?;

    if deleted > 0 {
        info!("Deleted {deleted} log entries");
    } else {
        info!("No log entries to delete");
    }
    Ok(deleted)
}

pub fn truncate_changelog(paths: &ResolvedPaths, spare: usize) -> Result<usize> {
    let started_at = store::unix_timestamp()?;
    let mut connection = store::open_database(paths)?;
    truncate_changelog_with_connection(&mut connection, spare, started_at)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::models::{IssueKind, KindChange, NewLogEntry};
    use crate::store::test_support::migrated_database;

    /// One log entry per kind and event, newest last.
    fn seed_every_combination(connection: &Connection) -> Vec<(IssueKind, EventKind, i64)> {
        let mut seeded = Vec::new();
        let mut stamp = 1_600_000_000;
        for kind in IssueKind::ALL {
            for event in EventKind::ALL {
                stamp += 60;
                let ident = stamp - 1_600_000_000;
                let entry = NewLogEntry {
                    ident,
                    kind,
                    project: Some(format!("package{ident}")),
                    description: Some(format!("description{ident}")),
                    log_stamp: stamp,
                    event,
                    event_stamp: stamp,
                };
                let log_id = store::insert_log_entry(connection, &entry).expect("insert log");
                seeded.push((kind, event, log_id));
            }
        }
        seeded
    }

    fn kinds_and_events(entries: &[LogEntry]) -> Vec<(Option<IssueKind>, EventKind)> {
        entries.iter().map(|entry| (entry.kind, entry.event)).collect()
    }

    #[test]
    fn unknown_data_sets_fall_back_to_all() {
        assert_eq!(NewsDataSet::from_query_value(None), NewsDataSet::All);
        assert_eq!(
            NewsDataSet::from_query_value(Some("something invalid")),
            NewsDataSet::All
        );
        let query = FeedQuery::from_raw_query(Some("data=good_news&title_format=1")).expect("query");
        assert_eq!(query.data_set, NewsDataSet::GoodNews);
        assert_eq!(query.title_format, TitleFormat::Compact);
    }

    #[test]
    fn all_returns_the_newest_entries_first() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());
        let seeded = seed_every_combination(&connection);

        let entries = news_entries(&connection, NewsDataSet::All, DEFAULT_MAX_ENTRIES).expect("news");
        assert_eq!(entries.len(), seeded.len());
        let mut expected: Vec<i64> = seeded.iter().map(|(_, _, log_id)| *log_id).collect();
        expected.reverse();
        let actual: Vec<i64> = entries.iter().map(|entry| entry.log_id).collect();
        assert_eq!(actual, expected);

        let limited = news_entries(&connection, NewsDataSet::All, 5).expect("news");
        assert_eq!(limited.len(), 5);
        assert_eq!(limited[0].log_id, expected[0]);
    }

    #[test]
    fn good_and_bad_news_partition_the_log() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());
        seed_every_combination(&connection);

        let good = news_entries(&connection, NewsDataSet::GoodNews, 100).expect("good");
        let bad = news_entries(&connection, NewsDataSet::BadNews, 100).expect("bad");
        assert_eq!(good.len(), 10);
        assert_eq!(bad.len(), 8);
        for (kind, event) in kinds_and_events(&good) {
            let kind = kind.expect("kind");
            assert!(
                event == EventKind::Closed || matches!(kind, IssueKind::Ita | IssueKind::Itp)
            );
        }
        for (kind, event) in kinds_and_events(&bad) {
            let kind = kind.expect("kind");
            assert_ne!(event, EventKind::Closed);
            assert!(matches!(
                kind,
                IssueKind::O | IssueKind::Rfa | IssueKind::Rfh | IssueKind::Rfp
            ));
        }
    }

    #[test]
    fn help_existing_and_new_packages() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());
        seed_every_combination(&connection);

        let help = news_entries(&connection, NewsDataSet::HelpExisting, 100).expect("help");
        assert_eq!(help.len(), 6);
        for (kind, event) in kinds_and_events(&help) {
            assert_ne!(event, EventKind::Closed);
            assert!(matches!(
                kind,
                Some(IssueKind::O | IssueKind::Rfa | IssueKind::Rfh)
            ));
        }

        let new_packages = news_entries(&connection, NewsDataSet::NewPackages, 100).expect("new");
        assert_eq!(
            kinds_and_events(&new_packages),
            vec![(Some(IssueKind::Itp), EventKind::Closed)]
        );
    }

    fn log_entry(event: EventKind, kind_change: Option<KindChange>) -> LogEntry {
        LogEntry {
            log_id: 1,
            ident: Some(123),
            kind: Some(IssueKind::Rfa),
            project: Some("dpkg".to_string()),
            description: Some("package maintenance system".to_string()),
            log_stamp: Some(1_600_000_000),
            event,
            event_stamp: Some(1_600_000_000),
            kind_change,
        }
    }

    #[test]
    fn item_titles_follow_the_requested_format() {
        let change = KindChange {
            old_kind: Some(IssueKind::Rfa),
            new_kind: Some(IssueKind::Ita),
        };
        let modified = log_entry(EventKind::Modified, Some(change));
        assert_eq!(
            item_title(&modified, TitleFormat::Verbose),
            "Modified [RFA -> ITA] dpkg -- package maintenance system"
        );
        assert_eq!(
            item_title(&modified, TitleFormat::Compact),
            "#123 RFA -> ITA: dpkg -- package maintenance system"
        );

        let closed = log_entry(EventKind::Closed, None);
        assert_eq!(
            item_title(&closed, TitleFormat::Verbose),
            "Closed [RFA] dpkg -- package maintenance system"
        );
        assert_eq!(
            item_title(&closed, TitleFormat::Compact),
            "CLOSED : dpkg -- package maintenance system"
        );
    }

    #[test]
    fn feed_is_wellformed_and_carries_a_stylesheet() {
        let mut entry = log_entry(EventKind::Opened, None);
        entry.description = Some("<b>tom & jerry</b>".to_string());
        let query = FeedQuery {
            data_set: NewsDataSet::NewPackages,
            title_format: TitleFormat::Verbose,
        };
        let xml = render_feed(
            &[entry],
            query,
            "https://wnpp.example.org/news.php5?data=new_packages&title_format=0",
            1_700_000_000,
        );

        assert!(xml.contains("<?xml-stylesheet"));
        let document = roxmltree::Document::parse(&xml).expect("well-formed feed");
        let channel = document
            .descendants()
            .find(|node| node.has_tag_name("channel"))
            .expect("channel");
        let child_text = |parent: roxmltree::Node<'_, '_>, name: &str| {
            parent
                .children()
                .find(|node| node.has_tag_name(name))
                .and_then(|node| node.text())
                .map(str::to_string)
        };
        assert_eq!(child_text(channel, "title").as_deref(), Some("New Debian Packages"));
        assert_eq!(child_text(channel, "ttl").as_deref(), Some("15"));

        let item = channel
            .children()
            .find(|node| node.has_tag_name("item"))
            .expect("item");
        assert_eq!(
            child_text(item, "title").as_deref(),
            Some("Opened [RFA] dpkg -- <b>tom & jerry</b>")
        );
        assert_eq!(
            child_text(item, "link").as_deref(),
            Some("https://bugs.debian.org/cgi-bin/bugreport.cgi?bug=123")
        );
        assert_eq!(
            child_text(item, "guid").as_deref(),
            Some("http://wnpp.debian.net/123/1600000000")
        );
        assert_eq!(
            child_text(item, "author").as_deref(),
            Some("123@bugs.debian.org (Debian WNPP issue 123)")
        );
        assert_eq!(
            child_text(item, "pubDate").as_deref(),
            Some("Sun, 13 Sep 2020 12:26:40 +0000")
        );
    }

    #[test]
    fn truncation_keeps_entries_any_feed_still_shows() {
        let temp = tempdir().expect("tempdir");
        let (_paths, mut connection) = migrated_database(temp.path());
        let seeded = seed_every_combination(&connection);
        let started_at = 1_700_000_000;

        let deleted = truncate_changelog_with_connection(&mut connection, 1, started_at).expect("truncate");

        let remaining = news_entries(&connection, NewsDataSet::All, 100).expect("remaining");
        assert_eq!(deleted + remaining.len(), seeded.len());
        // Newest of each data set: RFP/CLOSE (all, good news), RFP/OPEN (bad news),
        // RFH/OPEN (help existing) and ITP/CLOSE (new packages).
        assert_eq!(
            kinds_and_events(&remaining),
            vec![
                (Some(IssueKind::Rfp), EventKind::Closed),
                (Some(IssueKind::Rfp), EventKind::Opened),
                (Some(IssueKind::Rfh), EventKind::Opened),
                (Some(IssueKind::Itp), EventKind::Closed),
            ]
        );

        let again = truncate_changelog_with_connection(&mut connection, 1, started_at).expect("again");
        assert_eq!(again, 0);
    }

    #[test]
    fn truncation_spares_entries_newer_than_the_start() {
        let temp = tempdir().expect("tempdir");
        let (_paths, mut connection) = migrated_database(temp.path());
        let seeded = seed_every_combination(&connection);

        let deleted =
            truncate_changelog_with_connection(&mut connection, 0, 1_000_000_000).expect("truncate");
        assert_eq!(deleted, 0);
        let remaining = news_entries(&connection, NewsDataSet::All, 100).expect("remaining");
        assert_eq!(remaining.len(), seeded.len());
    }
}
