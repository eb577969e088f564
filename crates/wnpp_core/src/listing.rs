use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

use crate::config::ListingSettings;
use crate::links::{SortDirection, combine_sort_param, parse_query, parse_sort_param};
use crate::models::{Issue, IssueKind};
use crate::pagination::PageIndicator;
use crate::store;

pub const DEFAULT_COLUMNS: [Column; 5] = [
    Column::Dust,
    Column::Type,
    Column::Description,
    Column::Installs,
    Column::Owner,
];

pub const DEFAULT_KINDS: [IssueKind; 4] = [IssueKind::O, IssueKind::Rfa, IssueKind::Rfh, IssueKind::Rfp];

pub const DEFAULT_SORT_COLUMN: Column = Column::Installs;
pub const DEFAULT_SORT_DIRECTION: SortDirection = SortDirection::Descending;

const LISTING_COLUMNS: &str = "w.ident, w.open_person, w.open_stamp, w.mod_stamp, w.kind, w.project, w.description, w.charge_person, w.cron_stamp, w.has_smaller_sibling, COALESCE(p.vote, 0), COALESCE(p.inst, 0)";

/// A front page table column, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    Dust,
    Age,
    Type,
    Project,
    Ident,
    Description,
    Users,
    Installs,
    Owner,
    Reporter,
}

impl Column {
    pub const ALL: [Column; 10] = [
        Self::Dust,
        Self::Age,
        Self::Type,
        Self::Project,
        Self::Ident,
        Self::Description,
        Self::Users,
        Self::Installs,
        Self::Owner,
        Self::Reporter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dust => "dust",
            Self::Age => "age",
            Self::Type => "type",
            Self::Project => "project",
            Self::Ident => "ident",
            Self::Description => "description",
            Self::Users => "users",
            Self::Installs => "installs",
            Self::Owner => "owner",
            Self::Reporter => "reporter",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|column| column.as_str() == name)
    }

    pub fn heading(self) -> &'static str {
        match self {
            Self::Dust => "Dust",
            Self::Age => "Age",
            Self::Type => "Type",
            Self::Project => "Project",
            Self::Ident => "Issue",
            Self::Description => "Description",
            Self::Users => "Users",
            Self::Installs => "Installs",
            Self::Owner => "Owner",
            Self::Reporter => "Reporter",
        }
    }

    fn order_expression(self) -> &'static str {
        match self {
            Self::Dust => "w.mod_stamp",
            Self::Age => "w.open_stamp",
            Self::Type => "w.kind",
            Self::Project => "w.project",
            Self::Ident => "w.ident",
            Self::Description => "w.description",
            Self::Users => "COALESCE(p.vote, 0)",
            Self::Installs => "COALESCE(p.inst, 0)",
            Self::Owner => "w.charge_person",
            Self::Reporter => "w.open_person",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    MalformedQuery(String),
    UnknownColumn(String),
    UnknownKind(String),
    SortColumnHidden(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedQuery(detail) => write!(f, "malformed query string: {detail}"),
            Self::UnknownColumn(name) => write!(f, "unknown column {name:?}"),
            Self::UnknownKind(name) => write!(f, "unknown issue type {name:?}"),
            Self::SortColumnHidden(name) => {
                write!(f, "cannot sort by column {name:?} since it is not shown")
            }
        }
    }
}

impl std::error::Error for RequestError {}

/// The validated query string of a front page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontPageQuery {
    pub columns: BTreeSet<Column>,
    pub kinds: BTreeSet<IssueKind>,
    pub with_owner: bool,
    pub without_owner: bool,
    pub description_filter: String,
    pub project_filter: String,
    pub sort_column: Column,
    pub sort_direction: SortDirection,
    pub page: Option<String>,
}

impl Default for FrontPageQuery {
    fn default() -> Self {
        let mut columns: BTreeSet<Column> = DEFAULT_COLUMNS.into_iter().collect();
        columns.insert(DEFAULT_SORT_COLUMN);
        Self {
            columns,
            kinds: DEFAULT_KINDS.into_iter().collect(),
            with_owner: true,
            without_owner: true,
            description_filter: String::new(),
            project_filter: String::new(),
            sort_column: DEFAULT_SORT_COLUMN,
            sort_direction: DEFAULT_SORT_DIRECTION,
            page: None,
        }
    }
}

impl FrontPageQuery {
    pub fn from_raw_query(raw_query: Option<&str>) -> Result<Self, RequestError> {
        let pairs = parse_query(raw_query.unwrap_or(""))
            .map_err(|error| RequestError::MalformedQuery(error.to_string()))?;
        let all = |key: &str| -> Vec<&str> {
            pairs
                .iter()
                .filter(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
                .collect()
        };
        let last = |key: &str| all(key).last().map(|value| value.to_string());

        let column_names = all("col[]");
        let mut columns = BTreeSet::new();
        if column_names.is_empty() {
            columns.extend(DEFAULT_COLUMNS);
        } else {
            for name in column_names {
                let column = Column::from_name(name)
                    .ok_or_else(|| RequestError::UnknownColumn(name.to_string()))?;
                columns.insert(column);
            }
        }

        let kind_names = all("type[]");
        let mut kinds = BTreeSet::new();
        if kind_names.is_empty() {
            kinds.extend(DEFAULT_KINDS);
        } else {
            for name in kind_names {
                let kind = name
                    .parse::<IssueKind>()
                    .map_err(|_| RequestError::UnknownKind(name.to_string()))?;
                kinds.insert(kind);
            }
        }

        let owners = all("owner[]");
        let (with_owner, without_owner) = if owners.is_empty() {
            (true, true)
        } else {
            (owners.contains(&"yes"), owners.contains(&"no"))
        };

        let (sort_column, sort_direction) = match last("sort") {
            None => {
                columns.insert(DEFAULT_SORT_COLUMN);
                (DEFAULT_SORT_COLUMN, DEFAULT_SORT_DIRECTION)
            }
            Some(sort) => {
                let (name, direction) = parse_sort_param(&sort);
                let column = Column::from_name(name)
                    .ok_or_else(|| RequestError::UnknownColumn(name.to_string()))?;
                if column != Column::Project && !columns.contains(&column) {
                    return Err(RequestError::SortColumnHidden(name.to_string()));
                }
                (column, direction)
            }
        };

        Ok(Self {
            columns,
            kinds,
            with_owner,
            without_owner,
            description_filter: last("description").unwrap_or_default(),
            project_filter: last("project").unwrap_or_default(),
            sort_column,
            sort_direction,
            page: last("page"),
        })
    }

    /// The effective `sort` value, as sort links expect it.
    pub fn sort_param(&self) -> String {
        combine_sort_param(self.sort_column.as_str(), self.sort_direction)
    }

    pub fn shows(&self, column: Column) -> bool {
        column == Column::Project || self.columns.contains(&column)
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut conditions = vec!["w.has_smaller_sibling = 0".to_string()];
        let mut values = Vec::new();

        let placeholders = vec!["?"; self.kinds.len()].join(", ");
        if self.kinds.is_empty() {
            conditions.push("0".to_string());
        } else {
            conditions.push(format!("w.kind IN ({placeholders})"));
            values.extend(
                self.kinds
                    .iter()
                    .map(|kind| Value::Text(kind.as_str().to_string())),
            );
        }

        if !self.description_filter.is_empty() {
            conditions.push("w.description LIKE ? ESCAPE '\\'".to_string());
            values.push(Value::Text(like_pattern(&self.description_filter)));
        }
        if !self.project_filter.is_empty() {
            conditions.push("w.project LIKE ? ESCAPE '\\'".to_string());
            values.push(Value::Text(like_pattern(&self.project_filter)));
        }

        let without_owner_sql = "(w.charge_person IS NULL OR w.charge_person = '')";
        if !self.with_owner {
            conditions.push(without_owner_sql.to_string());
        }
        if !self.without_owner {
            conditions.push(format!("NOT {without_owner_sql}"));
        }

        (conditions.join(" AND "), values)
    }
}

/// Case-insensitive substring pattern for `LIKE ... ESCAPE '\'`.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for character in needle.chars() {
        if matches!(character, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(character);
    }
    pattern.push('%');
    pattern
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub issue: Issue,
    pub users: i64,
    pub installs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontPage {
    pub rows: Vec<ListingRow>,
    pub total: usize,
    pub page_number: usize,
    pub page_count: usize,
    /// 1-based index of the first row shown, 0 when there are none.
    pub first_index: usize,
    pub last_index: usize,
    pub page_items: Vec<PageIndicator>,
}

impl FrontPage {
    pub fn has_previous(&self) -> bool {
        self.page_number > 1
    }

    pub fn has_next(&self) -> bool {
        self.page_number < self.page_count
    }
}

/// Resolves the requested page like a forgiving paginator: anything that is not
/// a number means page 1, numbers out of range mean the last page.
pub fn resolve_page_number(requested: Option<&str>, page_count: usize) -> usize {
    let page_count = page_count.max(1);
    match requested.map(str::trim) {
        None => 1,
        Some("last") => page_count,
        Some(value) => match value.parse::<i64>() {
            Err(_) => 1,
            Ok(number) if number >= 1 && (number as u64) <= page_count as u64 => number as usize,
            Ok(_) => page_count,
        },
    }
}

pub fn count_issues(connection: &Connection, query: &FrontPageQuery) -> Result<usize> {
    let (where_sql, values) = query.where_clause();
    let sql = format!(
        "SELECT COUNT(*) FROM debian_wnpp w
         LEFT JOIN debian_popcon p ON p.package = w.project
         WHERE {where_sql}"
    );
    let count: i64 = connection
        .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
        .context("failed to count front page issues")?;
    usize::try_from(count).context("negative issue count")
}

pub fn load_front_page(
    connection: &Connection,
    query: &FrontPageQuery,
    settings: ListingSettings,
) -> Result<FrontPage> {
    let total = count_issues(connection, query)?;
    let page_count = total.div_ceil(settings.per_page).max(1);
    let page_number = resolve_page_number(query.page.as_deref(), page_count);
    let offset = (page_number - 1) * settings.per_page;

    let (where_sql, mut values) = query.where_clause();
    let direction = match query.sort_direction {
        SortDirection::Ascending => "ASC",
        SortDirection::Descending => "DESC",
    };
    let sql = format!(
        "SELECT {LISTING_COLUMNS} FROM debian_wnpp w
         LEFT JOIN debian_popcon p ON p.package = w.project
         WHERE {where_sql}
         ORDER BY {} {direction}, w.ident
         LIMIT ? OFFSET ?",
        query.sort_column.order_expression()
    );
    values.push(Value::Integer(
        i64::try_from(settings.per_page).context("page size does not fit into i64")?,
    ));
    values.push(Value::Integer(
        i64::try_from(offset).context("page offset does not fit into i64")?,
    ));

    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare front page query")?;
    let rows = statement
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(ListingRow {
                issue: store::issue_from_row(row)?,
                users: row.get(10)?,
                installs: row.get(11)?,
            })
        })
        .context("failed to query front page issues")?;
    let mut output = Vec::new();
    for row in rows {
        output.push(row.context("failed to decode front page issue")?);
    }

    let page_items = settings
        .window
        .compute(page_count, page_number)
        .context("failed to lay out pagination")?;
    let (first_index, last_index) = if output.is_empty() {
        (0, 0)
    } else {
        (offset + 1, offset + output.len())
    };

    Ok(FrontPage {
        rows: output,
        total,
        page_number,
        page_count,
        first_index,
        last_index,
        page_items,
    })
}
