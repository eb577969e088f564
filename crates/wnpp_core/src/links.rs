use anyhow::{Context, Result};
use reqwest::Url;

use crate::import_debbugs::truncate_chars;

const SCRATCH_BASE: &str = "http://localhost/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

/// Splits `column/desc` (or legacy `column;desc`) into column and direction.
/// Anything but `desc` sorts ascending.
pub fn parse_sort_param(sort: &str) -> (&str, SortDirection) {
    match sort.split_once(['/', ';']) {
        Some((column, "desc")) => (column, SortDirection::Descending),
        Some((column, _)) => (column, SortDirection::Ascending),
        None => (sort, SortDirection::Ascending),
    }
}

pub fn combine_sort_param(column: &str, direction: SortDirection) -> String {
    format!("{column}/{}", direction.as_str())
}

pub fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    let mut scratch = Url::parse(SCRATCH_BASE).context("failed to build scratch URL")?;
    scratch.set_query(Some(query));
    Ok(scratch
        .query_pairs()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect())
}

/// Applies `updates` to the query of `url`: the rightmost pair with the same key is
/// replaced in place, otherwise the pair is appended.
pub fn url_with_query(url: &str, updates: &[(&str, &str)]) -> Result<String> {
    let base = Url::parse(SCRATCH_BASE).context("failed to build scratch URL")?;
    let mut parsed = base
        .join(url)
        .with_context(|| format!("invalid request URL {url:?}"))?;
    let mut pairs = parse_query(parsed.query().unwrap_or(""))?;

    for (key, value) in updates {
        let new_pair = ((*key).to_string(), (*value).to_string());
        match pairs.iter().rposition(|(existing, _)| existing == key) {
            Some(index) => pairs[index] = new_pair,
            None => pairs.push(new_pair),
        }
    }

    parsed.set_fragment(None);
    parsed.query_pairs_mut().clear().extend_pairs(&pairs);
    Ok(match parsed.query() {
        Some(query) if !query.is_empty() => format!("{}?{query}", parsed.path()),
        _ => parsed.path().to_string(),
    })
}

/// The current URL sorted by `future_column`, flipping the direction when it is
/// already the sort column, and back on page 1.
pub fn self_url_with_sorting_for(url: &str, current_sort: &str, future_column: &str) -> Result<String> {
    let (current_column, mut direction) = parse_sort_param(current_sort);
    if current_column == future_column {
        direction = direction.flipped();
    }
    let future_sort = combine_sort_param(future_column, direction);
    url_with_query(url, &[("sort", &future_sort), ("page", "1")])
}

pub fn url_for_page(url: &str, page_number: usize) -> Result<String> {
    url_with_query(url, &[("page", &page_number.to_string())])
}

pub fn wnpp_issue_url(ident: i64) -> String {
    format!("https://bugs.debian.org/cgi-bin/bugreport.cgi?bug={ident}")
}

pub fn debian_package_tracker_url(package_name: &str) -> String {
    format!("https://tracker.debian.org/pkg/{package_name}")
}

/// Splits `"Name" <mail>`, `Name <mail>` or `mail` into mailto and display name.
pub fn parse_contact(contact: &str) -> (String, String) {
    match contact.rsplit_once(' ') {
        None => (contact.to_string(), contact.to_string()),
        Some((display, angled_address)) => {
            let display = display.trim_matches('"').replace(['<', '>'], "");
            let mailto = angled_address.replace(['<', '>'], "");
            (mailto, display)
        }
    }
}

pub fn contact_link_for(contact: Option<&str>, truncate: Option<usize>) -> String {
    match contact.filter(|contact| !contact.is_empty()) {
        None => "<i>nobody</i>".to_string(),
        Some(contact) => {
            let (mailto, display) = parse_contact(contact);
            let display = match truncate {
                Some(length) => truncate_chars(&display, length),
                None => display,
            };
            format!(
                "<a href=\"mailto:{}\">{}</a>",
                escape_html(&mailto),
                escape_html(&display)
            )
        }
    }
}

/// Characters XML 1.0 does not allow are dropped.
pub fn escape_html(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#x27;"),
            '\t' | '\n' | '\r' => output.push(character),
            control if (control as u32) < 0x20 || matches!(control, '\u{fffe}' | '\u{ffff}') => {}
            other => output.push(other),
        }
    }
    output
}
