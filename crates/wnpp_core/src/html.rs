use anyhow::Result;

use crate::links::{
    SortDirection, contact_link_for, debian_package_tracker_url, escape_html, self_url_with_sorting_for,
    url_for_page, wnpp_issue_url,
};
use crate::listing::{Column, FrontPage, FrontPageQuery, ListingRow};
use crate::models::IssueKind;
use crate::pagination::PageIndicator;

const CONTACT_TRUNCATE_CHARS: usize = 30;

/// Renders the front page for the request at `request_url` (path and query).
pub fn render_front_page(
    page: &FrontPage,
    query: &FrontPageQuery,
    request_url: &str,
    now: i64,
) -> Result<String> {
    let mut html = String::new();
    html.push_str(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Debian WNPP: Work-Needing and Prospective Packages</title>\n\
         <link rel=\"alternate\" type=\"application/rss+xml\" title=\"Debian Packaging News\" href=\"/news.php5\">\n\
         <link rel=\"icon\" href=\"/favicon.ico\">\n\
         <link rel=\"stylesheet\" href=\"/static/wnpp.css\">\n</head>\n<body>\n",
    );
    html.push_str("<h1>Debian WNPP: Work-Needing and Prospective Packages</h1>\n");
    render_filters(&mut html, query);
    render_summary(&mut html, page);
    render_table(&mut html, page, query, request_url, now)?;
    render_pagination(&mut html, page, request_url)?;
    html.push_str(
        "<p class=\"feeds\">News feeds: <a href=\"/news.php5?data=all\">all</a>, \
         <a href=\"/news.php5?data=good_news\">good news</a>, \
         <a href=\"/news.php5?data=bad_news\">bad news</a>, \
         <a href=\"/news.php5?data=help_existing\">existing packages in need for help</a>, \
         <a href=\"/news.php5?data=new_packages\">new packages</a></p>\n",
    );
    html.push_str("</body>\n</html>\n");
    Ok(html)
}

fn checkbox(html: &mut String, name: &str, value: &str, checked: bool, label: &str) {
    html.push_str(&format!(
        "<label><input type=\"checkbox\" name=\"{}\" value=\"{}\"{}> {}</label>\n",
        escape_html(name),
        escape_html(value),
        if checked { " checked" } else { "" },
        escape_html(label)
    ));
}

fn render_filters(html: &mut String, query: &FrontPageQuery) {
    html.push_str("<form method=\"get\" action=\"/\" class=\"filters\">\n<fieldset>\n<legend>Types</legend>\n");
    for kind in IssueKind::ALL {
        checkbox(html, "type[]", kind.as_str(), query.kinds.contains(&kind), kind.label());
    }
    html.push_str("</fieldset>\n<fieldset>\n<legend>Owner</legend>\n");
    checkbox(html, "owner[]", "yes", query.with_owner, "with owner");
    checkbox(html, "owner[]", "no", query.without_owner, "without owner");
    html.push_str("</fieldset>\n<fieldset>\n<legend>Columns</legend>\n");
    for column in Column::ALL {
        if column == Column::Project {
            continue;
        }
        checkbox(html, "col[]", column.as_str(), query.shows(column), column.heading());
    }
    html.push_str("</fieldset>\n<fieldset>\n<legend>Search</legend>\n");
    html.push_str(&format!(
        "<label>Project <input type=\"text\" name=\"project\" value=\"{}\"></label>\n\
         <label>Description <input type=\"text\" name=\"description\" value=\"{}\"></label>\n",
        escape_html(&query.project_filter),
        escape_html(&query.description_filter)
    ));
    html.push_str(&format!(
        "</fieldset>\n<input type=\"hidden\" name=\"sort\" value=\"{}\">\n\
         <button type=\"submit\">Apply</button>\n</form>\n",
        escape_html(&query.sort_param())
    ));
}

fn render_summary(html: &mut String, page: &FrontPage) {
    html.push_str(&format!(
        "<p class=\"summary\">({} to {}; {} total)</p>\n",
        page.first_index, page.last_index, page.total
    ));
}

fn render_table(
    html: &mut String,
    page: &FrontPage,
    query: &FrontPageQuery,
    request_url: &str,
    now: i64,
) -> Result<()> {
    let columns: Vec<Column> = Column::ALL
        .into_iter()
        .filter(|column| query.shows(*column))
        .collect();
    let current_sort = query.sort_param();

    html.push_str("<table class=\"issues\">\n<thead>\n<tr>\n");
    for column in &columns {
        let href = self_url_with_sorting_for(request_url, &current_sort, column.as_str())?;
        let marker = if *column == query.sort_column {
            match query.sort_direction {
                SortDirection::Ascending => " &#9650;",
                SortDirection::Descending => " &#9660;",
            }
        } else {
            ""
        };
        html.push_str(&format!(
            "<th><a href=\"{}\">{}</a>{marker}</th>\n",
            escape_html(&href),
            column.heading()
        ));
    }
    html.push_str("</tr>\n</thead>\n<tbody>\n");

    for row in &page.rows {
        html.push_str(&format!(
            "<tr class=\"kind-{}\">\n",
            row.issue.kind.as_str().to_lowercase()
        ));
        for column in &columns {
            html.push_str("<td>");
            html.push_str(&render_cell(row, *column, now));
            html.push_str("</td>\n");
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n");
    Ok(())
}

fn render_cell(row: &ListingRow, column: Column, now: i64) -> String {
    let issue = &row.issue;
    match column {
        Column::Dust => issue.dust_days(now).to_string(),
        Column::Age => issue.age_days(now).to_string(),
        Column::Type => format!(
            "<abbr title=\"{}\">{}</abbr>",
            escape_html(issue.kind.label()),
            issue.kind.as_str()
        ),
        Column::Project => {
            let project = issue.project.as_deref().unwrap_or("");
            if issue.has_existing_package() && !project.is_empty() {
                format!(
                    "<a href=\"{}\">{}</a>",
                    escape_html(&debian_package_tracker_url(project)),
                    escape_html(project)
                )
            } else {
                escape_html(project)
            }
        }
        Column::Ident => format!(
            "<a href=\"{}\">#{}</a>",
            escape_html(&wnpp_issue_url(issue.ident)),
            issue.ident
        ),
        Column::Description => format!(
            "<a href=\"{}\">{}</a>",
            escape_html(&wnpp_issue_url(issue.ident)),
            escape_html(issue.description.as_deref().unwrap_or(""))
        ),
        Column::Users => row.users.to_string(),
        Column::Installs => row.installs.to_string(),
        Column::Owner => contact_link_for(issue.charge_person.as_deref(), Some(CONTACT_TRUNCATE_CHARS)),
        Column::Reporter => contact_link_for(issue.open_person.as_deref(), Some(CONTACT_TRUNCATE_CHARS)),
    }
}

fn page_link(html: &mut String, href: Option<&str>, label: &str, active: bool) {
    let class = match (href, active) {
        (_, true) => "page-item active",
        (None, false) => "page-item disabled",
        (Some(_), false) => "page-item",
    };
    match href {
        Some(href) => html.push_str(&format!(
            "<li class=\"{class}\"><a class=\"page-link\" href=\"{}\">{label}</a></li>\n",
            escape_html(href)
        )),
        None => html.push_str(&format!(
            "<li class=\"{class}\"><span class=\"page-link\">{label}</span></li>\n"
        )),
    }
}

fn render_pagination(html: &mut String, page: &FrontPage, request_url: &str) -> Result<()> {
    html.push_str("<nav><ul class=\"pagination\">\n");

    let previous = if page.has_previous() {
        Some(url_for_page(request_url, page.page_number - 1)?)
    } else {
        None
    };
    page_link(html, previous.as_deref(), "&laquo; Previous", false);

    for item in &page.page_items {
        match item {
            PageIndicator::Ellipsis => page_link(html, None, "…", false),
            PageIndicator::Page(number) => {
                let href = url_for_page(request_url, *number)?;
                page_link(
                    html,
                    Some(&href),
                    &number.to_string(),
                    *number == page.page_number,
                );
            }
        }
    }

    let next = if page.has_next() {
        Some(url_for_page(request_url, page.page_number + 1)?)
    } else {
        None
    };
    page_link(html, next.as_deref(), "Next &raquo;", false);

    html.push_str("</ul></nav>\n");
    Ok(())
}
