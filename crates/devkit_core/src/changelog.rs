use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, info};

use crate::config::DevkitConfig;
use crate::github::{
    GitHubTransport, Issue, IssueFilter, ItemState, Milestone, RepoRef, list_issues,
    list_milestones,
};

pub const BUG_FIXES: &str = "Bug fixes";
pub const ENHANCEMENTS: &str = "Enhancements";
pub const OTHER_CHANGES: &str = "Other changes";

const BUG_LABELS: &[&str] = &["bug"];
const ENHANCEMENT_LABELS: &[&str] = &["enhancement", "feature"];

#[derive(Debug, Clone)]
pub struct ChangelogOptions {
    pub title: String,
    pub exclude_labels: Vec<String>,
    pub include_open: bool,
}

impl ChangelogOptions {
    pub fn from_config(config: &DevkitConfig) -> Self {
        Self {
            title: config.changelog_title(),
            exclude_labels: config.changelog.exclude_labels.clone(),
            include_open: config.changelog.include_open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeItem {
    pub number: u64,
    pub title: String,
    pub url: Option<String>,
    pub labels: Vec<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSection {
    pub name: &'static str,
    pub items: Vec<ChangeItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub number: u64,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub date: Option<String>,
    pub is_open: bool,
    pub sections: Vec<ChangeSection>,
}

impl Release {
    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|section| section.items.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changelog {
    pub title: String,
    pub releases: Vec<Release>,
}

#[derive(Debug, Clone)]
pub struct GeneratedChangelog {
    pub changelog: Changelog,
    pub html: String,
}

/// Group issues under their milestones. Milestones without any remaining
/// issue are dropped, as are open milestones unless `include_open` is set.
pub fn build_changelog(
    milestones: &[Milestone],
    issues: &[Issue],
    options: &ChangelogOptions,
) -> Changelog {
    let mut by_milestone: BTreeMap<u64, Vec<&Issue>> = BTreeMap::new();
    for issue in issues {
        if issue.is_pull_request() || is_excluded(issue, &options.exclude_labels) {
            continue;
        }
        if let Some(milestone) = &issue.milestone {
            by_milestone.entry(milestone.number).or_default().push(issue);
        }
    }

    let mut releases = Vec::new();
    for milestone in milestones {
        let is_open = milestone.state.eq_ignore_ascii_case("open");
        if is_open && !options.include_open {
            continue;
        }
        let Some(mut milestone_issues) = by_milestone.remove(&milestone.number) else {
            debug!("skipping milestone {} with no issues", milestone.title);
            continue;
        };
        milestone_issues.sort_by_key(|issue| issue.number);

        let mut bugs = Vec::new();
        let mut enhancements = Vec::new();
        let mut other = Vec::new();
        for issue in milestone_issues {
            let item = change_item(issue);
            if matches_any(issue, BUG_LABELS) {
                bugs.push(item);
            } else if matches_any(issue, ENHANCEMENT_LABELS) {
                enhancements.push(item);
            } else {
                other.push(item);
            }
        }
        let sections = [(BUG_FIXES, bugs), (ENHANCEMENTS, enhancements), (OTHER_CHANGES, other)]
            .into_iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(name, items)| ChangeSection { name, items })
            .collect();

        releases.push(Release {
            number: milestone.number,
            title: milestone.title.clone(),
            description: milestone
                .description
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            url: milestone.html_url.clone(),
            date: milestone
                .closed_at
                .as_deref()
                .or(milestone.due_on.as_deref())
                .map(date_only),
            is_open,
            sections,
        });
    }

    releases.sort_by(compare_releases);
    Changelog {
        title: options.title.clone(),
        releases,
    }
}

fn change_item(issue: &Issue) -> ChangeItem {
    ChangeItem {
        number: issue.number,
        title: issue.title.trim().to_string(),
        url: issue.html_url.clone(),
        labels: issue.labels.iter().map(|label| label.name.clone()).collect(),
        author: issue.user.as_ref().map(|user| user.login.clone()),
    }
}

fn is_excluded(issue: &Issue, exclude_labels: &[String]) -> bool {
    exclude_labels
        .iter()
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .any(|label| issue.has_label(label))
}

fn matches_any(issue: &Issue, labels: &[&str]) -> bool {
    labels.iter().any(|label| issue.has_label(label))
}

/// Newest first: numeric version, then date, then title.
fn compare_releases(left: &Release, right: &Release) -> Ordering {
    let left_version = version_key(&left.title);
    let right_version = version_key(&right.title);
    let by_version = match (&left_version, &right_version) {
        (Some(left), Some(right)) => right.cmp(left),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_version
        .then_with(|| right.date.cmp(&left.date))
        .then_with(|| left.title.cmp(&right.title))
}

/// The first dotted number in a milestone title, e.g. `Release v1.10.2` -> [1, 10, 2].
pub fn version_key(title: &str) -> Option<Vec<u64>> {
    let start = title.find(|ch: char| ch.is_ascii_digit())?;
    let digits: String = title[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    let mut parts = digits
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    while parts.len() > 1 && parts.last() == Some(&0) {
        parts.pop();
    }
    Some(parts)
}

fn date_only(timestamp: &str) -> String {
    timestamp
        .split_once('T')
        .map(|(date, _)| date)
        .unwrap_or(timestamp)
        .to_string()
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn safe_href(url: Option<&str>) -> Option<String> {
    let url = url?.trim();
    let lowered = url.to_ascii_lowercase();
    (lowered.starts_with("https://") || lowered.starts_with("http://")).then(|| escape_html(url))
}

const STYLE: &str = "body{font-family:Segoe UI,Helvetica,Arial,sans-serif;max-width:52rem;margin:2rem auto;padding:0 1rem;color:#1f2328}\
h2{border-bottom:1px solid #d0d7de;padding-bottom:.3rem}\
.date{color:#656d76;font-size:.9rem;font-weight:normal}\
.label{background:#eaeef2;border-radius:1rem;padding:0 .5rem;font-size:.8rem;margin-left:.25rem}\
.open{color:#1a7f37;font-size:.8rem}";

pub fn render_html(changelog: &Changelog) -> String {
    let title = escape_html(&changelog.title);
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n");
    html.push_str("<html lang=\"en\">\n");
    html.push_str("<head>\n");
    html.push_str("<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{title}</title>\n"));
    html.push_str(&format!("<style>{STYLE}</style>\n"));
    html.push_str("</head>\n");
    html.push_str("<body>\n");
    html.push_str(&format!("<h1>{title}</h1>\n"));

    if changelog.releases.is_empty() {
        html.push_str("<p>No releases yet.</p>\n");
    }
    for release in &changelog.releases {
        render_release(&mut html, release);
    }

    html.push_str("</body>\n");
    html.push_str("</html>\n");
    html
}

fn render_release(html: &mut String, release: &Release) {
    let title = escape_html(&release.title);
    let heading = match safe_href(release.url.as_deref()) {
        Some(href) => format!("<a href=\"{href}\">{title}</a>"),
        None => title,
    };
    let date = release
        .date
        .as_deref()
        .map(|date| format!(" <span class=\"date\">{}</span>", escape_html(date)))
        .unwrap_or_default();
    let open = if release.is_open {
        " <span class=\"open\">(unreleased)</span>"
    } else {
        ""
    };

    html.push_str(&format!(
        "<section class=\"release\" id=\"milestone-{}\">\n",
        release.number
    ));
    html.push_str(&format!("<h2>{heading}{date}{open}</h2>\n"));
    if let Some(description) = &release.description {
        html.push_str(&format!(
            "<p class=\"description\">{}</p>\n",
            escape_html(description)
        ));
    }
    for section in &release.sections {
        html.push_str(&format!("<h3>{}</h3>\n", escape_html(section.name)));
        html.push_str("<ul>\n");
        for item in &section.items {
            let reference = match safe_href(item.url.as_deref()) {
                Some(href) => format!("<a href=\"{href}\">#{}</a>", item.number),
                None => format!("#{}", item.number),
            };
            let labels: String = item
                .labels
                .iter()
                .map(|label| format!(" <span class=\"label\">{}</span>", escape_html(label)))
                .collect();
            let author = item
                .author
                .as_deref()
                .map(|login| format!(" (@{})", escape_html(login)))
                .unwrap_or_default();
            html.push_str(&format!(
                "<li>{reference} {}{author}{labels}</li>\n",
                escape_html(&item.title)
            ));
        }
        html.push_str("</ul>\n");
    }
    html.push_str("</section>\n");
}

/// Fetch milestones and their closed issues, then render the changelog.
pub fn generate_changelog<G: GitHubTransport + ?Sized>(
    transport: &mut G,
    api_url: &str,
    repo: &RepoRef,
    options: &ChangelogOptions,
) -> Result<GeneratedChangelog> {
    let milestones = list_milestones(transport, api_url, repo, ItemState::All)?;
    info!(
        "{} milestone(s) found for {}/{}",
        milestones.len(),
        repo.owner,
        repo.repo
    );

    let mut issues = Vec::new();
    for milestone in &milestones {
        if !options.include_open && milestone.state.eq_ignore_ascii_case("open") {
            continue;
        }
        let filter = IssueFilter {
            state: ItemState::Closed,
            milestone: Some(milestone.number),
            labels: Vec::new(),
        };
        let mut milestone_issues = list_issues(transport, api_url, repo, &filter)?;
        debug!(
            "milestone {}: {} closed issue(s)",
            milestone.title,
            milestone_issues.len()
        );
        issues.append(&mut milestone_issues);
    }

    let changelog = build_changelog(&milestones, &issues, options);
    let html = render_html(&changelog);
    Ok(GeneratedChangelog { changelog, html })
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{
        BUG_FIXES, ChangelogOptions, ENHANCEMENTS, OTHER_CHANGES, build_changelog, escape_html,
        generate_changelog, render_html, version_key,
    };
    use crate::github::testing::MockTransport;
    use crate::github::{
        Issue, IssueFilter, ItemState, Milestone, RepoRef, issues_url, milestones_url,
    };

    const API: &str = "https://api.github.com";

    fn options() -> ChangelogOptions {
        ChangelogOptions {
            title: "Widgets changelog".to_string(),
            exclude_labels: vec!["Internal".to_string()],
            include_open: false,
        }
    }

    fn milestone(number: u64, title: &str, state: &str, closed_at: Option<&str>) -> Value {
        json!({
            "number": number,
            "title": title,
            "state": state,
            "closed_at": closed_at,
            "html_url": format!("https://github.com/contoso/widgets/milestone/{number}")
        })
    }

    fn issue(number: u64, title: &str, labels: &[&str], milestone: u64) -> Value {
        json!({
            "number": number,
            "title": title,
            "state": "closed",
            "html_url": format!("https://github.com/contoso/widgets/issues/{number}"),
            "labels": labels.iter().map(|name| json!({"name": name})).collect::<Vec<_>>(),
            "milestone": {"number": milestone, "title": "ignored"},
            "user": {"login": "octo"}
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Vec<T> {
        serde_json::from_value(value).expect("decode")
    }

    #[test]
    fn issues_are_grouped_by_label_and_excluded_case_insensitively() {
        let milestones: Vec<Milestone> = decode(json!([milestone(
            1,
            "v1.0",
            "closed",
            Some("2024-03-01T10:00:00Z")
        )]));
        let issues: Vec<Issue> = decode(json!([
            issue(5, "Crash on save", &["Bug"], 1),
            issue(3, "Dark mode", &["enhancement"], 1),
            issue(4, "Bump CI image", &["internal"], 1),
            issue(2, "Docs typo", &[], 1),
        ]));

        let changelog = build_changelog(&milestones, &issues, &options());
        assert_eq!(changelog.releases.len(), 1);
        let release = &changelog.releases[0];
        assert_eq!(release.date.as_deref(), Some("2024-03-01"));
        let names: Vec<&str> = release.sections.iter().map(|section| section.name).collect();
        assert_eq!(names, vec![BUG_FIXES, ENHANCEMENTS, OTHER_CHANGES]);
        assert_eq!(release.item_count(), 3);
        assert_eq!(release.sections[2].items[0].number, 2);
    }

    #[test]
    fn only_bug_enhancement_and_feature_labels_get_their_own_sections() {
        let milestones: Vec<Milestone> = decode(json!([milestone(1, "v1.1", "closed", None)]));
        let issues: Vec<Issue> = decode(json!([
            issue(1, "Faster startup", &["improvement"], 1),
            issue(2, "Broke export", &["regression"], 1),
            issue(3, "Typed bug", &["type: bug"], 1),
            issue(4, "Plugin API", &["Feature"], 1),
        ]));

        let changelog = build_changelog(&milestones, &issues, &options());
        let sections: Vec<(&str, Vec<u64>)> = changelog.releases[0]
            .sections
            .iter()
            .map(|section| {
                let numbers = section.items.iter().map(|item| item.number).collect();
                (section.name, numbers)
            })
            .collect();
        assert_eq!(
            sections,
            vec![(ENHANCEMENTS, vec![4]), (OTHER_CHANGES, vec![1, 2, 3])]
        );
    }

    #[test]
    fn releases_sort_by_version_then_date_and_drop_empty_or_open() {
        let milestones: Vec<Milestone> = decode(json!([
            milestone(1, "v1.9.0", "closed", Some("2024-01-01T00:00:00Z")),
            milestone(2, "v1.10", "closed", Some("2023-12-01T00:00:00Z")),
            milestone(3, "Backlog cleanup", "closed", Some("2024-05-01T00:00:00Z")),
            milestone(4, "v2.0", "open", None),
            milestone(5, "v0.1", "closed", None),
        ]));
        let issues: Vec<Issue> = decode(json!([
            issue(1, "a", &[], 1),
            issue(2, "b", &[], 2),
            issue(3, "c", &[], 3),
            issue(4, "d", &[], 4),
        ]));

        let changelog = build_changelog(&milestones, &issues, &options());
        let titles: Vec<&str> = changelog
            .releases
            .iter()
            .map(|release| release.title.as_str())
            .collect();
        assert_eq!(titles, vec!["v1.10", "v1.9.0", "Backlog cleanup"]);

        let mut with_open = options();
        with_open.include_open = true;
        let changelog = build_changelog(&milestones, &issues, &with_open);
        assert_eq!(changelog.releases[0].title, "v2.0");
        assert!(changelog.releases[0].is_open);
    }

    #[test]
    fn version_key_ignores_trailing_zeros_and_prefixes() {
        assert_eq!(version_key("Release v1.10.0"), Some(vec![1, 10]));
        assert_eq!(version_key("2.0"), Some(vec![2]));
        assert_eq!(version_key("Sprint"), None);
        assert!(version_key("v1.10") > version_key("v1.9.3"));
    }

    #[test]
    fn html_is_escaped_and_links_are_restricted_to_http() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & Jerry's</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/a&gt;"
        );

        let milestones: Vec<Milestone> = decode(json!([{
            "number": 7,
            "title": "v3 <beta>",
            "state": "closed",
            "html_url": "javascript:alert(1)"
        }]));
        let issues: Vec<Issue> = decode(json!([issue(9, "Fix <script> injection", &["bug"], 7)]));
        let html = render_html(&build_changelog(&milestones, &issues, &options()));

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>Widgets changelog</title>"));
        assert!(html.contains("<h2>v3 &lt;beta&gt;</h2>"));
        assert!(!html.contains("javascript:"));
        assert!(html.contains("Fix &lt;script&gt; injection"));
        assert!(html.contains(
            "<a href=\"https://github.com/contoso/widgets/issues/9\">#9</a>"
        ));
        assert!(html.contains("(@octo)"));
    }

    #[test]
    fn empty_changelog_renders_placeholder() {
        let html = render_html(&build_changelog(&[], &[], &options()));
        assert!(html.contains("No releases yet."));
    }

    #[test]
    fn generate_fetches_milestones_and_their_issues() {
        let repo = RepoRef::new("contoso", "widgets").expect("repo");
        let milestones_page = milestones_url(API, &repo, ItemState::All).expect("url");
        let issues_page = issues_url(
            API,
            &repo,
            &IssueFilter {
                state: ItemState::Closed,
                milestone: Some(1),
                labels: Vec::new(),
            },
        )
        .expect("url");
        let second_page = format!("{issues_page}&page=2");

        let mut transport = MockTransport::default()
            .page(
                &milestones_page,
                json!([
                    milestone(1, "v1.0", "closed", Some("2024-03-01T10:00:00Z")),
                    milestone(2, "v1.1", "open", None)
                ]),
                None,
            )
            .page(
                &issues_page,
                json!([issue(1, "First", &["bug"], 1)]),
                Some(&second_page),
            )
            .page(&second_page, json!([issue(2, "Second", &[], 1)]), None);

        let generated =
            generate_changelog(&mut transport, API, &repo, &options()).expect("generate");
        assert_eq!(generated.changelog.releases[0].item_count(), 2);
        assert!(generated.html.contains("First"));
        assert!(generated.html.contains("Second"));
        assert_eq!(transport.requested.len(), 3);
    }
}
