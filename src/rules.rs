//! HTML and header checks
//!
//! [`evaluate`] is a pure function of the fetched page: it parses the HTML
//! once, runs every check and files each finding into exactly one list of
//! exactly one category. It also extracts the page metadata and technical
//! details that end up in the report.

use crate::RuleProfile;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use url::Url;

const MAX_SCRIPTS: usize = 10;
const MAX_STYLE_BLOCKS: usize = 3;
const MAX_IMAGES: usize = 20;
const HTML_SIZE_GOOD: usize = 100 * 1024;
const HTML_SIZE_LIMIT: usize = 500 * 1024;

const HEADERS_OF_INTEREST: [&str; 9] = [
    "content-type",
    "server",
    "cache-control",
    "content-encoding",
    "strict-transport-security",
    "x-content-type-options",
    "x-frame-options",
    "content-security-policy",
    "referrer-policy",
];

/// Parse a constant selector once per call site.
macro_rules! selector {
    ($css:expr) => {{
        static SELECTOR: OnceLock<Option<Selector>> = OnceLock::new();
        SELECTOR.get_or_init(|| Selector::parse($css).ok()).as_ref()
    }};
}

fn select_all<'a>(document: &'a Html, selector: Option<&Selector>) -> Vec<ElementRef<'a>> {
    selector
        .map(|s| document.select(s).collect())
        .unwrap_or_default()
}

fn select_first<'a>(document: &'a Html, selector: Option<&Selector>) -> Option<ElementRef<'a>> {
    selector.and_then(|s| document.select(s).next())
}

fn attr(element: Option<ElementRef<'_>>, name: &str) -> Option<String> {
    element
        .and_then(|e| e.value().attr(name))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Findings of one category plus its derived score
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryResult {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub warnings: Vec<String>,
    pub score: u8,
}

impl CategoryResult {
    pub fn pass(&mut self, finding: impl Into<String>) {
        self.passed.push(finding.into());
    }

    pub fn fail(&mut self, finding: impl Into<String>) {
        self.failed.push(finding.into());
    }

    pub fn warn(&mut self, finding: impl Into<String>) {
        self.warnings.push(finding.into());
    }

    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.warnings.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Categories {
    pub common_seo: CategoryResult,
    pub speed: CategoryResult,
    pub security: CategoryResult,
    pub mobile: CategoryResult,
    pub advanced_seo: CategoryResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical: Option<String>,
    pub keywords: Option<String>,
    pub language: Option<String>,
    pub robots: Option<String>,
    pub viewport: Option<String>,
    pub charset: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagCounts {
    pub scripts: usize,
    pub stylesheets: usize,
    pub style_blocks: usize,
    pub images: usize,
    pub links: usize,
    pub h1: usize,
    pub h2: usize,
    pub h3: usize,
    pub iframes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalInfo {
    pub tag_counts: TagCounts,
    pub html_size: usize,
    pub console_errors: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

/// What the rules look at
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub html: &'a str,
    /// Lowercased header names
    pub headers: &'a HashMap<String, String>,
    pub console_errors: &'a [String],
    pub url: &'a Url,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub categories: Categories,
    pub metadata: Metadata,
    pub technical_info: TechnicalInfo,
}

/// Length bands and severities for a [`RuleProfile`]
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    title: (usize, usize),
    title_long_fails: bool,
    description: (usize, usize),
    description_long_fails: bool,
    console_errors_fail: bool,
}

impl From<RuleProfile> for Thresholds {
    fn from(profile: RuleProfile) -> Self {
        match profile {
            RuleProfile::Strict => Self {
                title: (30, 60),
                title_long_fails: true,
                description: (120, 160),
                description_long_fails: true,
                console_errors_fail: true,
            },
            RuleProfile::Relaxed => Self {
                title: (10, 70),
                title_long_fails: false,
                description: (70, 160),
                description_long_fails: false,
                console_errors_fail: false,
            },
        }
    }
}

pub fn evaluate(input: &RuleInput<'_>, profile: RuleProfile) -> RuleOutcome {
    let document = Html::parse_document(input.html);
    let thresholds = Thresholds::from(profile);
    let metadata = extract_metadata(&document);
    let tag_counts = count_tags(&document);

    let mut categories = Categories::default();
    check_common_seo(&mut categories.common_seo, &document, input, &metadata, &tag_counts, thresholds);
    check_speed(&mut categories.speed, input, &tag_counts);
    check_security(&mut categories.security, &document, input);
    check_mobile(&mut categories.mobile, &metadata, &document);
    check_advanced_seo(&mut categories.advanced_seo, &document, input, &metadata, thresholds);

    let headers = HEADERS_OF_INTEREST
        .iter()
        .filter_map(|name| {
            input
                .headers
                .get(*name)
                .map(|value| (name.to_string(), value.clone()))
        })
        .collect();

    RuleOutcome {
        categories,
        metadata,
        technical_info: TechnicalInfo {
            tag_counts,
            html_size: input.html.len(),
            console_errors: input.console_errors.to_vec(),
            headers,
        },
    }
}

fn extract_metadata(document: &Html) -> Metadata {
    let meta_content = |element: Option<ElementRef<'_>>| attr(element, "content");

    let title = select_first(document, selector!("title"))
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let charset = attr(select_first(document, selector!("meta[charset]")), "charset").or_else(|| {
        meta_content(select_first(document, selector!("meta[http-equiv='Content-Type']")))
            .and_then(|content| {
                content
                    .split(';')
                    .find_map(|part| part.trim().strip_prefix("charset=").map(str::to_string))
            })
    });

    Metadata {
        title,
        description: meta_content(select_first(document, selector!("meta[name='description']"))),
        canonical: attr(select_first(document, selector!("link[rel='canonical']")), "href"),
        keywords: meta_content(select_first(document, selector!("meta[name='keywords']"))),
        language: attr(select_first(document, selector!("html")), "lang"),
        robots: meta_content(select_first(document, selector!("meta[name='robots']"))),
        viewport: meta_content(select_first(document, selector!("meta[name='viewport']"))),
        charset,
        og_title: meta_content(select_first(document, selector!("meta[property='og:title']"))),
        og_description: meta_content(select_first(
            document,
            selector!("meta[property='og:description']"),
        )),
        og_image: meta_content(select_first(document, selector!("meta[property='og:image']"))),
    }
}

fn count_tags(document: &Html) -> TagCounts {
    let count = |selector: Option<&Selector>| select_all(document, selector).len();

    TagCounts {
        scripts: count(selector!("script:not([type='application/ld+json'])")),
        stylesheets: count(selector!("link[rel~='stylesheet']")),
        style_blocks: count(selector!("style")),
        images: count(selector!("img")),
        links: count(selector!("a[href]")),
        h1: count(selector!("h1")),
        h2: count(selector!("h2")),
        h3: count(selector!("h3")),
        iframes: count(selector!("iframe")),
    }
}

fn check_common_seo(
    category: &mut CategoryResult,
    document: &Html,
    input: &RuleInput<'_>,
    metadata: &Metadata,
    tags: &TagCounts,
    thresholds: Thresholds,
) {
    match &metadata.title {
        None => category.fail("Missing title tag"),
        Some(title) => {
            let len = title.chars().count();
            let (min, max) = thresholds.title;
            if len < min {
                category.warn(format!(
                    "Title too short ({len} characters, recommended {min}-{max})"
                ));
            } else if len > max {
                let finding = format!("Title too long ({len} characters, recommended {min}-{max})");
                if thresholds.title_long_fails {
                    category.fail(finding);
                } else {
                    category.warn(finding);
                }
            } else {
                category.pass(format!("Title length is optimal ({len} characters)"));
            }
        }
    }

    match &metadata.description {
        None => category.fail("Missing meta description"),
        Some(description) => {
            let len = description.chars().count();
            let (min, max) = thresholds.description;
            if len < min {
                category.warn(format!(
                    "Meta description too short ({len} characters, recommended {min}-{max})"
                ));
            } else if len > max {
                let finding = format!(
                    "Meta description too long ({len} characters, recommended {min}-{max})"
                );
                if thresholds.description_long_fails {
                    category.fail(finding);
                } else {
                    category.warn(finding);
                }
            } else {
                category.pass(format!("Meta description length is optimal ({len} characters)"));
            }
        }
    }

    match tags.h1 {
        0 => category.fail("Missing H1 heading"),
        1 => category.pass("Page has exactly one H1 heading"),
        n => category.warn(format!("Multiple H1 headings found ({n})")),
    }

    if tags.h2 > 0 {
        category.pass(format!("Page uses H2 subheadings ({})", tags.h2));
    } else {
        category.warn("No H2 subheadings found");
    }

    let images = select_all(document, selector!("img"));
    if !images.is_empty() {
        let missing_alt = images
            .iter()
            .filter(|img| {
                img.value()
                    .attr("alt")
                    .map(|alt| alt.trim().is_empty())
                    .unwrap_or(true)
            })
            .count();
        if missing_alt > 0 {
            category.fail(format!(
                "{missing_alt} of {} images missing alt text",
                images.len()
            ));
        } else {
            category.pass("All images have alt text");
        }
    }

    if has_device_width_viewport(metadata) {
        category.pass("Viewport meta tag is configured for device width");
    } else {
        category.fail("Missing or incorrect viewport meta tag");
    }

    if select_first(document, selector!("link[rel~='icon']")).is_some() {
        category.pass("Favicon is present");
    } else {
        category.fail("Missing favicon");
    }

    if let Some(status) = input.status {
        if status < 400 {
            category.pass(format!("Page returned HTTP {status}"));
        } else {
            category.fail(format!("Page returned HTTP error {status}"));
        }
    }

    match &metadata.language {
        Some(lang) => category.pass(format!("Document language declared ({lang})")),
        None => category.warn("Missing lang attribute on html element"),
    }
}

fn check_speed(category: &mut CategoryResult, input: &RuleInput<'_>, tags: &TagCounts) {
    if tags.scripts <= MAX_SCRIPTS {
        category.pass(format!("Reasonable number of scripts ({})", tags.scripts));
    } else {
        category.warn(format!(
            "Too many scripts ({}), consider bundling",
            tags.scripts
        ));
    }

    if tags.style_blocks <= MAX_STYLE_BLOCKS {
        category.pass(format!("Few inline style blocks ({})", tags.style_blocks));
    } else {
        category.warn(format!(
            "Too many inline style blocks ({}), move CSS to external stylesheets",
            tags.style_blocks
        ));
    }

    if tags.images <= MAX_IMAGES {
        category.pass(format!("Reasonable number of images ({})", tags.images));
    } else {
        category.warn(format!(
            "Many images on the page ({}), consider lazy loading",
            tags.images
        ));
    }

    let size_kb = input.html.len() / 1024;
    if input.html.len() <= HTML_SIZE_GOOD {
        category.pass(format!("HTML size is small ({size_kb} KB)"));
    } else if input.html.len() <= HTML_SIZE_LIMIT {
        category.warn(format!("HTML size is large ({size_kb} KB)"));
    } else {
        category.fail(format!("HTML size is excessive ({size_kb} KB)"));
    }
}

/// Any `src` or `href` attribute pointing at a plain `http://` URL
fn has_insecure_reference(document: &Html) -> bool {
    let insecure = |value: Option<&str>| {
        value
            .map(|v| v.trim_start().get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://")))
            .unwrap_or(false)
    };

    select_all(document, selector!("[src], [href]"))
        .iter()
        .any(|element| insecure(element.value().attr("src")) || insecure(element.value().attr("href")))
}

fn check_security(category: &mut CategoryResult, document: &Html, input: &RuleInput<'_>) {
    let is_https = input.url.scheme() == "https";

    if is_https {
        category.pass("Site uses HTTPS");
        if has_insecure_reference(document) {
            category.warn("Mixed content: page references resources over HTTP");
        } else {
            category.pass("No mixed content detected");
        }
    } else {
        category.fail("Site does not use HTTPS");
    }

    if input.headers.contains_key("strict-transport-security") {
        category.pass("HSTS header is set");
    } else {
        category.warn("Missing HSTS header (Strict-Transport-Security)");
    }

    let nosniff = input
        .headers
        .get("x-content-type-options")
        .map(|v| v.to_ascii_lowercase().contains("nosniff"))
        .unwrap_or(false);
    if nosniff {
        category.pass("X-Content-Type-Options is set to nosniff");
    } else {
        category.warn("Missing X-Content-Type-Options: nosniff header");
    }

    let frame_ancestors = input
        .headers
        .get("content-security-policy")
        .map(|v| v.to_ascii_lowercase().contains("frame-ancestors"))
        .unwrap_or(false);
    if input.headers.contains_key("x-frame-options") || frame_ancestors {
        category.pass("Clickjacking protection is configured");
    } else {
        category.warn("No clickjacking protection (X-Frame-Options or CSP frame-ancestors)");
    }
}

fn has_device_width_viewport(metadata: &Metadata) -> bool {
    metadata
        .viewport
        .as_deref()
        .map(|v| v.to_ascii_lowercase().contains("width=device-width"))
        .unwrap_or(false)
}

fn check_mobile(category: &mut CategoryResult, metadata: &Metadata, document: &Html) {
    if has_device_width_viewport(metadata) {
        category.pass("Viewport meta tag is configured for device width");
    } else {
        category.fail("Missing or incorrect viewport meta tag");
    }

    if let Some(viewport) = &metadata.viewport {
        let compact: String = viewport
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let zoom_disabled = compact.contains("user-scalable=no")
            || compact.contains("user-scalable=0")
            || compact.contains("maximum-scale=1,")
            || compact.ends_with("maximum-scale=1")
            || compact.contains("maximum-scale=1.0");
        if zoom_disabled {
            category.warn("Viewport disables zooming");
        } else {
            category.pass("Users can zoom the page");
        }
    }

    if select_first(document, selector!("link[rel~='apple-touch-icon']")).is_some() {
        category.pass("Apple touch icon is present");
    } else {
        category.warn("Missing apple-touch-icon");
    }
}

fn check_advanced_seo(
    category: &mut CategoryResult,
    document: &Html,
    input: &RuleInput<'_>,
    metadata: &Metadata,
    thresholds: Thresholds,
) {
    if metadata.canonical.is_some() {
        category.pass("Canonical URL specified");
    } else {
        category.warn("Missing canonical URL");
    }

    if select_first(document, selector!("meta[property^='og:']")).is_some() {
        category.pass("Open Graph tags present");
    } else {
        category.warn("Missing Open Graph tags");
    }

    if select_first(document, selector!("script[type='application/ld+json']")).is_some() {
        category.pass("Structured data (JSON-LD) found");
    } else {
        category.warn("No structured data (JSON-LD) found");
    }

    let noindex = metadata
        .robots
        .as_deref()
        .map(|r| r.to_ascii_lowercase().contains("noindex"))
        .unwrap_or(false);
    if noindex {
        category.warn("Page is marked noindex");
    } else {
        category.pass("Page is indexable");
    }

    match input.console_errors.len() {
        0 => category.pass("No JavaScript console errors"),
        n => {
            let finding = format!("{n} JavaScript console error(s) detected");
            if thresholds.console_errors_fail {
                category.fail(finding);
            } else {
                category.warn(finding);
            }
        }
    }
}
