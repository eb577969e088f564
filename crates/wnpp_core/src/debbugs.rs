//! Client for the Debbugs SOAP service at bugs.debian.org.

use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;

use crate::config::{DEFAULT_SOAP_URL, DEFAULT_USER_AGENT, DashboardConfig};

pub const SOAP_NAMESPACE: &str = "Debbugs/SOAP";

/// Property names found in the value map of a `get_status` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueProperty {
    Affects,
    Archived,
    BlockedBy,
    Blocks,
    BugNum,
    Date,
    Done,
    Fixed,
    FixedDate,
    FixedVersions,
    Forwarded,
    Found,
    FoundDate,
    FoundVersions,
    Id,
    Keywords,
    LastModified,
    Location,
    LogModified,
    MergedWith,
    MsgId,
    Originator,
    Outlook,
    Owner,
    Package,
    Pending,
    Severity,
    Source,
    Subject,
    Summary,
    Tags,
    Unarchived,
}

impl IssueProperty {
    pub const ALL: [IssueProperty; 32] = [
        Self::Affects,
        Self::Archived,
        Self::BlockedBy,
        Self::Blocks,
        Self::BugNum,
        Self::Date,
        Self::Done,
        Self::Fixed,
        Self::FixedDate,
        Self::FixedVersions,
        Self::Forwarded,
        Self::Found,
        Self::FoundDate,
        Self::FoundVersions,
        Self::Id,
        Self::Keywords,
        Self::LastModified,
        Self::Location,
        Self::LogModified,
        Self::MergedWith,
        Self::MsgId,
        Self::Originator,
        Self::Outlook,
        Self::Owner,
        Self::Package,
        Self::Pending,
        Self::Severity,
        Self::Source,
        Self::Subject,
        Self::Summary,
        Self::Tags,
        Self::Unarchived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Affects => "affects",
            Self::Archived => "archived",
            Self::BlockedBy => "blockedby",
            Self::Blocks => "blocks",
            Self::BugNum => "bug_num",
            Self::Date => "date",
            Self::Done => "done",
            Self::Fixed => "fixed",
            Self::FixedDate => "fixed_date",
            Self::FixedVersions => "fixed_versions",
            Self::Forwarded => "forwarded",
            Self::Found => "found",
            Self::FoundDate => "found_date",
            Self::FoundVersions => "found_versions",
            Self::Id => "id",
            Self::Keywords => "keywords",
            Self::LastModified => "last_modified",
            Self::Location => "location",
            Self::LogModified => "log_modified",
            Self::MergedWith => "mergedwith",
            Self::MsgId => "msgid",
            Self::Originator => "originator",
            Self::Outlook => "outlook",
            Self::Owner => "owner",
            Self::Package => "package",
            Self::Pending => "pending",
            Self::Severity => "severity",
            Self::Source => "source",
            Self::Subject => "subject",
            Self::Summary => "summary",
            Self::Tags => "tags",
            Self::Unarchived => "unarchived",
        }
    }
}

pub type IssueProperties = BTreeMap<String, String>;

pub trait DebbugsApi {
    fn fetch_ids_of_open_issues(&mut self) -> Result<Vec<i64>>;
    fn fetch_issues(&mut self, issue_ids: &[i64]) -> Result<BTreeMap<i64, IssueProperties>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct DebbugsClientConfig {
    pub soap_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl DebbugsClientConfig {
    pub fn from_env() -> Self {
        Self::from_env_with_defaults(DEFAULT_SOAP_URL, DEFAULT_USER_AGENT)
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::from_env_with_defaults(&config.soap_url(), &config.user_agent())
    }

    fn from_env_with_defaults(soap_url_default: &str, user_agent_default: &str) -> Self {
        Self {
            soap_url: env_value("DEBBUGS_SOAP_URL", soap_url_default),
            user_agent: env_value("WNPP_USER_AGENT", user_agent_default),
            timeout_ms: env_value_u64("WNPP_HTTP_TIMEOUT_MS", 60_000),
            rate_limit_ms: env_value_u64("WNPP_RATE_LIMIT_MS", 300),
            max_retries: env_value_usize("WNPP_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("WNPP_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoapArg {
    Text(String),
    Int(i64),
}

impl SoapArg {
    fn xsd_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "xsd:string",
            Self::Int(_) => "xsd:int",
        }
    }

    fn render_value(&self) -> String {
        match self {
            Self::Text(value) => escape_xml(value),
            Self::Int(value) => value.to_string(),
        }
    }
}

pub struct SoapDebbugsClient {
    client: Client,
    config: DebbugsClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl SoapDebbugsClient {
    pub fn from_env() -> Result<Self> {
        Self::new(DebbugsClientConfig::from_env())
    }

    pub fn new(config: DebbugsClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Debbugs HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn call(&mut self, method: &str, args: &[SoapArg]) -> Result<String> {
        let envelope = build_envelope(method, args);
        let soap_action = format!("\"{SOAP_NAMESPACE}#{method}\"");

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .post(&self.config.soap_url)
                .header("User-Agent", self.config.user_agent.clone())
                .header(CONTENT_TYPE, "text/xml; charset=utf-8")
                .header("SOAPAction", soap_action.clone())
                .body(envelope.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .context("failed to read Debbugs SOAP response body")?;
                    if let Some(fault) = parse_fault(&body) {
                        bail!("Debbugs SOAP fault in {method}: {fault}");
                    }
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            tracing::warn!(%status, attempt, method, "retrying Debbugs request");
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("Debbugs SOAP request {method} failed with HTTP {status}");
                    }
                    return Ok(body);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        tracing::warn!(%error, attempt, method, "retrying Debbugs request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call Debbugs SOAP service");
                }
            }
        }

        bail!("Debbugs SOAP request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl DebbugsApi for SoapDebbugsClient {
    fn fetch_ids_of_open_issues(&mut self) -> Result<Vec<i64>> {
        let args = ["package", "wnpp", "status", "open"].map(|value| SoapArg::Text(value.to_string()));
        let body = self.call("get_bugs", &args)?;
        parse_bug_ids(&body)
    }

    fn fetch_issues(&mut self, issue_ids: &[i64]) -> Result<BTreeMap<i64, IssueProperties>> {
        if issue_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let args: Vec<SoapArg> = issue_ids.iter().copied().map(SoapArg::Int).collect();
        let body = self.call("get_status", &args)?;
        parse_status_map(&body)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Fetches `issue_ids` and renders their properties as indented JSON with sorted keys.
pub fn inspect_issues<A: DebbugsApi>(api: &mut A, issue_ids: &[i64]) -> Result<String> {
    let properties_of_issue = api.fetch_issues(issue_ids)?;
    serde_json::to_string_pretty(&properties_of_issue).context("failed to render issues as JSON")
}

pub fn build_envelope(method: &str, args: &[SoapArg]) -> String {
    let mut rendered_args = String::new();
    for (index, arg) in args.iter().enumerate() {
        rendered_args.push_str(&format!(
            "<arg{index} xsi:type=\"{}\">{}</arg{index}>",
            arg.xsd_type(),
            arg.render_value()
        ));
    }
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\"",
            " xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"",
            " xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\">",
            "<soap:Body><{method} xmlns=\"{namespace}\">{args}</{method}></soap:Body>",
            "</soap:Envelope>"
        ),
        method = method,
        namespace = SOAP_NAMESPACE,
        args = rendered_args,
    )
}

pub fn parse_bug_ids(xml: &str) -> Result<Vec<i64>> {
    let document =
        roxmltree::Document::parse(xml).context("failed to parse get_bugs response XML")?;
    let mut ids = Vec::new();
    for item in document
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "item")
    {
        let text = item.text().unwrap_or("").trim();
        let id = text
            .parse::<i64>()
            .with_context(|| format!("invalid issue id {text:?} in get_bugs response"))?;
        ids.push(id);
    }
    Ok(ids)
}

/// The top-level `item(key, value)` map of a `get_status` reply.
///
/// Properties without text are dropped. Nested maps and arrays such as
/// `found` or `fixed_versions` are not issue entries.
pub fn parse_status_map(xml: &str) -> Result<BTreeMap<i64, IssueProperties>> {
    let document =
        roxmltree::Document::parse(xml).context("failed to parse get_status response XML")?;
    let mut output = BTreeMap::new();

    for item in document
        .descendants()
        .filter(|node| is_element_named(*node, "item"))
        .filter(|node| {
            !node
                .ancestors()
                .skip(1)
                .any(|ancestor| is_element_named(ancestor, "item") || is_element_named(ancestor, "value"))
        })
    {
        let mut key = None;
        let mut value = None;
        for child in item.children().filter(|node| node.is_element()) {
            match child.tag_name().name() {
                "key" => key = Some(child),
                "value" => value = Some(child),
                _ => {}
            }
        }
        let (Some(key), Some(value)) = (key, value) else {
            continue;
        };

        let key_text = key.text().unwrap_or("").trim();
        let issue_id = key_text
            .parse::<i64>()
            .with_context(|| format!("invalid issue id {key_text:?} in get_status response"))?;

        let mut properties = IssueProperties::new();
        for property in value.children().filter(|node| node.is_element()) {
            if let Some(text) = property.text() {
                properties.insert(
                    property.tag_name().name().to_string(),
                    decode_base64_as_needed(text),
                );
            }
        }
        output.insert(issue_id, properties);
    }

    Ok(output)
}

// Subjects such as the one of #842114 arrive base64 encoded.
pub fn decode_base64_as_needed(candidate: &str) -> String {
    let compact: String = candidate
        .chars()
        .filter(|character| !character.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return candidate.to_string();
    }
    let Ok(bytes) = STANDARD.decode(compact.as_bytes()) else {
        return candidate.to_string();
    };
    match String::from_utf8(bytes) {
        Ok(decoded)
            if !decoded
                .chars()
                .any(|character| character.is_control() && !character.is_whitespace()) =>
        {
            decoded
        }
        _ => candidate.to_string(),
    }
}

fn is_element_named(node: roxmltree::Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn parse_fault(xml: &str) -> Option<String> {
    let document = roxmltree::Document::parse(xml).ok()?;
    let fault = document
        .descendants()
        .find(|node| node.is_element() && node.tag_name().name() == "Fault")?;
    let message = fault
        .descendants()
        .find(|node| node.is_element() && node.tag_name().name() == "faultstring")
        .and_then(|node| node.text())
        .unwrap_or("unknown fault");
    Some(message.trim().to_string())
}

fn escape_xml(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&apos;"),
            other => output.push(other),
        }
    }
    output
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}


#[cfg(test)]
mod tests {
    use super::*;

    const GET_BUGS_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soapenc="http://schemas.xmlsoap.org/soap/encoding/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsd="http://www.w3.org/2001/XMLSchema"><soap:Body><get_bugsResponse xmlns="Debbugs/SOAP"><soapenc:Array soapenc:arrayType="xsd:int[3]" xsi:type="soapenc:Array"><item xsi:type="xsd:int">123</item><item xsi:type="xsd:int">456</item><item xsi:type="xsd:int">789</item></soapenc:Array></get_bugsResponse></soap:Body></soap:Envelope>"#;

    const GET_STATUS_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:apachens="http://xml.apache.org/xml-soap" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema"><soap:Body><get_statusResponse xmlns="Debbugs/SOAP"><s-gensym3 xsi:type="apachens:Map"><item><key xsi:type="xsd:int">842114</key><value><subject xsi:type="xsd:base64Binary">SVRQOiBmb28gLS0gYmFyIOKAkyBiYXo=</subject><originator xsi:type="xsd:string">Jane Doe &lt;jane@example.org&gt;</originator><date xsi:type="xsd:int">1477000000</date><last_modified xsi:type="xsd:int">1600000000</last_modified><owner xsi:type="xsd:string"></owner><fixed_versions soapenc:arrayType="xsd:anyType[0]" xmlns:soapenc="http://schemas.xmlsoap.org/soap/encoding/"/><mergedwith xsi:type="xsd:string">842100</mergedwith></value></item><item><key xsi:type="xsd:int">900000</key><value><subject xsi:type="xsd:string">RFP: thing -- does things</subject></value></item></s-gensym3></get_statusResponse></soap:Body></soap:Envelope>"#;

    #[test]
    fn property_names_are_unique() {
        let names: std::collections::BTreeSet<&str> =
            IssueProperty::ALL.iter().map(|property| property.as_str()).collect();
        assert_eq!(names.len(), IssueProperty::ALL.len());
        assert!(names.contains("mergedwith"));
        assert!(names.contains("last_modified"));
    }

    #[test]
    fn envelope_carries_positional_arguments() {
        let envelope = build_envelope(
            "get_bugs",
            &[
                SoapArg::Text("package".to_string()),
                SoapArg::Text("wnpp".to_string()),
                SoapArg::Int(7),
            ],
        );
        assert!(envelope.contains("<get_bugs xmlns=\"Debbugs/SOAP\">"));
        assert!(envelope.contains("<arg0 xsi:type=\"xsd:string\">package</arg0>"));
        assert!(envelope.contains("<arg1 xsi:type=\"xsd:string\">wnpp</arg1>"));
        assert!(envelope.contains("<arg2 xsi:type=\"xsd:int\">7</arg2>"));
        roxmltree::Document::parse(&envelope).expect("well-formed envelope");
    }

    #[test]
    fn bug_ids_are_read_from_every_item() {
        assert_eq!(
            parse_bug_ids(GET_BUGS_RESPONSE).expect("parse"),
            vec![123, 456, 789]
        );
    }

    #[test]
    fn status_map_decodes_properties() {
        let issues = parse_status_map(GET_STATUS_RESPONSE).expect("parse");
        assert_eq!(issues.len(), 2);

        let first = &issues[&842114];
        assert_eq!(first["subject"], "ITP: foo -- bar \u{2013} baz");
        assert_eq!(first["originator"], "Jane Doe <jane@example.org>");
        assert_eq!(first["date"], "1477000000");
        assert_eq!(first["mergedwith"], "842100");
        assert!(!first.contains_key("owner"));
        assert!(!first.contains_key("fixed_versions"));

        assert_eq!(issues[&900000]["subject"], "RFP: thing -- does things");
    }

    #[test]
    fn nested_version_maps_are_not_issue_entries() {
        let body = r#"<?xml version="1.0"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><get_statusResponse xmlns="Debbugs/SOAP"><s-gensym3><item><key>777</key><value><subject>ITA: foo -- bar</subject><found><item><key>foo/1.2-3</key><value/></item></found><found_versions><item>foo/1.2-3</item></found_versions><package>wnpp</package></value></item><item><key>778</key><value><subject>O: baz -- qux</subject></value></item></s-gensym3></get_statusResponse></soap:Body></soap:Envelope>"#;

        let issues = parse_status_map(body).expect("parse");
        assert_eq!(issues.keys().copied().collect::<Vec<_>>(), vec![777, 778]);
        assert_eq!(issues[&777]["subject"], "ITA: foo -- bar");
        assert_eq!(issues[&777]["package"], "wnpp");
        assert!(!issues[&777].contains_key("found"));
    }

    #[test]
    fn base64_decoding_only_applies_to_valid_utf8_text() {
        assert_eq!(decode_base64_as_needed("aGVsbG8gd29ybGQ="), "hello world");
        assert_eq!(decode_base64_as_needed("aGVsbG8g\nd29ybGQ="), "hello world");
        assert_eq!(decode_base64_as_needed("842114"), "842114");
        assert_eq!(decode_base64_as_needed("RFP: foo -- bar"), "RFP: foo -- bar");
        assert_eq!(decode_base64_as_needed("/w=="), "/w==");
        assert_eq!(decode_base64_as_needed(""), "");
    }

    #[test]
    fn inspect_renders_sorted_json() {
        let mut api = test_support::MockDebbugs::default()
            .with_issue(20, &[("subject", "O: b -- c"), ("date", "2")])
            .with_issue(3, &[("subject", "RFA: a -- b")]);

        let rendered = inspect_issues(&mut api, &[20, 3]).expect("inspect");
        assert_eq!(
            rendered,
            "{\n  \"3\": {\n    \"subject\": \"RFA: a -- b\"\n  },\n  \"20\": {\n    \"date\": \"2\",\n    \"subject\": \"O: b -- c\"\n  }\n}"
        );
    }

    #[test]
    fn faults_are_detected() {
        let body = r#"<?xml version="1.0"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Client</faultcode><faultstring>Bad method</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;
        assert_eq!(parse_fault(body).as_deref(), Some("Bad method"));
        assert_eq!(parse_fault(GET_BUGS_RESPONSE), None);
    }
}
