use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jiff::civil::Date;
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://www.prairielearn.org/pl/api/v1";

/// One entry of an assessment instance log. The API returns more fields than
/// this; we only ever look at the creation date and the submission link.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub event_date: String,
    #[serde(default)]
    pub submission_id: Option<i64>,
}

impl Event {
    /// Day-granularity date of this event. `event_date` is an ISO-8601
    /// timestamp; only the leading `YYYY-MM-DD` matters here.
    pub fn date(&self) -> Result<Date> {
        let prefix = self
            .event_date
            .get(0..10)
            .with_context(|| format!("event date too short: {:?}", self.event_date))?;
        Date::strptime("%Y-%m-%d", prefix)
            .with_context(|| format!("unparseable event date {:?}", self.event_date))
    }
}

pub fn parse_events(body: &str) -> Result<Vec<Event>> {
    serde_json::from_str(body).context("log body is not a JSON event array")
}

/// Anything that can resolve a record identifier to its raw log body. The
/// production implementation is [`Api`]; tests substitute synthetic data.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Raw JSON body for one assessment instance log. Missing identifiers
    /// yield an empty array, not an error.
    async fn get_log(&self, id: u64) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct Api {
    http: reqwest::Client,
    base_url: String,
    course_instance: u64,
    token: String,
}

impl Api {
    pub fn new(base_url: impl Into<String>, course_instance: u64, token: impl Into<String>) -> Self {
        Api {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            course_instance,
            token: token.into(),
        }
    }

    /// Full URL for an endpoint under this course instance, token included.
    pub fn url(&self, tail: &str) -> String {
        format!(
            "{}/course_instances/{}{}?private_token={}",
            self.base_url, self.course_instance, tail, self.token
        )
    }

    pub fn log_url(&self, id: u64) -> String {
        self.url(&format!("/assessment_instances/{}/log", id))
    }

    pub async fn get_raw(&self, tail: &str) -> Result<String> {
        let url = self.url(tail);
        let resp = self.http.get(&url).send().await.context("request failed")?;
        let status = resp.status();
        let body = resp.text().await.context("failed reading response body")?;
        if !status.is_success() {
            bail!("GET .../course_instances/{}{} returned {}", self.course_instance, tail, status);
        }
        Ok(body)
    }

    /// Probe used by the preflight pass: fetch the log of identifier 1 and
    /// map the platform's error bodies to a specific diagnosis.
    pub async fn check_reachable(&self) -> Result<()> {
        let url = self.log_url(1);
        let resp = self.http.get(&url).send().await.context("API unreachable")?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if body.contains("The provided authentication token was invalid") {
            bail!("invalid api token");
        } else if body.contains("Forbidden") {
            bail!("invalid course instance (access forbidden)");
        }
        bail!("API probe failed with status {}", status);
    }
}

#[async_trait]
impl LogSource for Api {
    async fn get_log(&self, id: u64) -> Result<String> {
        self.get_raw(&format!("/assessment_instances/{}/log", id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_date_takes_iso_prefix() {
        let e = Event {
            event_date: "2023-02-14T08:30:00.000Z".to_string(),
            submission_id: None,
        };
        assert_eq!(e.date().unwrap(), jiff::civil::date(2023, 2, 14));
    }

    #[test]
    fn events_parse_with_extra_fields() {
        let body = r#"[{"event_date":"2023-02-14T08:30:00Z","event_name":"New variant","submission_id":null},
                       {"event_date":"2023-02-14T08:31:00Z","submission_id":991}]"#;
        let events = parse_events(body).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].submission_id, None);
        assert_eq!(events[1].submission_id, Some(991));
    }

    #[test]
    fn empty_body_means_no_data() {
        assert!(parse_events("[]").unwrap().is_empty());
    }

    #[test]
    fn url_carries_token() {
        let api = Api::new("https://example.test/api/v1", 7, "sekrit");
        assert_eq!(
            api.log_url(42),
            "https://example.test/api/v1/course_instances/7/assessment_instances/42/log?private_token=sekrit"
        );
    }
}
