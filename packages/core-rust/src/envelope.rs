//! Inbound bus messages and their header conventions.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Reply content types set in the `Content-type` header.
pub mod content_type {
    pub const HEADER: &str = "Content-type";
    pub const OCTET_STREAM: &str = "application/octet-stream";
    pub const TEXT: &str = "text/plain";
    pub const JSON: &str = "application/json";
}

/// Header names carrying log-correlation metadata.
pub mod correlation_header {
    pub const INTEGRATION_NAME: &str = "Weikio-Integration-Name";
    pub const AGENT: &str = "Weikio-Agent";
    pub const ENVIRONMENT: &str = "Weikio-Environment";
    pub const CORRELATION_ID: &str = "Weikio-CorrId";
}

/// Header names of the bus's standard error-reply convention.
pub mod error_header {
    pub const DESCRIPTION: &str = "Nats-Service-Error";
    pub const CODE: &str = "Nats-Service-Error-Code";
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Message headers, one value per name, iterated in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style `insert`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One inbound bus message as delivered to a dispatcher.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Subject the message was published to.
    pub subject: String,
    /// Subject the sender awaits a response on, if it sent a request.
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Envelope {
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Correlation metadata carried by this message's headers.
    #[must_use]
    pub fn correlation(&self) -> Correlation {
        Correlation::from_headers(&self.headers)
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// The four correlation values used to scope log enrichment and forwarding.
///
/// Each value is independently optional: a message may carry any subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub integration_name: Option<String>,
    pub agent: Option<String>,
    pub environment: Option<String>,
    pub correlation_id: Option<String>,
}

impl Correlation {
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Self {
        let get = |name| headers.get(name).map(str::to_owned);
        Self {
            integration_name: get(correlation_header::INTEGRATION_NAME),
            agent: get(correlation_header::AGENT),
            environment: get(correlation_header::ENVIRONMENT),
            correlation_id: get(correlation_header::CORRELATION_ID),
        }
    }

    /// True when all four values are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.integration_name.is_some()
            && self.agent.is_some()
            && self.environment.is_some()
            && self.correlation_id.is_some()
    }

    /// True when no value is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.integration_name.is_none()
            && self.agent.is_none()
            && self.environment.is_none()
            && self.correlation_id.is_none()
    }

    /// Writes the present values back as headers, e.g. to propagate them on
    /// an outbound request.
    pub fn apply_to(&self, headers: &mut Headers) {
        let pairs = [
            (correlation_header::INTEGRATION_NAME, &self.integration_name),
            (correlation_header::AGENT, &self.agent),
            (correlation_header::ENVIRONMENT, &self.environment),
            (correlation_header::CORRELATION_ID, &self.correlation_id),
        ];
        for (name, value) in pairs {
            if let Some(value) = value {
                headers.insert(name, value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_headers() -> Headers {
        Headers::new()
            .with(correlation_header::INTEGRATION_NAME, "orders")
            .with(correlation_header::AGENT, "agent-7")
            .with(correlation_header::ENVIRONMENT, "prod")
            .with(correlation_header::CORRELATION_ID, "c-1")
    }

    #[test]
    fn headers_replace_on_insert() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("a", "2");
        assert_eq!(headers.get("a"), Some("2"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn headers_iterate_in_name_order() {
        let headers: Headers = [("b", "2"), ("a", "1")].into_iter().collect();
        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn correlation_read_from_wire_header_names() {
        let headers = Headers::new()
            .with("Weikio-Integration-Name", "orders")
            .with("Weikio-Agent", "agent-7")
            .with("Weikio-Environment", "prod")
            .with("Weikio-CorrId", "c-1");
        let corr = Correlation::from_headers(&headers);
        assert!(corr.is_complete());
        assert_eq!(corr, Correlation::from_headers(&full_headers()));
    }

    #[test]
    fn correlation_complete_when_all_four_present() {
        let corr = Correlation::from_headers(&full_headers());
        assert!(corr.is_complete());
        assert_eq!(corr.integration_name.as_deref(), Some("orders"));
        assert_eq!(corr.correlation_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn correlation_incomplete_when_one_missing() {
        let mut headers = full_headers();
        headers = headers
            .iter()
            .filter(|(k, _)| *k != correlation_header::AGENT)
            .collect();
        let corr = Correlation::from_headers(&headers);
        assert!(!corr.is_complete());
        assert!(!corr.is_empty());
    }

    #[test]
    fn correlation_empty_without_headers() {
        let env = Envelope::new("external.svc.op", "x");
        assert!(env.correlation().is_empty());
    }

    #[test]
    fn apply_to_round_trips_present_values() {
        let corr = Correlation::from_headers(&full_headers());
        let mut headers = Headers::new();
        corr.apply_to(&mut headers);
        assert_eq!(headers, full_headers());
    }
}
