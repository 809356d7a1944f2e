//! Per-invocation context handed to operation handlers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::{content_type, error_header, Correlation, Envelope, Headers};
use crate::error::BusError;
use crate::traits::BusConnection;

/// Default code used by `reply_error_default`.
pub const DEFAULT_ERROR_CODE: u16 = 400;

/// Wraps one inbound message for the duration of a handler invocation.
///
/// Carries the payload and headers, the shared connection used for replies,
/// and the invocation's log span. The span holds the message's correlation
/// values; the dispatcher runs the handler inside it, and handlers can pass
/// it on to work they spawn.
///
/// Exactly one reply is expected per invocation but not enforced: no reply
/// leaves the sender to time out, several replies publish several responses.
#[derive(Clone)]
pub struct OperationContext {
    envelope: Envelope,
    connection: Arc<dyn BusConnection>,
    span: tracing::Span,
    service: Arc<str>,
    operation: Arc<str>,
}

impl OperationContext {
    #[must_use]
    pub fn new(
        envelope: Envelope,
        connection: Arc<dyn BusConnection>,
        span: tracing::Span,
        service: Arc<str>,
        operation: Arc<str>,
    ) -> Self {
        Self {
            envelope,
            connection,
            span,
            service,
            operation,
        }
    }

    // -- inbound message --------------------------------------------------

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.envelope.payload
    }

    /// Payload decoded as UTF-8; invalid sequences are replaced.
    #[must_use]
    pub fn payload_as_str(&self) -> String {
        String::from_utf8_lossy(&self.envelope.payload).into_owned()
    }

    /// Payload decoded as JSON. An empty or whitespace-only payload yields
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the decoder error when the payload is not valid JSON for `T`.
    pub fn payload_as_json<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        let text = self.payload_as_str();
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text).map(Some)
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.envelope.headers
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.envelope.subject
    }

    #[must_use]
    pub fn correlation(&self) -> Correlation {
        self.envelope.correlation()
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Log span of this invocation, carrying the correlation values.
    #[must_use]
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    // -- replies ----------------------------------------------------------

    /// Reply with raw bytes (`application/octet-stream`).
    ///
    /// # Errors
    ///
    /// Fails when the message has no reply subject or the publish fails.
    pub async fn reply_bytes(&self, response: impl Into<Bytes>) -> Result<(), BusError> {
        self.respond(content_type::OCTET_STREAM, response.into()).await
    }

    /// Reply with text (`text/plain`).
    ///
    /// # Errors
    ///
    /// Fails when the message has no reply subject or the publish fails.
    pub async fn reply_text(&self, response: impl Into<String>) -> Result<(), BusError> {
        self.respond(content_type::TEXT, Bytes::from(response.into())).await
    }

    /// Reply with `response` serialized as indented JSON (`application/json`).
    ///
    /// # Errors
    ///
    /// Fails when serialization fails, the message has no reply subject, or
    /// the publish fails.
    pub async fn reply_json<T: Serialize + ?Sized>(&self, response: &T) -> Result<(), BusError> {
        let json = serde_json::to_string_pretty(response)?;
        self.respond(content_type::JSON, Bytes::from(json)).await
    }

    /// Reply using the bus's standard error convention.
    ///
    /// # Errors
    ///
    /// Fails when the message has no reply subject or the publish fails.
    pub async fn reply_error(&self, text: &str, code: u16) -> Result<(), BusError> {
        let reply = self.reply_subject()?;
        let headers = Headers::new()
            .with(error_header::DESCRIPTION, text)
            .with(error_header::CODE, code.to_string());
        self.connection.publish(reply, headers, Bytes::new()).await
    }

    /// `reply_error` with code 400.
    ///
    /// # Errors
    ///
    /// Fails when the message has no reply subject or the publish fails.
    pub async fn reply_error_default(&self, text: &str) -> Result<(), BusError> {
        self.reply_error(text, DEFAULT_ERROR_CODE).await
    }

    async fn respond(&self, kind: &str, payload: Bytes) -> Result<(), BusError> {
        let reply = self.reply_subject()?;
        let headers = Headers::new().with(content_type::HEADER, kind);
        self.connection.publish(reply, headers, payload).await
    }

    fn reply_subject(&self) -> Result<&str, BusError> {
        self.envelope
            .reply
            .as_deref()
            .ok_or_else(|| BusError::NoReplySubject {
                subject: self.envelope.subject.clone(),
            })
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("service", &self.service)
            .field("operation", &self.operation)
            .field("subject", &self.envelope.subject)
            .field("reply", &self.envelope.reply)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::service::ServiceDescriptor;
    use crate::traits::ServiceAdvertisement;

    /// Records every publish.
    #[derive(Default)]
    struct RecordingConnection {
        published: Mutex<Vec<(String, Headers, Bytes)>>,
    }

    #[async_trait]
    impl BusConnection for RecordingConnection {
        async fn publish(
            &self,
            subject: &str,
            headers: Headers,
            payload: Bytes,
        ) -> Result<(), BusError> {
            self.published
                .lock()
                .push((subject.to_string(), headers, payload));
            Ok(())
        }

        async fn advertise(
            &self,
            _service: &ServiceDescriptor,
        ) -> Result<Box<dyn ServiceAdvertisement>, BusError> {
            Err(BusError::Service("not supported".to_string()))
        }

        async fn close(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn make_ctx(
        payload: &'static str,
        reply: Option<&str>,
    ) -> (OperationContext, Arc<RecordingConnection>) {
        let conn = Arc::new(RecordingConnection::default());
        let mut envelope = Envelope::new("external.svc.op", payload);
        envelope.reply = reply.map(str::to_owned);
        let ctx = OperationContext::new(
            envelope,
            conn.clone(),
            tracing::Span::none(),
            Arc::from("svc"),
            Arc::from("op"),
        );
        (ctx, conn)
    }

    #[test]
    fn payload_as_str_decodes_utf8() {
        let (ctx, _) = make_ctx("World", None);
        assert_eq!(ctx.payload_as_str(), "World");
        assert_eq!(ctx.subject(), "external.svc.op");
        assert_eq!(ctx.operation_name(), "op");
    }

    #[test]
    fn payload_as_json_empty_is_none() {
        let (ctx, _) = make_ctx("  ", None);
        let value: Option<HashMap<String, u32>> = ctx.payload_as_json().unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn payload_as_json_decodes() {
        let (ctx, _) = make_ctx(r#"{"a": 1}"#, None);
        let value: HashMap<String, u32> = ctx.payload_as_json().unwrap().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn reply_text_sets_content_type() {
        let (ctx, conn) = make_ctx("World", Some("_INBOX.1"));
        ctx.reply_text("Hello there World").await.unwrap();

        let published = conn.published.lock();
        let (subject, headers, payload) = &published[0];
        assert_eq!(subject, "_INBOX.1");
        assert_eq!(headers.get(content_type::HEADER), Some(content_type::TEXT));
        assert_eq!(&payload[..], b"Hello there World");
    }

    #[tokio::test]
    async fn reply_bytes_and_json_content_types() {
        let (ctx, conn) = make_ctx("", Some("_INBOX.2"));
        ctx.reply_bytes(vec![1u8, 2, 3]).await.unwrap();

        #[derive(Serialize)]
        struct Out {
            zeta: u8,
            alpha: u8,
        }
        ctx.reply_json(&Out { zeta: 1, alpha: 2 }).await.unwrap();

        let published = conn.published.lock();
        assert_eq!(
            published[0].1.get(content_type::HEADER),
            Some(content_type::OCTET_STREAM)
        );
        assert_eq!(published[1].1.get(content_type::HEADER), Some(content_type::JSON));
        let text = std::str::from_utf8(&published[1].2).unwrap();
        // Field order follows the struct declaration and output is indented.
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap());
        assert!(text.contains('\n'));
    }

    #[tokio::test]
    async fn reply_error_uses_standard_headers() {
        let (ctx, conn) = make_ctx("", Some("_INBOX.3"));
        ctx.reply_error("nope", 503).await.unwrap();
        ctx.reply_error_default("bad input").await.unwrap();

        let published = conn.published.lock();
        assert_eq!(published[0].1.get(error_header::DESCRIPTION), Some("nope"));
        assert_eq!(published[0].1.get(error_header::CODE), Some("503"));
        assert!(published[0].2.is_empty());
        assert_eq!(published[1].1.get(error_header::CODE), Some("400"));
    }

    #[tokio::test]
    async fn reply_without_reply_subject_fails() {
        let (ctx, conn) = make_ctx("x", None);
        let err = ctx.reply_text("ignored").await.unwrap_err();
        assert!(matches!(err, BusError::NoReplySubject { .. }));
        assert!(conn.published.lock().is_empty());
    }
}
