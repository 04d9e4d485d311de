//! Request builders and payload fixtures.

use axum::{body::Body, http::Request};
use bytes::Bytes;
use hookline_api::{
    crypto::{self, SIGNATURE_HEADER},
    handlers::ingest::{DESTINATION_HEADER, IDEMPOTENCY_KEY_HEADER},
};
use serde_json::{json, Value};
use uuid::Uuid;

/// A typical provider payload that is already enveloped.
pub fn invoice_paid(amount: i64) -> Value {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "invoice.paid",
        "created": 1_700_000_000,
        "source": "billing",
        "data": {"object": {"amount": amount, "currency": "usd"}}
    })
}

/// A bare payload that ingress has to wrap.
pub fn order_created(order_id: u64) -> Value {
    json!({"order_id": order_id, "items": 3})
}

/// How the signature header is produced.
#[derive(Debug, Clone)]
enum Signature {
    Valid,
    Missing,
    Raw(String),
}

/// Builder for `POST /webhooks` requests.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    key: Option<String>,
    destination: Option<String>,
    body: Bytes,
    signature: Signature,
}

impl WebhookRequest {
    /// Request carrying `body` as compact JSON, a random key and a local
    /// destination.
    pub fn new(body: &Value) -> Self {
        Self {
            key: Some(Uuid::new_v4().to_string()),
            destination: Some("http://127.0.0.1:9/hook".to_string()),
            body: Bytes::from(body.to_string()),
            signature: Signature::Valid,
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Omits the idempotency key header.
    #[must_use]
    pub fn without_key(mut self) -> Self {
        self.key = None;
        self
    }

    /// Sets the destination header.
    #[must_use]
    pub fn destination(mut self, url: impl Into<String>) -> Self {
        self.destination = Some(url.into());
        self
    }

    /// Omits the destination header.
    #[must_use]
    pub fn without_destination(mut self) -> Self {
        self.destination = None;
        self
    }

    /// Sends these exact bytes instead of the JSON body.
    #[must_use]
    pub fn raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Omits the signature header.
    #[must_use]
    pub fn without_signature(mut self) -> Self {
        self.signature = Signature::Missing;
        self
    }

    /// Sends this signature header value verbatim.
    #[must_use]
    pub fn signature(mut self, value: impl Into<String>) -> Self {
        self.signature = Signature::Raw(value.into());
        self
    }

    /// Builds the request, signing the body with `secret` unless told
    /// otherwise.
    pub fn build(self, secret: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header("content-type", "application/json");

        match self.signature {
            Signature::Valid => {
                let signature = crypto::sign(secret.as_bytes(), &self.body)
                    .expect("HMAC accepts any key length");
                builder = builder.header(SIGNATURE_HEADER, signature);
            },
            Signature::Raw(value) => builder = builder.header(SIGNATURE_HEADER, value),
            Signature::Missing => {},
        }
        if let Some(key) = self.key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if let Some(destination) = self.destination {
            builder = builder.header(DESTINATION_HEADER, destination);
        }

        builder.body(Body::from(self.body)).expect("valid webhook request")
    }
}
