//! Integration tests for the dead-letter and event inspection endpoints.

use axum::http::StatusCode;
use hookline_core::{DeadLetterId, DeadLetterStatus, EventId, IdempotencyStatus};
use hookline_delivery::DispatchOutcome;
use hookline_testing::{fixtures, TestEnv};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

/// Ingests one event to a destination that always fails and dispatches it
/// into the dead-letter queue.
async fn dead_lettered(env: &TestEnv, server: &MockServer, key: &str) -> (EventId, String) {
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/failing"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;

    let response = env
        .send(env.signed_request(
            key,
            &format!("{}/failing", server.uri()),
            &fixtures::order_created(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::ACCEPTED);
    let event_id: EventId =
        serde_json::from_value(response.body["data"]["event_id"].clone()).unwrap();

    let outcome = env.dispatch_next().await.unwrap().unwrap();
    let DispatchOutcome::DeadLettered(entry_id) = outcome else {
        panic!("expected dead-lettered outcome, got {outcome:?}");
    };

    (event_id, entry_id.to_string())
}

#[tokio::test]
async fn dead_lettered_event_is_listed_and_inspectable() {
    let env = TestEnv::new().unwrap();
    let server = env.destination().await;
    let (event_id, entry_id) = dead_lettered(&env, &server, "fails").await;

    let listed = env.call("GET", "/admin/dlq").await.unwrap();
    assert_eq!(listed.status, StatusCode::OK);
    assert_eq!(listed.body["success"], true);
    let entries = listed.body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], entry_id.as_str());
    assert_eq!(entries[0]["status"], "PENDING");
    assert_eq!(entries[0]["retry_count"], 0);
    assert_eq!(entries[0]["error_details"]["flag"], "FAILURE");

    let detail = env.call("GET", &format!("/admin/events/{event_id}")).await.unwrap();
    assert_eq!(detail.status, StatusCode::OK);
    let data = &detail.body["data"];
    assert_eq!(data["event"]["status"], "FAILED");
    assert_eq!(data["dead_letter"]["id"], entry_id.as_str());
    let attempts = data["attempts"].as_array().unwrap();
    let numbers: Vec<i64> = attempts.iter().map(|a| a["attempt_number"].as_i64().unwrap()).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);

    let key = env.storage.idempotency_keys.find("fails".into()).await.unwrap().unwrap();
    assert_eq!(key.status, IdempotencyStatus::Failed);
    assert_eq!(key.response_status, Some(400));
}

#[tokio::test]
async fn retry_to_new_destination_resolves_entry() {
    let env = TestEnv::new().unwrap();
    let server = env.destination().await;
    let (_, entry_id) = dead_lettered(&env, &server, "redirect").await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let response = env
        .call_json(
            "POST",
            &format!("/admin/dlq/{entry_id}/retry"),
            &json!({"destination_url": format!("{}/healthy", server.uri())}),
        )
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["success"], true);
    assert_eq!(response.body["data"]["entry"]["status"], "RESOLVED");
    assert!(response.body["data"].get("error").is_none());

    let again = env.call("POST", &format!("/admin/dlq/{entry_id}/retry")).await.unwrap();
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.body["error"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn failed_retry_counts_up_and_stays_pending() {
    let env = TestEnv::new().unwrap();
    let server = env.destination().await;
    let (_, entry_id) = dead_lettered(&env, &server, "still-failing").await;

    let response = env.call("POST", &format!("/admin/dlq/{entry_id}/retry")).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    let data = &response.body["data"];
    assert_eq!(data["success"], false);
    assert_eq!(data["error"], "HTTP 500");
    assert_eq!(data["entry"]["retry_count"], 1);
    assert_eq!(data["entry"]["status"], "PENDING");
}

#[tokio::test]
async fn retry_override_must_be_a_valid_destination() {
    let env = TestEnv::new().unwrap();
    let server = env.destination().await;
    let (_, entry_id) = dead_lettered(&env, &server, "bad-override").await;

    let response = env
        .call_json(
            "POST",
            &format!("/admin/dlq/{entry_id}/retry"),
            &json!({"destination_url": "not a url"}),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"]["code"], "INVALID_DESTINATION");

    let id = DeadLetterId(Uuid::parse_str(&entry_id).unwrap());
    let entry = env.storage.dead_letters.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Pending);
    assert_eq!(entry.retry_count, 0);
}

#[tokio::test]
async fn resolve_and_abandon_close_entries() {
    let env = TestEnv::new().unwrap();
    let server = env.destination().await;
    let (_, first) = dead_lettered(&env, &server, "first").await;
    let (_, second) = dead_lettered(&env, &server, "second").await;

    let resolved = env.call("POST", &format!("/admin/dlq/{first}/resolve")).await.unwrap();
    assert_eq!(resolved.status, StatusCode::OK);
    assert_eq!(resolved.body["data"]["status"], "RESOLVED");

    let abandoned = env.call("POST", &format!("/admin/dlq/{second}/abandon")).await.unwrap();
    assert_eq!(abandoned.status, StatusCode::OK);
    assert_eq!(abandoned.body["data"]["status"], "ABANDONED");
    assert!(abandoned.body["data"]["resolved_at"].is_string());

    let listed = env.call("GET", "/admin/dlq").await.unwrap();
    assert_eq!(listed.body["data"], json!([]));
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let env = TestEnv::new().unwrap();
    let unknown = Uuid::new_v4();

    for action in ["resolve", "abandon", "retry"] {
        let response = env.call("POST", &format!("/admin/dlq/{unknown}/{action}")).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND, "{action}");
        assert_eq!(response.body["error"]["code"], "NOT_FOUND");
    }

    let missing_event = env.call("GET", &format!("/admin/events/{unknown}")).await.unwrap();
    assert_eq!(missing_event.status, StatusCode::NOT_FOUND);

    let malformed = env.call("GET", "/admin/events/evt_123").await.unwrap();
    assert_eq!(malformed.status, StatusCode::BAD_REQUEST);
    insta::assert_json_snapshot!(malformed.body, @r#"
    {
      "data": null,
      "error": {
        "code": "VALIDATION_ERROR",
        "message": "invalid id: evt_123"
      },
      "success": false
    }
    "#);
}

#[tokio::test]
async fn events_are_paginated_newest_first() {
    let env = TestEnv::new().unwrap();
    let mut ids = Vec::new();
    for n in 0..3 {
        let response = env
            .send(env.signed_request(
                &format!("page-{n}"),
                "https://example.com/h",
                &fixtures::order_created(n),
            ))
            .await
            .unwrap();
        ids.push(response.body["data"]["event_id"].clone());
        env.clock.advance(std::time::Duration::from_secs(1));
    }

    let page = env.call("GET", "/admin/events?limit=2").await.unwrap();
    assert_eq!(page.status, StatusCode::OK);
    assert_eq!(page.body["data"]["limit"], 2);
    assert_eq!(page.body["data"]["offset"], 0);
    let listed: Vec<Value> =
        page.body["data"]["events"].as_array().unwrap().iter().map(|e| e["id"].clone()).collect();
    assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);

    let rest = env.call("GET", "/admin/events?limit=2&offset=2").await.unwrap();
    let rest_ids: Vec<Value> =
        rest.body["data"]["events"].as_array().unwrap().iter().map(|e| e["id"].clone()).collect();
    assert_eq!(rest_ids, vec![ids[0].clone()]);

    let capped = env.call("GET", "/admin/events?limit=9999").await.unwrap();
    assert_eq!(capped.body["data"]["limit"], 500);
}

#[tokio::test]
async fn invalid_pagination_is_rejected() {
    let env = TestEnv::new().unwrap();

    let zero = env.call("GET", "/admin/events?limit=0").await.unwrap();
    assert_eq!(zero.status, StatusCode::BAD_REQUEST);
    assert_eq!(zero.body["error"]["code"], "VALIDATION_ERROR");

    let text = env.call("GET", "/admin/events?limit=lots").await.unwrap();
    assert_eq!(text.status, StatusCode::BAD_REQUEST);
    assert_eq!(text.body["error"]["code"], "VALIDATION_ERROR");
}
