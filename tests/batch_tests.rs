//! Batch orchestration against a mock portal.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitrix24_rs::{ClientConfig, Command, Error};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use common::*;

fn deal_commands(count: usize) -> Vec<Command> {
    (0..count)
        .map(|i| Command::new(format!("c{}", i), "crm.deal.get", json!({"id": i})))
        .collect()
}

/// Echo every command back as `{"echo": "<method?query>"}`, newest key first.
fn echo_reversed(request: &Request) -> ResponseTemplate {
    let results: Vec<(String, Value)> = batch_commands(request)
        .into_iter()
        .rev()
        .map(|(key, command)| (key, json!({ "echo": command })))
        .collect();
    batch_response(&results, &[])
}

#[tokio::test]
async fn test_137_commands_use_three_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(echo_reversed)
        .expect(3)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let results = client.batch().execute(deal_commands(137), false).await.unwrap();

    assert_eq!(results.len(), 137);
    assert_eq!(results.success_count(), 137);
    for i in 0..137 {
        let response = results
            .get(format!("c{}", i))
            .and_then(|r| r.response())
            .unwrap();
        assert_eq!(response.result["echo"], format!("crm.deal.get?id={}", i));
    }

    let keys: Vec<String> = results.keys().map(|k| k.to_string()).collect();
    let expected: Vec<String> = (0..137).map(|i| format!("c{}", i)).collect();
    assert_eq!(keys, expected);

    let requests = server.received_requests().await.unwrap();
    let sizes: Vec<usize> = requests.iter().map(|r| batch_commands(r).len()).collect();
    assert_eq!(sizes, vec![50, 50, 37]);
    assert!(requests.iter().all(|r| batch_halt(r) == 0));

    let first_chunk: Vec<String> = batch_commands(&requests[0])
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    let expected_first: Vec<String> = (0..50).map(|i| format!("c{}", i)).collect();
    assert_eq!(first_chunk, expected_first);
}

#[tokio::test]
async fn test_commands_are_sent_in_caller_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(echo_reversed)
        .expect(1)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let commands = vec![
        Command::new("zeta", "user.current", Value::Null),
        Command::new("alpha", "crm.deal.get", json!({"id": 1})),
        Command::new("mid", "crm.deal.get", json!({"id": 2})),
    ];
    client.batch().execute(commands, true).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let zeta = body.find("\"zeta\"").unwrap();
    let alpha = body.find("\"alpha\"").unwrap();
    let mid = body.find("\"mid\"").unwrap();
    assert!(zeta < alpha && alpha < mid);
    assert_eq!(batch_halt(&requests[0]), 1);
}

#[tokio::test]
async fn test_failed_command_does_not_stop_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(|request: &Request| {
            let mut results = Vec::new();
            let mut errors = Vec::new();
            for (key, command) in batch_commands(request) {
                if key == "c3" {
                    errors.push((
                        key,
                        json!({"error": "NOT_FOUND", "error_description": "Not found"}),
                    ));
                } else {
                    results.push((key, json!({ "echo": command })));
                }
            }
            batch_response(&results, &errors)
        })
        .expect(2)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let results = client.batch().execute(deal_commands(60), false).await.unwrap();

    assert_eq!(results.len(), 60);
    assert_eq!(results.success_count(), 59);

    let failures: Vec<_> = results.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.as_str(), "c3");
    match failures[0].1 {
        Error::RemoteApi { code, description, .. } => {
            assert_eq!(code.as_str(), "NOT_FOUND");
            assert_eq!(description, "Not found");
        }
        other => panic!("Expected RemoteApi, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_command_result_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(|request: &Request| {
            let results: Vec<(String, Value)> = batch_commands(request)
                .into_iter()
                .filter(|(key, _)| key != "c4")
                .map(|(key, command)| (key, json!({ "echo": command })))
                .collect();
            batch_response(&results, &[])
        })
        .expect(1)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let results = client.batch().execute(deal_commands(10), false).await.unwrap();

    assert_eq!(results.len(), 10);
    assert_eq!(results.success_count(), 9);
    let failures: Vec<_> = results.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.as_str(), "c4");
    assert!(matches!(failures[0].1, Error::InvalidResponse(_)));
}

#[tokio::test]
async fn test_halt_stops_at_first_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(|request: &Request| {
            // the portal stops executing at the failing command
            let mut results = Vec::new();
            let mut errors = Vec::new();
            for (key, command) in batch_commands(request) {
                if key == "c10" {
                    errors.push((key, json!({"error": "ACCESS_DENIED", "error_description": ""})));
                    break;
                }
                results.push((key, json!({ "echo": command })));
            }
            batch_response(&results, &errors)
        })
        .expect(1)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let results = client.batch().execute(deal_commands(120), true).await.unwrap();

    assert_eq!(results.len(), 11);
    assert_eq!(results.success_count(), 10);
    assert!(results.get("c10").unwrap().error().is_some());
    assert!(!results.contains("c11"));
    assert!(!results.contains("c60"));
}

#[tokio::test]
async fn test_chunk_failure_marks_all_its_commands() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(move |request: &Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return ResponseTemplate::new(500).set_body_json(json!({
                    "error": "INTERNAL_SERVER_ERROR",
                    "error_description": "Internal server error"
                }));
            }
            echo_reversed(request)
        })
        .expect(3)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let results = client.batch().execute(deal_commands(137), false).await.unwrap();

    assert_eq!(results.len(), 137);
    assert_eq!(results.success_count(), 87);
    for i in 50..100 {
        let error = results.get(format!("c{}", i)).unwrap().error().unwrap();
        assert!(error.is_server_error());
    }
    assert!(results.get("c100").unwrap().is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_array_shaped_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "result": [{"ID": "10"}, {"ID": "11"}],
                    "result_error": [],
                    "result_total": [],
                    "result_next": [],
                    "result_time": []
                }
            })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let results = client
        .batch()
        .add_entity_items(
            "crm.contact.add",
            vec![json!({"NAME": "Ann"}), json!({"NAME": "Bob"})],
        )
        .await
        .unwrap();

    assert_eq!(results.get(0usize).unwrap().response().unwrap().result["ID"], "10");
    assert_eq!(results.get(1usize).unwrap().response().unwrap().result["ID"], "11");

    let requests = server.received_requests().await.unwrap();
    let commands = batch_commands(&requests[0]);
    let params = command_params(&commands[0].1);
    assert!(params.contains(&("fields[NAME]".to_string(), "Ann".to_string())));
}

#[tokio::test]
async fn test_entity_helpers_key_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(|request: &Request| {
            let results: Vec<(String, Value)> = batch_commands(request)
                .into_iter()
                .map(|(key, _)| (key, json!(true)))
                .collect();
            batch_response(&results, &[])
        })
        .expect(2)
        .mount(&server)
        .await;

    let client = webhook_client(&server);
    let updated = client
        .batch()
        .update_entity_items("crm.deal.update", vec![(7, json!({"TITLE": "A"}))])
        .await
        .unwrap();
    assert!(updated.get("7").unwrap().is_success());

    let deleted = client
        .batch()
        .delete_entity_items("crm.deal.delete", vec![7, 8])
        .await
        .unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.get("8").unwrap().is_success());

    let requests = server.received_requests().await.unwrap();
    let update = batch_commands(&requests[0]);
    let params = command_params(&update[0].1);
    assert!(params.contains(&("id".to_string(), "7".to_string())));
    assert!(params.contains(&("fields[TITLE]".to_string(), "A".to_string())));
}

#[tokio::test]
async fn test_invalid_commands_send_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = webhook_client(&server);

    let mut duplicate = deal_commands(3);
    duplicate.push(Command::new("c1", "crm.deal.get", json!({"id": 9})));
    assert!(matches!(
        client.batch().execute(duplicate, false).await,
        Err(Error::Validation(_))
    ));

    let nested = vec![Command::new("a", "batch", json!({}))];
    assert!(matches!(
        client.batch().execute(nested, false).await,
        Err(Error::Validation(_))
    ));

    assert!(matches!(
        client.batch().execute(Vec::new(), false).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_concurrent_chunks_keep_command_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/batch.json", WEBHOOK_PATH)))
        .respond_with(echo_reversed)
        .expect(3)
        .mount(&server)
        .await;

    let client =
        webhook_client_with(&server, ClientConfig::default().with_max_concurrent_chunks(3));
    let results = client.batch().execute(deal_commands(137), false).await.unwrap();

    assert_eq!(results.success_count(), 137);
    let keys: Vec<String> = results.keys().map(|k| k.to_string()).collect();
    let expected: Vec<String> = (0..137).map(|i| format!("c{}", i)).collect();
    assert_eq!(keys, expected);
}
