//! Shared fixtures for the integration tests: a mock portal and helpers to
//! build clients and `batch` responses against it.

#![allow(dead_code)]

use std::fmt;
use std::sync::Once;

use bitrix24_rs::auth::{ApplicationProfile, AuthToken, Endpoints, Scope};
use bitrix24_rs::{Bitrix24Client, ClientConfig, Credentials};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use wiremock::{MockServer, Request, ResponseTemplate};

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Path prefix of the mock webhook.
pub const WEBHOOK_PATH: &str = "/rest/1/s3cr3t";

pub fn webhook_client(server: &MockServer) -> Bitrix24Client {
    webhook_client_with(server, ClientConfig::default())
}

pub fn webhook_client_with(server: &MockServer, config: ClientConfig) -> Bitrix24Client {
    init_logging();
    let credentials =
        Credentials::webhook(&format!("{}{}/", server.uri(), WEBHOOK_PATH)).unwrap();
    Bitrix24Client::with_config(credentials, config).unwrap()
}

pub fn oauth_credentials(server: &MockServer, token: AuthToken) -> Credentials {
    init_logging();
    let profile = ApplicationProfile::new(
        "local.app.1",
        "app-secret",
        Scope::new(["crm", "user"]).unwrap(),
    )
    .unwrap();
    let endpoints = Endpoints::new(
        &format!("{}/rest/", server.uri()),
        &format!("{}/", server.uri()),
    )
    .unwrap();
    Credentials::oauth(token, profile, endpoints)
}

/// Body of a successful refresh-token exchange.
pub fn token_response(access: &str, refresh: &str) -> Value {
    serde_json::json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": 3600,
        "member_id": "a223c6b3710f85df22e9377d6c4f7553",
        "domain": "oauth.bitrix.info",
        "client_endpoint": "https://example.bitrix24.com/rest/",
        "server_endpoint": "https://oauth.bitrix.info/rest/",
        "status": "L",
        "scope": "crm,user"
    })
}

/// `cmd` entries in the order they appear in the request body.
struct OrderedCommands(Vec<(String, String)>);

impl<'de> Deserialize<'de> for OrderedCommands {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CommandsVisitor;

        impl<'de> Visitor<'de> for CommandsVisitor {
            type Value = OrderedCommands;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of command keys to queries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, String>()? {
                    entries.push(entry);
                }
                Ok(OrderedCommands(entries))
            }
        }

        deserializer.deserialize_map(CommandsVisitor)
    }
}

#[derive(Deserialize)]
struct BatchRequestBody {
    cmd: OrderedCommands,
}

/// The `cmd` map of a `batch` request as `(key, "method?query")` pairs, in
/// send order.
pub fn batch_commands(request: &Request) -> Vec<(String, String)> {
    let body: BatchRequestBody = serde_json::from_slice(&request.body).unwrap();
    body.cmd.0
}

/// The `halt` flag of a `batch` request.
pub fn batch_halt(request: &Request) -> u64 {
    let body: Value = request.body_json().unwrap();
    body["halt"].as_u64().unwrap()
}

/// Query parameters of a `method?query` command.
pub fn command_params(command: &str) -> Vec<(String, String)> {
    let query = command.split_once('?').map(|(_, q)| q).unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Render entries as a JSON object in exactly the given order.
pub fn ordered_object(entries: &[(String, Value)]) -> String {
    let fields: Vec<String> = entries
        .iter()
        .map(|(key, value)| format!("{}:{}", serde_json::to_string(key).unwrap(), value))
        .collect();
    format!("{{{}}}", fields.join(","))
}

/// A `batch` response whose keyed maps are written in the given order.
pub fn batch_response(results: &[(String, Value)], errors: &[(String, Value)]) -> ResponseTemplate {
    batch_response_with(results, errors, &[], &[])
}

pub fn batch_response_with(
    results: &[(String, Value)],
    errors: &[(String, Value)],
    totals: &[(String, Value)],
    nexts: &[(String, Value)],
) -> ResponseTemplate {
    let keyed = |entries: &[(String, Value)]| {
        if entries.is_empty() {
            "[]".to_string()
        } else {
            ordered_object(entries)
        }
    };
    let body = format!(
        r#"{{"result":{{"result":{},"result_error":{},"result_total":{},"result_next":{},"result_time":[]}},"time":{{"start":1700000000.1,"finish":1700000000.2,"duration":0.1}}}}"#,
        keyed(results),
        keyed(errors),
        keyed(totals),
        keyed(nexts),
    );
    ResponseTemplate::new(200).set_body_raw(body, "application/json")
}
