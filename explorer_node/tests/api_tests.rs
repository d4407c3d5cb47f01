//! API tests - routes, validation, auth and the protection stack, driven in-process

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    routing,
    Router,
};
use explorer_node::{
    api::{cors::CorsConfig, create_router, AppState},
    config::ExplorerConfig,
    security::{
        auth::{hash_api_key, Role},
        server_protection::{self, ProtectionConfig},
    },
    storage::{LedgerEvent, LedgerStore},
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

const API_KEY: &str = "integration-admin-key";
const SECRET: &str = "integration-test-secret-0123456789";
const VOTE_REQUEST: &str = "pkg1:Splice.DsoRules:VoteRequest";
const AMULET: &str = "pkg1:Splice.Amulet:Amulet";

fn timestamp(secs: u32) -> String {
    format!("2024-06-01T00:{:02}:{:02}Z", secs / 60, secs % 60)
}

fn event(id: &str, kind: &str, contract: &str, template: &str, secs: u32, extra: Value) -> LedgerEvent {
    let mut raw = json!({
        "event_id": id,
        "update_id": format!("upd-{}", id),
        "event_type": kind,
        "contract_id": contract,
        "template_id": template,
        "signatories": ["dso::1220aa"],
        "observers": [],
        "payload": { "owner": "alice::1220bb", "note": format!("event {}", id) },
        "effective_at": timestamp(secs),
        "record_time": timestamp(secs),
    });
    if let (Some(target), Some(fields)) = (raw.as_object_mut(), extra.as_object()) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(raw).unwrap()
}

fn ballot(accept: bool) -> Value {
    json!({ "sv": "sv::1220aa", "accept": accept, "reason": { "url": "", "body": "" } })
}

fn vote_request(id: &str, contract: &str, secs: u32, votes: Value) -> LedgerEvent {
    event(
        id,
        "created",
        contract,
        VOTE_REQUEST,
        secs,
        json!({
            "payload": {
                "requester": "sv-1",
                "action": { "tag": "ARC_AmuletRules", "value": { "amuletRulesAction": { "tag": "CRARC_SetConfig", "value": {} } } },
                "reason": { "url": "https://example.org/cip-42", "body": "fee change" },
                "voteBefore": "2099-01-01T00:00:00Z",
                "votes": votes,
                "trackingCid": null
            }
        }),
    )
}

fn seed() -> Vec<LedgerEvent> {
    vec![
        event("e1", "created", "00c1", AMULET, 10, json!({})),
        event("e2", "created", "00c2", AMULET, 20, json!({})),
        event(
            "e3",
            "exercised",
            "00c2",
            AMULET,
            30,
            json!({ "choice": "Amulet_Transfer", "consuming": true }),
        ),
        vote_request("v1", "00d1", 40, json!([["sv-1", ballot(true)]])),
        vote_request(
            "v2",
            "00d2",
            50,
            json!([["sv-1", ballot(true)], ["sv-2", ballot(true)], ["sv-3", ballot(true)]]),
        ),
    ]
}

fn test_config() -> ExplorerConfig {
    let mut config = ExplorerConfig::default();
    config.auth.jwt_secret = Some(SECRET.to_string());
    config.auth.api_key_digests = vec![hash_api_key(API_KEY)];
    config.governance.sv_count = 4;
    config.crash_log.path = std::env::temp_dir().join(format!(
        "explorer-crashes-{}.jsonl",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    config
}

fn app_with(config: ExplorerConfig) -> (Router, AppState) {
    let store = LedgerStore::open_in_memory().unwrap();
    store.insert_events(&seed()).unwrap();
    let state = AppState::new(config, store);
    (create_router(state.clone()), state)
}

fn app() -> (Router, AppState) {
    app_with(test_config())
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn get(app: &Router, uri: &str) -> Response {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &Value, credential: Option<(&str, String)>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((name, value)) = credential {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn bearer(state: &AppState, role: Role) -> (&'static str, String) {
    let token = state.authenticator.issue_token("tester", role, None).unwrap();
    ("authorization", format!("Bearer {}", token))
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["event_count"], 5);
    assert_eq!(body["overloaded"], false);
}

#[tokio::test]
async fn test_list_events_with_filters() {
    let (app, _) = app();

    let body = json_body(get(&app, "/api/events?template=Splice.Amulet:Amulet&order=asc").await).await;
    let ids: Vec<_> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["e1", "e2", "e3"]);
    assert_eq!(body["total"], 3);
    assert_eq!(body["limit"], 100);

    let body = json_body(get(&app, "/api/events?event_type=created&limit=2&offset=1").await).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["total"], 4);
    assert_eq!(body["offset"], 1);

    let body = json_body(get(&app, "/api/events?search=Amulet_Transfer").await).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["event_id"], "e3");
}

#[tokio::test]
async fn test_search_injection_rejected() {
    let (app, _) = app();
    let response = get(&app, "/api/events?search=x%27%20UNION%20SELECT%20payload%20FROM%20events").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], 400);
    assert_eq!(body["details"]["reason"], "union_select");
    assert!(body["request_id"].is_string());

    // wildcards are literal, not an error
    let body = json_body(get(&app, "/api/events?search=%25").await).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_malformed_parameters_are_422() {
    let (app, _) = app();
    let response = get(&app, "/api/events?from=yesterday&event_type=deleted").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    let fields: Vec<_> = body["details"]["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["field"].as_str().unwrap().to_string())
        .collect();
    assert!(fields.contains(&"from".to_string()));
    assert!(fields.contains(&"event_type".to_string()));

    let response = get(&app, "/api/contracts/not-hex").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_event_and_contract_lookup() {
    let (app, _) = app();

    let body = json_body(get(&app, "/api/events/e3").await).await;
    assert_eq!(body["choice"], "Amulet_Transfer");
    assert_eq!(get(&app, "/api/events/missing").await.status(), StatusCode::NOT_FOUND);

    let body = json_body(get(&app, "/api/contracts/0x00C2").await).await;
    assert_eq!(body["contract_id"], "00c2");
    assert_eq!(body["archived"], true);
    assert_eq!(body["events"].as_array().unwrap().len(), 2);

    let response = get(&app, "/api/contracts/00ff").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_acs_and_stats() {
    let (app, _) = app();

    let body = json_body(get(&app, "/api/acs?template=Splice.Amulet:Amulet").await).await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["contract_id"], "00c1");

    let body = json_body(get(&app, "/api/acs?template=Splice.Amulet:Amulet&as_of=2024-06-01T00:00:25Z").await).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let body = json_body(get(&app, "/api/stats/templates").await).await;
    assert_eq!(body["total_events"], 5);
    let amulet = body["templates"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["template_id"] == AMULET)
        .unwrap()
        .clone();
    assert_eq!(amulet["created"], 2);
    assert_eq!(amulet["active"], 1);
}

#[tokio::test]
async fn test_governance_routes() {
    let (app, _) = app();

    let body = json_body(get(&app, "/api/governance/vote-requests").await).await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["voting_threshold"], 3);
    assert_eq!(body["items"][0]["contract_id"], "00d2");
    assert_eq!(body["items"][0]["status"], "accepted");
    assert_eq!(body["items"][0]["action_tag"], "CRARC_SetConfig");
    assert_eq!(body["items"][1]["tally"]["accepted"], 1);

    let body = json_body(get(&app, "/api/governance/vote-requests?status=in_progress").await).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["contract_id"], "00d1");

    let response = get(&app, "/api/governance/vote-requests?status=pending").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = json_body(get(&app, "/api/governance/summary").await).await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["in_progress"], 1);
    assert_eq!(body["by_action"]["CRARC_SetConfig"], 2);
}

#[tokio::test]
async fn test_classify_stage() {
    let (app, _) = app();
    let request = post_json(
        "/api/governance/classify-stage",
        &json!({ "text": "Vote now: ballot closes at the deadline" }),
        None,
    );
    let body = json_body(send(&app, request).await).await;
    assert_eq!(body["stage"], "cip-vote");

    let request = post_json("/api/governance/classify-stage", &json!({ "text": "" }), None);
    let body = json_body(send(&app, request).await).await;
    assert_eq!(body["stage"], "other");
    assert_eq!(body["confidence"], 0.0);

    let request = post_json("/api/governance/classify-stage", &json!({ "body": 1 }), None);
    assert_eq!(send(&app, request).await.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/governance/classify-stage")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"text\": "))
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_requires_admin_role() {
    let (app, state) = app();
    let batch = json!([]);

    let response = send(&app, post_json("/api/admin/events", &batch, None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, post_json("/api/admin/events", &batch, Some(bearer(&state, Role::Reader)))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &app,
        post_json("/api/admin/events", &batch, Some(("x-api-key", "wrong".to_string()))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, post_json("/api/admin/events", &batch, Some(bearer(&state, Role::Admin)))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_ingest() {
    let (app, state) = app();
    let key = Some(("x-api-key", API_KEY.to_string()));

    let mut archive = serde_json::to_value(event("e9", "exercised", "00C1", AMULET, 90, json!({}))).unwrap();
    archive["choice"] = json!("Archive");
    let batch = json!([archive, serde_json::to_value(event("e1", "created", "00c1", AMULET, 10, json!({}))).unwrap()]);

    let response = send(&app, post_json("/api/admin/events", &batch, key.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["received"], 2);
    assert_eq!(body["inserted"], 1);

    let stored = state.store.get_event("e9").unwrap().unwrap();
    assert!(stored.consuming);
    assert_eq!(stored.contract_id, "00c1");

    let mut bad = serde_json::to_value(event("e10", "created", "00c5", AMULET, 95, json!({}))).unwrap();
    bad["template_id"] = json!("pkg:'; DROP TABLE events; --");
    let response = send(&app, post_json("/api/admin/events", &json!([bad]), key)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["details"]["rejected"][0]["index"], 0);
    assert!(state.store.get_event("e10").unwrap().is_none());
}

#[tokio::test]
async fn test_admin_rate_limit_status_and_crashes() {
    let (app, state) = app();
    let admin = bearer(&state, Role::Admin);

    // requests without a peer address are keyed as "unknown"
    get(&app, "/health").await;
    let request = Request::builder()
        .uri("/api/admin/rate-limit/unknown")
        .header(admin.0, admin.1.clone())
        .body(Body::empty())
        .unwrap();
    let body = json_body(send(&app, request).await).await;
    assert!(body["requests_this_hour"].as_u64().unwrap() >= 1);

    let request = Request::builder()
        .uri("/api/admin/rate-limit/not-an-ip")
        .header(admin.0, admin.1.clone())
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let report = explorer_node::security::crash_log::CrashReport::new(
        explorer_node::security::crash_log::CrashKind::Fatal,
        "disk full",
    );
    state.crash_log.record(&report).unwrap();
    let request = Request::builder()
        .uri("/api/admin/crashes?limit=5")
        .header(admin.0, admin.1)
        .body(Body::empty())
        .unwrap();
    let body = json_body(send(&app, request).await).await;
    assert_eq!(body[0]["message"], "disk full");
    std::fs::remove_file(state.crash_log.path()).ok();
}

#[tokio::test]
async fn test_reads_can_require_auth() {
    let mut config = test_config();
    config.auth.require_auth_for_reads = true;
    let (app, state) = app_with(config);

    assert_eq!(get(&app, "/api/events").await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(get(&app, "/health").await.status(), StatusCode::OK);

    let (name, value) = bearer(&state, Role::Reader);
    let request = Request::builder()
        .uri("/api/events")
        .header(name, value)
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/api/events")
        .header("authorization", "Bearer garbage")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let mut config = test_config();
    config.rate_limit.per_ip_per_second = 2;
    config.rate_limit.burst_allowance = 0;
    let (app, _) = app_with(config);

    assert_eq!(get(&app, "/health").await.status(), StatusCode::OK);
    assert_eq!(get(&app, "/health").await.status(), StatusCode::OK);
    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    let body = json_body(response).await;
    assert_eq!(body["details"]["limit"], "ip_per_second");
}

#[tokio::test]
async fn test_memory_pressure_sheds_requests() {
    let mut config = test_config();
    config.protection.memory_limit_mb = Some(64);
    let (app, state) = app_with(config);

    state.memory.record_sample(512 * 1024 * 1024);
    let response = get(&app, "/api/events").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["details"]["limit_mb"], 64);

    let health = json_body(get(&app, "/health").await).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["overloaded"], true);

    state.memory.record_sample(1024 * 1024);
    assert_eq!(get(&app, "/api/events").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_body_limit() {
    let mut config = test_config();
    config.protection.max_body_bytes = 128;
    let (app, _) = app_with(config);

    let body = json!({ "text": "vote ".repeat(100) }).to_string();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/governance/classify-stage")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_cors_preflight() {
    let mut config = test_config();
    config.server.cors_origins = vec!["https://*.canton.network".to_string()];
    let (app, _) = app_with(config);

    let preflight = |origin: &str| {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/events")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap()
    };

    let response = send(&app, preflight("https://explorer.canton.network")).await;
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://explorer.canton.network"
    );

    let response = send(&app, preflight("https://evil.example")).await;
    assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
}

fn protected(router: Router, config: ProtectionConfig) -> Router {
    let (_, state) = app();
    let protection = explorer_node::security::ProtectionState {
        memory: state.memory.clone(),
        rate_limiter: state.rate_limiter.clone(),
        authenticator: state.authenticator.clone(),
        trust_proxy: false,
    };
    server_protection::install(router, &config, protection, CorsConfig::new(vec![]).layer())
}

#[tokio::test]
async fn test_handler_panic_becomes_500() {
    let router = Router::new().route(
        "/boom",
        routing::get(|| async {
            if true {
                panic!("handler exploded");
            }
            "unreachable"
        }),
    );
    let app = protected(router, ProtectionConfig::default());

    let response = get(&app, "/boom").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["code"], 500);
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    let router = Router::new().route(
        "/slow",
        routing::get(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "done"
        }),
    );
    let config = ProtectionConfig {
        request_timeout_secs: 1,
        ..Default::default()
    };
    let app = protected(router, config);

    let response = get(&app, "/slow").await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
}
