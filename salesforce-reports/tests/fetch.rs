//! End-to-end fetch against a mocked org: authenticate, read a paginated
//! report that reaches the row cap, then fall back to a bulk query job.

use salesforce_reports::auth::{self, Credentials};
use salesforce_reports::fetch::{FetchController, FetchOptions, StaticFallbackQueries};
use salesforce_reports::Error;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRIVATE_KEY: &[u8] = include_bytes!("fixtures/test_rsa_private.pem");
const REPORT_ID: &str = "00OHq000007fYBBMA2";
const FALLBACK_SOQL: &str = "SELECT Id, Name FROM Opportunity";

fn report_page(start: usize, count: usize, page_token: Option<&str>) -> Value {
    let rows: Vec<Value> = (start..start + count)
        .map(|i| {
            json!({ "dataCells": [
                { "label": format!("Opportunity {i}"), "value": format!("006{i:05}") },
                { "label": "$1,000.00", "value": { "amount": 1000, "currency": null } }
            ] })
        })
        .collect();
    let mut page = json!({
        "reportMetadata": { "detailColumns": ["OPPORTUNITY_NAME", "AMOUNT"] },
        "reportExtendedMetadata": { "detailColumnInfo": {
            "OPPORTUNITY_NAME": { "label": "Opportunity Name" },
            "AMOUNT": { "label": "Amount" }
        } },
        "factMap": { "T!T": { "rows": rows } }
    });
    if let Some(token) = page_token {
        page["nextPageToken"] = json!(token);
    }
    page
}

async fn mount_org(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "00Dxx!session",
            "instance_url": server.uri(),
            "token_type": "Bearer",
            "scope": "api"
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "version": "9.0", "label": "Summer '07", "url": "/services/data/v9.0" },
            { "version": "64.0", "label": "Summer '25", "url": "/services/data/v64.0" },
            { "version": "65.0", "label": "Winter '26", "url": "/services/data/v65.0" }
        ])))
        .mount(server)
        .await;
}

fn manager(server: &MockServer) -> auth::SessionManager {
    auth::Builder::new()
        .credentials(Credentials {
            client_id: "3MVG9test".to_string(),
            username: "integration@example.com".to_string(),
            token_url: format!("{}/services/oauth2/token", server.uri()),
            audience: None,
            private_key_path: None,
        })
        .private_key_pem(PRIVATE_KEY.to_vec())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_capped_report_falls_back_to_bulk_query() {
    let server = MockServer::start().await;
    mount_org(&server).await;

    let report_path = format!("/services/data/v65.0/analytics/reports/{REPORT_ID}");
    Mock::given(method("GET"))
        .and(path(report_path.clone()))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(report_page(1000, 1000, None)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(report_path))
        .and(query_param("includeDetails", "true"))
        .and(header("authorization", "Bearer 00Dxx!session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(report_page(0, 1000, Some("page-2"))),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let jobs_path = "/services/data/v65.0/jobs/query";
    Mock::given(method("POST"))
        .and(path(jobs_path))
        .and(body_string_contains("SELECT Id, Name FROM Opportunity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "7505g00000AbCdE",
            "operation": "query",
            "object": "Opportunity",
            "state": "UploadComplete",
            "contentType": "CSV"
        })))
        .expect(1)
        .mount(&server)
        .await;
    for state in ["UploadComplete", "InProgress", "JobComplete"] {
        Mock::given(method("GET"))
            .and(path(format!("{jobs_path}/7505g00000AbCdE")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "7505g00000AbCdE",
                "state": state,
                "contentType": "CSV",
                "numberRecordsProcessed": 2500
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
    }

    let results_path = format!("{jobs_path}/7505g00000AbCdE/results");
    let first: String = std::iter::once("\"Id\",\"Name\"\n".to_string())
        .chain((0..1500).map(|i| format!("\"006{i:05}\",\"Opportunity {i}\"\n")))
        .collect();
    let second: String = std::iter::once("\"Id\",\"Name\"\n".to_string())
        .chain((1500..2500).map(|i| format!("\"006{i:05}\",\"Opportunity {i}\"\n")))
        .collect();
    Mock::given(method("GET"))
        .and(path(results_path.clone()))
        .and(query_param("locator", "MTUwMA"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Sforce-Locator", "null")
                .set_body_raw(second, "text/csv"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(results_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Sforce-Locator", "MTUwMA")
                .set_body_raw(first, "text/csv"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager(&server);
    let session = manager.authenticate().await.unwrap();
    assert_eq!(session.api_version(), "65.0");

    let controller = FetchController::new(
        manager,
        StaticFallbackQueries::new().with(REPORT_ID, FALLBACK_SOQL),
    )
    .unwrap()
    .with_options(FetchOptions {
        poll_interval_secs: 0,
        ..FetchOptions::default()
    });

    let table = controller.fetch(&session, REPORT_ID).await.unwrap();

    assert_eq!(table.column_labels(), ["Id", "Name"]);
    assert_eq!(table.len(), 2500);
    assert_eq!(table.rows()[0], ["00600000", "Opportunity 0"]);
    assert_eq!(table.rows()[2499], ["00602499", "Opportunity 2499"]);
}

#[tokio::test]
async fn test_small_report_is_returned_with_report_labels() {
    let server = MockServer::start().await;
    mount_org(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/services/data/v65.0/analytics/reports/{REPORT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(report_page(0, 3, None)))
        .mount(&server)
        .await;

    let manager = manager(&server);
    let session = manager.authenticate().await.unwrap();
    let controller = FetchController::new(manager, StaticFallbackQueries::new()).unwrap();

    let table = controller.fetch(&session, REPORT_ID).await.unwrap();

    assert_eq!(table.column_labels(), ["Opportunity Name", "Amount"]);
    assert_eq!(table.rows()[2], ["Opportunity 2", "$1,000.00"]);
}

#[tokio::test]
async fn test_capped_report_without_fallback_is_rejected() {
    let server = MockServer::start().await;
    mount_org(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/services/data/v65.0/analytics/reports/{REPORT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(report_page(0, 2000, None)))
        .mount(&server)
        .await;

    let manager = manager(&server);
    let session = manager.authenticate().await.unwrap();
    let controller = FetchController::new(manager, StaticFallbackQueries::new()).unwrap();

    let error = controller.fetch(&session, REPORT_ID).await.unwrap_err();
    assert!(matches!(error, Error::UnmappedFallback { .. }));
    assert_eq!(
        error.to_string(),
        format!("Report {REPORT_ID} reached the row cap and has no fallback query")
    );
}
