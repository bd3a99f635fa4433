//! End-to-end tests for the job API: HTTP in, local queue, SQLite store.

use std::time::Duration;

use catalog_ingest::app::App;
use catalog_ingest::config::Config;
use catalog_ingest::server;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const GOOD_CSV: &str = "Id,Name,Description,Price,CategoryId,SubcategoryId,Brand,Tags
p-1,Trail Shoe,Light runner,89.90,footwear,running,Acme,\"[\"\"trail\"\"]\"
p-2,Road Shoe,\"Cushioned, fast\",120,footwear,running,Acme,
p-3,Sock,,9.5,apparel,,Knit Co,\"wool,warm\"";

fn test_config(tmp: &TempDir, port: u16) -> Config {
    let config_content = format!(
        r#"[db]
path = "{}/data/ingest.sqlite"

[server]
bind = "127.0.0.1:{}"

[broker]
kind = "local"

[processing]
yield_delay_ms = 0
"#,
        tmp.path().display(),
        port
    );
    toml::from_str(&config_content).unwrap()
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

/// Starts the API on a free port. The worker is started only when asked.
async fn start(tmp: &TempDir, with_worker: bool) -> (App, String, CancellationToken) {
    let port = find_free_port();
    let mut app = App::open(test_config(tmp, port)).await.unwrap();
    let cancel = CancellationToken::new();
    if with_worker {
        app.spawn_worker(cancel.clone()).await.unwrap();
    }

    let cfg = app.config().clone();
    let service = app.service();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        server::run_server(&cfg, service, shutdown).await.ok();
    });
    wait_for_server(port).await;

    (app, format!("http://127.0.0.1:{}", port), cancel)
}

async fn create(client: &reqwest::Client, base: &str, csv: &str) -> String {
    let resp = client
        .post(format!("{}/api/jobs", base))
        .json(&json!({
            "fileName": "products.csv",
            "csvContent": csv,
            "uploadedBy": "tests",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "Queued");
    assert_eq!(body["message"], "CSV upload job has been queued for processing");
    body["jobId"].as_str().unwrap().to_string()
}

async fn wait_for_terminal(client: &reqwest::Client, base: &str, id: &str) -> Value {
    for _ in 0..100 {
        let job: Value = client
            .get(format!("{}/api/jobs/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if job["isCompleted"] == true {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} did not finish", id);
}

#[tokio::test]
async fn upload_is_processed_to_completion() {
    let tmp = TempDir::new().unwrap();
    let (_app, base, cancel) = start(&tmp, true).await;
    let client = reqwest::Client::new();

    let id = create(&client, &base, GOOD_CSV).await;
    let job = wait_for_terminal(&client, &base, &id).await;

    assert_eq!(job["status"], "Completed");
    assert_eq!(job["totalRows"], 3);
    assert_eq!(job["successfulRows"], 3);
    assert_eq!(job["failedRows"], 0);
    assert_eq!(job["progressPercentage"], 100);
    assert_eq!(job["uploadedBy"], "tests");
    assert_eq!(job["createdCategories"], json!(["footwear", "apparel"]));
    assert_eq!(job["createdSubcategories"], json!(["running"]));
    assert_eq!(job["createdProducts"].as_array().unwrap().len(), 3);
    assert_eq!(job["createdProducts"][0]["price"], "89.90");
    assert_eq!(job["createdProducts"][1]["description"], "Cushioned, fast");
    assert_eq!(job["createdProducts"][2]["tags"], json!(["wool", "warm"]));
    assert!(job["duration"].is_string());
    assert!(job["startedAtUtc"].is_string());

    cancel.cancel();
}

#[tokio::test]
async fn row_errors_are_reported_without_failing_the_job() {
    let tmp = TempDir::new().unwrap();
    let (_app, base, cancel) = start(&tmp, true).await;
    let client = reqwest::Client::new();

    let csv = "Id,Name,Price,CategoryId,Brand
a-1,Lamp,19.99,lighting,Lumo
a-2,Bulb,abc,lighting,Lumo
a-3,Shade,5,lighting,
a-1,Lamp again,20,lighting,Lumo";
    let id = create(&client, &base, csv).await;
    let job = wait_for_terminal(&client, &base, &id).await;

    assert_eq!(job["status"], "Completed");
    assert_eq!(job["successfulRows"], 1);
    assert_eq!(job["failedRows"], 3);
    let errors: Vec<String> = job["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e.as_str().unwrap().to_string())
        .collect();
    assert_eq!(errors.len(), 3);
    assert!(errors[0].starts_with("Row 3:"), "{:?}", errors);
    assert!(errors[1].contains("Brand is required"), "{:?}", errors);
    assert!(errors[2].contains("Product with ID 'a-1' already exists"), "{:?}", errors);

    cancel.cancel();
}

#[tokio::test]
async fn header_only_upload_fails_the_job() {
    let tmp = TempDir::new().unwrap();
    let (_app, base, cancel) = start(&tmp, true).await;
    let client = reqwest::Client::new();

    let id = create(&client, &base, "Id,Name,Price,CategoryId,Brand\n").await;
    let job = wait_for_terminal(&client, &base, &id).await;

    assert_eq!(job["status"], "Failed");
    assert_eq!(
        job["errorMessage"],
        "CSV file must contain at least a header row and one data row"
    );
    assert!(job["completedAtUtc"].is_string());

    cancel.cancel();
}

#[tokio::test]
async fn list_and_stats_reflect_finished_jobs() {
    let tmp = TempDir::new().unwrap();
    let (_app, base, cancel) = start(&tmp, true).await;
    let client = reqwest::Client::new();

    let first = create(&client, &base, GOOD_CSV).await;
    wait_for_terminal(&client, &base, &first).await;
    let second = create(&client, &base, "Id\n").await;
    wait_for_terminal(&client, &base, &second).await;

    let page: Value = client
        .get(format!("{}/api/jobs?page=1&pageSize=1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["totalCount"], 2);
    assert_eq!(page["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(page["jobs"][0]["id"], second.as_str());
    assert_eq!(page["hasNextPage"], true);
    assert_eq!(page["hasPreviousPage"], false);

    let failed: Value = client
        .get(format!("{}/api/jobs?status=failed", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(failed["totalCount"], 1);
    assert_eq!(failed["jobs"][0]["status"], "Failed");

    let stats: Value = client
        .get(format!("{}/api/jobs/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["totalJobs"], 2);
    assert_eq!(stats["completedJobs"], 1);
    assert_eq!(stats["failedJobs"], 1);
    assert_eq!(stats["totalProductsCreated"], 3);
    assert_eq!(stats["statusBreakdown"]["Completed"], 1);

    cancel.cancel();
}

#[tokio::test]
async fn queued_job_is_cancelled_and_then_skipped_by_the_worker() {
    let tmp = TempDir::new().unwrap();
    let (mut app, base, cancel) = start(&tmp, false).await;
    let client = reqwest::Client::new();

    let id = create(&client, &base, GOOD_CSV).await;

    let resp = client
        .delete(format!("{}/api/jobs/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Job cancelled successfully");

    // The message is still on the queue; the worker must leave the job alone.
    app.spawn_worker(cancel.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let job: Value = client
        .get(format!("{}/api/jobs/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "Cancelled");
    assert_eq!(job["processedRows"], 0);

    // A terminal job can then be deleted outright.
    let resp = client
        .delete(format!("{}/api/jobs/{}", base, id))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Job deleted successfully");

    let resp = client
        .get(format!("{}/api/jobs/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    cancel.cancel();
}

#[tokio::test]
async fn bad_requests_use_the_error_contract() {
    let tmp = TempDir::new().unwrap();
    let (_app, base, cancel) = start(&tmp, true).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/jobs", base))
        .json(&json!({ "fileName": "x.csv", "csvContent": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/api/jobs?pageSize=500", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{}/api/jobs?status=unknown", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{}/api/jobs/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["message"], "Job not found");

    let resp = client
        .delete(format!("{}/api/jobs/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    cancel.cancel();
}

#[tokio::test]
async fn health_reports_local_broker() {
    let tmp = TempDir::new().unwrap();
    let (_app, base, cancel) = start(&tmp, true).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["brokerHealthy"], true);

    cancel.cancel();
}

#[tokio::test]
async fn jobs_left_queued_by_a_previous_process_are_failed() {
    let tmp = TempDir::new().unwrap();
    let (app, base, cancel) = start(&tmp, false).await;
    let client = reqwest::Client::new();
    let id = create(&client, &base, GOOD_CSV).await;
    cancel.cancel();
    app.close().await;

    let (_app, base, cancel) = start(&tmp, true).await;
    let job: Value = client
        .get(format!("{}/api/jobs/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "Failed");
    assert_eq!(
        job["errorMessage"],
        catalog_ingest::queue::local::ORPHANED_JOB_MESSAGE
    );

    // Jobs created after the restart are processed normally.
    let fresh = create(&client, &base, GOOD_CSV.replace("p-", "q-").as_str()).await;
    let fresh = wait_for_terminal(&client, &base, &fresh).await;
    assert_eq!(fresh["status"], "Completed");
    assert_eq!(fresh["successfulRows"], 3);

    cancel.cancel();
}
