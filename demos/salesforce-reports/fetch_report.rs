//! Fetches one report and prints a CSV preview.
//!
//! Credentials come from the environment:
//! - `SALESFORCE_CLIENT_ID`, `SALESFORCE_USERNAME`, `SALESFORCE_TOKEN_URL`
//! - `SALESFORCE_PRIVATE_KEY_PATH` (PEM encoded RSA key)
//! - `SALESFORCE_AUDIENCE` (optional)
//!
//! `FALLBACK_SOQL` registers the bulk query used when the report is capped.
//!
//! ```sh
//! FALLBACK_SOQL="SELECT Id, Name FROM Contact" \
//!   RUST_LOG=salesforce_reports=debug \
//!   cargo run --example fetch_report -- 00OHq000007fYBBMA2
//! ```

use salesforce_reports::auth;
use salesforce_reports::fetch::{FetchController, StaticFallbackQueries};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PREVIEW_ROWS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let report_id = std::env::args()
        .nth(1)
        .ok_or("usage: fetch_report <report-id>")?;

    let manager = auth::Builder::new().credentials_from_env().build()?;
    let session = manager.authenticate().await?;
    info!(
        instance_url = session.instance_url(),
        api_version = session.api_version(),
        "authenticated"
    );

    let mut fallbacks = StaticFallbackQueries::new();
    if let Ok(soql) = std::env::var("FALLBACK_SOQL") {
        fallbacks.insert(report_id.clone(), soql);
    }

    let controller = FetchController::new(manager, fallbacks)?;
    let table = controller.fetch(&session, &report_id).await?;
    info!(rows = table.len(), columns = table.column_labels().len(), "report fetched");

    let preview = salesforce_reports::TabularResult::new(
        table.column_labels().to_vec(),
        table.rows().iter().take(PREVIEW_ROWS).cloned().collect(),
    );
    preview.write_csv(std::io::stdout().lock())?;
    if table.len() > PREVIEW_ROWS {
        println!("... {} more rows", table.len() - PREVIEW_ROWS);
    }

    Ok(())
}
