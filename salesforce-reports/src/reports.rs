//! Synchronous reads through the Analytics REST API.
//!
//! The endpoint returns at most a fixed number of detail rows per call. Large
//! reports continue through a page token, which [`ReportReader`] follows until
//! the server stops returning one.

use crate::auth::SessionManager;
use crate::error::Error;
use crate::http::{read_json, Api};
use crate::session::Session;
use crate::tabular::{cell_text, TabularResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportResponse {
    report_metadata: ReportMetadata,
    #[serde(default)]
    report_extended_metadata: ExtendedMetadata,
    /// Buckets in document order.
    #[serde(default)]
    fact_map: Map<String, Value>,
    #[serde(default, alias = "nextPageToken")]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportMetadata {
    #[serde(default)]
    detail_columns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedMetadata {
    #[serde(default)]
    detail_column_info: HashMap<String, ColumnInfo>,
}

#[derive(Debug, Deserialize)]
struct ColumnInfo {
    label: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FactBucket {
    rows: Option<Vec<ReportRow>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow {
    #[serde(default)]
    data_cells: Vec<DataCell>,
}

#[derive(Debug, Deserialize)]
struct DataCell {
    #[serde(default)]
    label: Value,
}

/// One page of a report response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPage {
    pub column_labels: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub next_page_token: Option<String>,
}

impl ReportPage {
    /// Parses a report response body.
    ///
    /// Column labels resolve through `detailColumnInfo` (label, then name,
    /// then the column key). Rows of every fact-map bucket that has them are
    /// concatenated in document order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload lacks `reportMetadata` or a
    /// bucket is malformed.
    pub fn from_json(payload: Value) -> Result<Self, Error> {
        let response: ReportResponse =
            serde_json::from_value(payload).map_err(|source| Error::Json { source })?;

        let column_info = &response.report_extended_metadata.detail_column_info;
        let column_labels = response
            .report_metadata
            .detail_columns
            .iter()
            .map(|key| {
                column_info
                    .get(key)
                    .and_then(|info| info.label.clone().or_else(|| info.name.clone()))
                    .unwrap_or_else(|| key.clone())
            })
            .collect();

        let mut rows = Vec::new();
        for (_, bucket) in response.fact_map {
            let bucket: FactBucket =
                serde_json::from_value(bucket).map_err(|source| Error::Json { source })?;
            for row in bucket.rows.into_iter().flatten() {
                rows.push(row.data_cells.iter().map(|cell| cell_text(&cell.label)).collect());
            }
        }

        Ok(Self {
            column_labels,
            rows,
            next_page_token: response.page_token.filter(|token| !token.is_empty()),
        })
    }
}

/// Reader for the Analytics report endpoint.
#[derive(Clone, Debug)]
pub struct ReportReader {
    api: Api,
}

impl ReportReader {
    /// # Errors
    ///
    /// Returns [`Error::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn new(manager: SessionManager) -> Result<Self, Error> {
        Ok(Self::from_api(Api::new(manager)?))
    }

    pub(crate) fn from_api(api: Api) -> Self {
        Self { api }
    }

    /// Reads every page of a report.
    ///
    /// Column labels come from the first page. Rows accumulate in page
    /// order. The session is checked before each page, so it may be
    /// refreshed mid-way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] for error responses, [`Error::Auth`] if the
    /// session cannot be renewed and [`Error::UnexpectedResponse`] if the
    /// server repeats a page token.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn fetch_report(
        &self,
        session: &Session,
        report_id: &str,
        include_details: bool,
    ) -> Result<TabularResult, Error> {
        let mut session = session.clone();
        self.read(&mut session, report_id, include_details).await
    }

    pub(crate) async fn read(
        &self,
        session: &mut Session,
        report_id: &str,
        include_details: bool,
    ) -> Result<TabularResult, Error> {
        let first = self
            .fetch_page(session, report_id, include_details, None)
            .await?;
        let column_labels = first.column_labels;
        let mut rows = first.rows;
        let mut next_page_token = first.next_page_token;
        let mut seen_tokens = HashSet::new();
        let mut pages = 1u32;

        while let Some(token) = next_page_token {
            if !seen_tokens.insert(token.clone()) {
                return Err(Error::UnexpectedResponse(format!(
                    "report {report_id} repeated page token {token}"
                )));
            }
            let page = self
                .fetch_page(session, report_id, include_details, Some(&token))
                .await?;
            rows.extend(page.rows);
            next_page_token = page.next_page_token;
            pages += 1;
        }

        info!(report_id, rows = rows.len(), pages, "read report");
        Ok(TabularResult::new(column_labels, rows))
    }

    async fn fetch_page(
        &self,
        session: &mut Session,
        report_id: &str,
        include_details: bool,
        page_token: Option<&str>,
    ) -> Result<ReportPage, Error> {
        let response = self
            .api
            .send(session, |client, s| {
                let mut request = client
                    .get(format!("{}/analytics/reports/{report_id}", s.api_base_url()))
                    .query(&[("includeDetails", include_details)]);
                if let Some(token) = page_token {
                    request = request.query(&[("pageToken", token)]);
                }
                request
            })
            .await?;

        let page = ReportPage::from_json(read_json(response).await?)?;
        debug!(
            report_id,
            rows = page.rows.len(),
            has_next = page.next_page_token.is_some(),
            "read report page"
        );
        Ok(page)
    }
}
