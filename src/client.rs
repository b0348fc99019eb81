use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use gcp_bigquery_client::model::error_proto::ErrorProto;
use gcp_bigquery_client::model::field_type::FieldType;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::get_query_results_response::GetQueryResultsResponse;
use gcp_bigquery_client::model::job_reference::JobReference;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::QueryResponse;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_row::TableRow;
use gcp_bigquery_client::Client;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::schema::is_nested;

/// One batch of rows from the service, plus the token for the batch after
/// it when the result set spans more than one response.
#[cfg_attr(test, derive(Debug))]
struct Page {
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

/// What the initial jobs.query response amounts to: either the job already
/// finished and the first page is in hand, or the job is still running and
/// must be polled through its job reference.
#[cfg_attr(test, derive(Debug))]
enum FirstPage {
    Complete {
        schema: Vec<TableFieldSchema>,
        page: Page,
    },
    Pending(JobReference),
}

/// A completed query: the nested column schema plus the row pages, fetched
/// one at a time so a page is fully consumed before the next request.
pub struct QueryResults {
    pub schema: Vec<TableFieldSchema>,
    client: Client,
    project_id: String,
    job: Option<JobReference>,
    state: PageState,
}

enum PageState {
    Ready(Page),
    Token(String),
    Exhausted,
}

impl QueryResults {
    /// Hands out the next batch of raw rows, or `None` once the result
    /// set is drained. A follow-up page is only requested on the call
    /// after the current one has been handed out.
    pub async fn next_page(&mut self) -> Result<Option<Vec<TableRow>>> {
        match std::mem::replace(&mut self.state, PageState::Exhausted) {
            PageState::Exhausted => Ok(None),
            PageState::Ready(page) => {
                if let Some(token) = page.page_token {
                    self.state = PageState::Token(token);
                }
                Ok(Some(page.rows))
            }
            PageState::Token(token) => {
                let job = self
                    .job
                    .as_ref()
                    .context("paginated result carries no job reference")?;
                let job_id = job
                    .job_id
                    .as_deref()
                    .context("job reference has no job id")?;
                let parameters = GetQueryResultsParameters {
                    page_token: Some(token),
                    location: job.location.clone(),
                    ..Default::default()
                };
                let response = self
                    .client
                    .job()
                    .get_query_results(&self.project_id, job_id, parameters)
                    .await
                    .context("fetching result page failed")?;
                let results = split_results_page(response)?;
                debug!(rows = results.page.rows.len(), "result page fetched");
                if let Some(next) = results.page.page_token {
                    self.state = PageState::Token(next);
                }
                Ok(Some(results.page.rows))
            }
        }
    }
}

/// Runs one SQL statement against BigQuery.
///
/// The credential file is resolved to an absolute path and handed to the
/// client's service-account mechanism; the project id comes from the same
/// key file. Blocks until the job completes: an initial response with the
/// job still running is polled through jobs.getQueryResults until the
/// service reports completion. Query rejection is fatal, no retries.
pub async fn run_query(auth: &Path, stmt: &str) -> Result<QueryResults> {
    let key_path = fs::canonicalize(auth)
        .with_context(|| format!("cannot resolve credential file {}", auth.display()))?;
    let project_id = project_id_from_key(&key_path)?;
    let key_str = key_path
        .to_str()
        .context("credential path is not valid UTF-8")?;

    let client = Client::from_service_account_key_file(key_str)
        .await
        .context("failed to build BigQuery client")?;

    debug!(%project_id, statement_len = stmt.len(), "submitting query");
    let response = client
        .job()
        .query(&project_id, QueryRequest::new(stmt))
        .await
        .context("query execution failed")?;
    let response = response.query_response().clone();
    let job = response.job_reference.clone();

    let (schema, page) = match split_first_page(response)? {
        FirstPage::Complete { schema, page } => (schema, page),
        FirstPage::Pending(job_ref) => {
            let done = wait_for_completion(&client, &project_id, &job_ref).await?;
            let schema = done
                .schema
                .map(flatten_schema_fields)
                .unwrap_or_default();
            (schema, done.page)
        }
    };
    info!(columns = schema.len(), first_page_rows = page.rows.len(), "query completed");

    Ok(QueryResults {
        schema,
        client,
        project_id,
        job,
        state: PageState::Ready(page),
    })
}

async fn wait_for_completion(
    client: &Client,
    project_id: &str,
    job: &JobReference,
) -> Result<ResultsPage> {
    let job_id = job
        .job_id
        .as_deref()
        .context("incomplete query response carries no job id")?;
    loop {
        // jobs.getQueryResults long-polls server side, so this loop is
        // bounded by the service's own wait, not a busy spin.
        let parameters = GetQueryResultsParameters {
            location: job.location.clone(),
            ..Default::default()
        };
        let response = client
            .job()
            .get_query_results(project_id, job_id, parameters)
            .await
            .context("polling query completion failed")?;
        let results = split_results_page(response)?;
        if results.complete {
            return Ok(results);
        }
        debug!(job_id, "query still running");
    }
}

fn split_first_page(response: QueryResponse) -> Result<FirstPage> {
    check_errors(response.errors.as_deref())?;
    if !response.job_complete.unwrap_or(false) {
        let job = response
            .job_reference
            .context("incomplete query response carries no job reference")?;
        return Ok(FirstPage::Pending(job));
    }
    Ok(FirstPage::Complete {
        schema: response.schema.map(flatten_schema_fields).unwrap_or_default(),
        page: Page {
            rows: response.rows.unwrap_or_default(),
            page_token: response.page_token,
        },
    })
}

/// A parsed jobs.getQueryResults response.
struct ResultsPage {
    complete: bool,
    schema: Option<gcp_bigquery_client::model::table_schema::TableSchema>,
    page: Page,
}

fn split_results_page(response: GetQueryResultsResponse) -> Result<ResultsPage> {
    check_errors(response.errors.as_deref())?;
    Ok(ResultsPage {
        complete: response.job_complete.unwrap_or(false),
        schema: response.schema,
        page: Page {
            rows: response.rows.unwrap_or_default(),
            page_token: response.page_token,
        },
    })
}

fn flatten_schema_fields(schema: gcp_bigquery_client::model::table_schema::TableSchema) -> Vec<TableFieldSchema> {
    schema.fields.unwrap_or_default()
}

fn check_errors(errors: Option<&[ErrorProto]>) -> Result<()> {
    if let Some(first) = errors.and_then(<[ErrorProto]>::first) {
        bail!(
            "query failed: {}",
            first.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn project_id_from_key(key_path: &Path) -> Result<String> {
    let raw = fs::read_to_string(key_path)
        .with_context(|| format!("cannot read credential file {}", key_path.display()))?;
    let key: Value = serde_json::from_str(&raw)
        .with_context(|| format!("credential file {} is not valid JSON", key_path.display()))?;
    key.get("project_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .with_context(|| format!("credential file {} has no project_id", key_path.display()))
}

/// Converts one wire-format row (positional `f`/`v` cells) into a JSON
/// object keyed by column name, recursing through RECORD and REPEATED
/// values so the projector can walk it by name at every level.
pub fn decode_row(fields: &[TableFieldSchema], row: &TableRow) -> Value {
    let cells = row.columns.as_deref().unwrap_or(&[]);
    let mut object = Map::with_capacity(fields.len());
    for (field, cell) in fields.iter().zip(cells) {
        let wire = cell.value.as_ref().unwrap_or(&Value::Null);
        object.insert(field.name.clone(), decode_value(field, wire));
    }
    Value::Object(object)
}

fn decode_value(field: &TableFieldSchema, wire: &Value) -> Value {
    if wire.is_null() {
        return Value::Null;
    }
    if field.mode.as_deref() == Some("REPEATED") {
        // A repeated column arrives as [{"v": item}, ...].
        let Value::Array(items) = wire else {
            return Value::Null;
        };
        let decoded = items
            .iter()
            .map(|item| decode_item(field, item.get("v").unwrap_or(item)))
            .collect();
        return Value::Array(decoded);
    }
    decode_item(field, wire)
}

fn decode_item(field: &TableFieldSchema, wire: &Value) -> Value {
    if wire.is_null() {
        return Value::Null;
    }
    if is_nested(&field.r#type) {
        // A record arrives as {"f": [cells]}, positional like a row.
        let children = field.fields.as_deref().unwrap_or(&[]);
        let mut object = Map::with_capacity(children.len());
        let cells = wire.get("f").and_then(Value::as_array);
        for (child, cell) in children.iter().zip(cells.into_iter().flatten()) {
            let inner = cell.get("v").unwrap_or(&Value::Null);
            object.insert(child.name.clone(), decode_value(child, inner));
        }
        return Value::Object(object);
    }
    decode_scalar(&field.r#type, wire)
}

// Scalars arrive as JSON strings; numeric and boolean columns are given
// back their native JSON form, everything else (timestamps included) is
// kept as the string the service sent.
fn decode_scalar(datatype: &FieldType, wire: &Value) -> Value {
    let Some(text) = wire.as_str() else {
        return wire.clone();
    };
    match datatype {
        FieldType::Integer | FieldType::Int64 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| wire.clone()),
        FieldType::Float | FieldType::Float64 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| wire.clone()),
        FieldType::Boolean | FieldType::Bool => match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => wire.clone(),
        },
        _ => wire.clone(),
    }
}
