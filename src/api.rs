//! Read-only query API over harvested jobs.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::models::{EnglishLevel, Technology, WorkFormat};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

const SELECT_JOBS: &str = "SELECT j.id, j.job_id, j.title, j.salary, j.company, j.company_logo, \
     j.work_format, j.location, j.description, j.views, j.applications, j.posted_at, \
     j.experience_years, j.english_level, j.technology_id, j.created_at, \
     t.name AS technology_name, t.search_keyword AS technology_search_keyword \
     FROM jobs j JOIN technologies t ON t.id = j.technology_id";

pub struct AppState {
    pub pool: PgPool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn store(context: &str, err: sqlx::Error) -> Self {
        tracing::error!("{}: {}", context, err);
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: context.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

// ============================================================================
// Query parameters
// ============================================================================

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct JobsQuery {
    /// Page number, starting at 1.
    pub page: Option<i64>,
    /// Items per page (max 100).
    pub limit: Option<i64>,
    /// Case-insensitive match on title, company or description.
    pub search: Option<String>,
    /// Remote, Office or Hybrid.
    pub work_format: Option<String>,
    pub english_level: Option<String>,
    /// Minimum required years of experience.
    pub experience_years: Option<String>,
    pub technology_id: Option<String>,
    /// postedAt, views or applications.
    pub order_by: Option<String>,
    /// asc or desc.
    pub order: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OrderBy {
    PostedAt,
    Views,
    Applications,
}

impl OrderBy {
    fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw.map(str::trim) {
            None | Some("") | Some("postedAt") => Ok(OrderBy::PostedAt),
            Some("views") => Ok(OrderBy::Views),
            Some("applications") => Ok(OrderBy::Applications),
            Some(other) => Err(ApiError::bad_request(format!("unsupported orderBy: {}", other))),
        }
    }

    fn column(&self) -> &'static str {
        match self {
            OrderBy::PostedAt => "j.posted_at",
            OrderBy::Views => "j.views",
            OrderBy::Applications => "j.applications",
        }
    }
}

fn parse_direction(raw: Option<&str>) -> Result<&'static str, ApiError> {
    match raw.map(|d| d.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("desc") => Ok("DESC"),
        Some("asc") => Ok("ASC"),
        Some(other) => Err(ApiError::bad_request(format!("unsupported order: {}", other))),
    }
}

#[derive(Debug, Default, PartialEq)]
struct JobFilters {
    search: Option<String>,
    work_format: Option<WorkFormat>,
    english_level: Option<EnglishLevel>,
    min_experience: Option<f64>,
    technology_id: Option<i32>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl JobFilters {
    fn from_query(query: &JobsQuery) -> Result<Self, ApiError> {
        Ok(JobFilters {
            search: present(&query.search).map(str::to_string),
            work_format: present(&query.work_format)
                .map(str::parse::<WorkFormat>)
                .transpose()
                .map_err(ApiError::bad_request)?,
            english_level: present(&query.english_level)
                .map(str::parse::<EnglishLevel>)
                .transpose()
                .map_err(ApiError::bad_request)?,
            min_experience: present(&query.experience_years)
                .map(|v| v.parse::<f64>().ok().filter(|n| n.is_finite()).ok_or(v))
                .transpose()
                .map_err(|v| ApiError::bad_request(format!("invalid experienceYears: {}", v)))?,
            technology_id: present(&query.technology_id)
                .map(|v| v.parse::<i32>().map_err(|_| v))
                .transpose()
                .map_err(|v| ApiError::bad_request(format!("invalid technologyId: {}", v)))?,
        })
    }

    fn push_where(&self, query: &mut QueryBuilder<'_, Postgres>) {
        query.push(" WHERE TRUE");
        if let Some(search) = &self.search {
            let pattern = format!("%{}%", escape_like(search));
            query
                .push(" AND (j.title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR j.company ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR j.description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(format) = self.work_format {
            query.push(" AND j.work_format = ").push_bind(format.as_str());
        }
        if let Some(level) = self.english_level {
            query.push(" AND j.english_level = ").push_bind(level.as_str());
        }
        if let Some(years) = self.min_experience {
            query.push(" AND j.experience_years >= ").push_bind(years);
        }
        if let Some(id) = self.technology_id {
            query.push(" AND j.technology_id = ").push_bind(id);
        }
    }
}

/// Escapes LIKE wildcards so the search term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn page_window(page: Option<i64>, limit: Option<i64>) -> Result<(i64, i64), ApiError> {
    let page = page.unwrap_or(1);
    if page < 1 {
        return Err(ApiError::bad_request("page must be at least 1"));
    }
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    Ok((page, limit))
}

fn total_pages(total: i64, page_size: i64) -> i64 {
    (total + page_size - 1) / page_size
}

// ============================================================================
// Response types
// ============================================================================

#[derive(FromRow)]
struct JobRow {
    id: i32,
    job_id: String,
    title: String,
    salary: Option<String>,
    company: String,
    company_logo: Option<String>,
    work_format: String,
    location: String,
    description: String,
    views: i32,
    applications: i32,
    posted_at: DateTime<Utc>,
    experience_years: f64,
    english_level: String,
    technology_id: i32,
    created_at: DateTime<Utc>,
    technology_name: String,
    technology_search_keyword: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: i32,
    pub job_id: String,
    pub title: String,
    pub salary: Option<String>,
    pub company: String,
    pub company_logo: Option<String>,
    pub work_format: String,
    pub location: String,
    pub description: String,
    pub views: i32,
    pub applications: i32,
    pub posted_at: DateTime<Utc>,
    pub experience_years: f64,
    pub english_level: String,
    pub technology_id: i32,
    pub created_at: DateTime<Utc>,
    pub technology: Technology,
}

impl From<JobRow> for JobView {
    fn from(row: JobRow) -> Self {
        JobView {
            id: row.id,
            job_id: row.job_id,
            title: row.title,
            salary: row.salary,
            company: row.company,
            company_logo: row.company_logo,
            work_format: row.work_format,
            location: row.location,
            description: row.description,
            views: row.views,
            applications: row.applications,
            posted_at: row.posted_at,
            experience_years: row.experience_years,
            english_level: row.english_level,
            technology_id: row.technology_id,
            created_at: row.created_at,
            technology: Technology {
                id: row.technology_id,
                name: row.technology_name,
                search_keyword: row.technology_search_keyword,
            },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobPage {
    pub data: Vec<JobView>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize, ToSchema, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TechnologyCount {
    pub id: i32,
    pub name: String,
    pub search_keyword: String,
    pub job_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExperienceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    pub work_formats: Vec<String>,
    pub english_levels: Vec<String>,
    pub technologies: Vec<TechnologyCount>,
    pub experience_range: ExperienceRange,
}

// ============================================================================
// Handlers
// ============================================================================

#[utoipa::path(
    get,
    path = "/api/jobs",
    params(JobsQuery),
    responses(
        (status = 200, description = "Paginated, filtered jobs", body = JobPage),
        (status = 400, description = "Invalid filter value", body = ErrorBody),
        (status = 500, description = "Store error", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobPage>, ApiError> {
    let filters = JobFilters::from_query(&query)?;
    let order_by = OrderBy::parse(query.order_by.as_deref())?;
    let direction = parse_direction(query.order.as_deref())?;
    let (page, page_size) = page_window(query.page, query.limit)?;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs j");
    filters.push_where(&mut count);
    let total: i64 = count
        .build_query_scalar()
        .fetch_one(&state.pool)
        .await
        .map_err(|e| ApiError::store("Failed to fetch jobs", e))?;

    let mut select = QueryBuilder::<Postgres>::new(SELECT_JOBS);
    filters.push_where(&mut select);
    select.push(format!(" ORDER BY {} {}, j.id {}", order_by.column(), direction, direction));
    select.push(" LIMIT ").push_bind(page_size);
    select.push(" OFFSET ").push_bind((page - 1) * page_size);

    let rows: Vec<JobRow> = select
        .build_query_as()
        .fetch_all(&state.pool)
        .await
        .map_err(|e| ApiError::store("Failed to fetch jobs", e))?;

    Ok(Json(JobPage {
        data: rows.into_iter().map(JobView::from).collect(),
        pagination: Pagination {
            total,
            page,
            page_size,
            total_pages: total_pages(total, page_size),
        },
    }))
}

#[utoipa::path(
    get,
    path = "/api/jobs/filters",
    responses(
        (status = 200, description = "Available filter values", body = FilterOptions),
        (status = 500, description = "Store error", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn get_filters(State(state): State<Arc<AppState>>) -> Result<Json<FilterOptions>, ApiError> {
    let pool = &state.pool;
    let (work_formats, english_levels, technologies, range) = tokio::try_join!(
        sqlx::query_scalar::<_, String>("SELECT DISTINCT work_format FROM jobs ORDER BY work_format").fetch_all(pool),
        sqlx::query_scalar::<_, String>("SELECT DISTINCT english_level FROM jobs ORDER BY english_level")
            .fetch_all(pool),
        technology_counts(pool),
        sqlx::query_as::<_, (Option<f64>, Option<f64>)>("SELECT MIN(experience_years), MAX(experience_years) FROM jobs")
            .fetch_one(pool),
    )
    .map_err(|e| ApiError::store("Failed to fetch filters", e))?;

    Ok(Json(FilterOptions {
        work_formats,
        english_levels,
        technologies,
        experience_range: ExperienceRange { min: range.0, max: range.1 },
    }))
}

#[utoipa::path(
    get,
    path = "/api/jobs/technologies",
    responses(
        (status = 200, description = "Technologies with job counts", body = [TechnologyCount]),
        (status = 500, description = "Store error", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn list_technologies(State(state): State<Arc<AppState>>) -> Result<Json<Vec<TechnologyCount>>, ApiError> {
    let technologies = technology_counts(&state.pool)
        .await
        .map_err(|e| ApiError::store("Failed to fetch technologies", e))?;
    Ok(Json(technologies))
}

#[utoipa::path(
    get,
    path = "/api/jobs/technology/{id}",
    params(("id" = i32, Path, description = "Technology id")),
    responses(
        (status = 200, description = "Jobs for one technology", body = [JobView]),
        (status = 500, description = "Store error", body = ErrorBody)
    ),
    tag = "jobs"
)]
pub async fn jobs_by_technology(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "{} WHERE j.technology_id = $1 ORDER BY j.posted_at DESC, j.id DESC",
        SELECT_JOBS
    ))
    .bind(id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| ApiError::store("Failed to fetch jobs by technology", e))?;

    Ok(Json(rows.into_iter().map(JobView::from).collect()))
}

async fn technology_counts(pool: &PgPool) -> Result<Vec<TechnologyCount>, sqlx::Error> {
    sqlx::query_as::<_, TechnologyCount>(
        "SELECT t.id, t.name, t.search_keyword, COUNT(j.id) AS job_count \
         FROM technologies t LEFT JOIN jobs j ON j.technology_id = t.id \
         GROUP BY t.id, t.name, t.search_keyword ORDER BY t.id",
    )
    .fetch_all(pool)
    .await
}
