use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use crate::error::AppResult;
use crate::middleware::{ClientIp, CurrentUser, LimitedEndpoint};
use crate::search::{self, SearchQuery};
use crate::state::AppState;

pub async fn global_search(
    State(state): State<AppState>,
    current: CurrentUser,
    ClientIp(ip): ClientIp,
    Query(query): Query<SearchQuery>,
) -> AppResult<impl IntoResponse> {
    state.rate_limiter.check(LimitedEndpoint::Search, ip).await?;
    let results = search::global(&state.db, &current, &query).await?;
    tracing::debug!(
        user = %current.id,
        projects = results.projects.len(),
        folders = results.folders.len(),
        datasets = results.uploads_datasets.len(),
        versions = results.uploads_versions.len(),
        "Global search"
    );
    Ok(Json(results))
}
