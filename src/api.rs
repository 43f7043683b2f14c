pub mod course;
pub mod enrollment;
pub mod lesson;
pub mod user;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_sessions::Session;
use tracing::error;
use utoipa::{OpenApi, ToSchema};

use crate::{
    config::PaginationConfig,
    error::{Error, Result},
    pagination::{PageQuery, PageRequest},
    user::{UserInfo, get_user},
};

/// Session key holding the logged in user's id.
pub const USER_ID_KEY: &str = "user_id";

pub struct AppState {
    pub database: SqlitePool,
    pub pagination: PaginationConfig,
}

impl AppState {
    pub fn new(database: SqlitePool, pagination: PaginationConfig) -> Self {
        Self {
            database,
            pagination,
        }
    }

    pub fn page(&self, query: &PageQuery) -> Result<PageRequest> {
        query.resolve(self.pagination)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusRequest {
    pub status: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_)
            | Error::InvalidStatus(_)
            | Error::AlreadyEnrolled
            | Error::AlreadyCompleted
            | Error::AlreadyReviewed => StatusCode::BAD_REQUEST,
            Error::Unauthorized | Error::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::UniqueConstraintViolation(_) => StatusCode::CONFLICT,
            Error::TransactionAborted(_) | Error::Database(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            error!("request failed: {:?}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(Message { message })).into_response()
    }
}

/// Resolves the session to an active user, `Unauthorized` otherwise.
pub async fn current_user(session: &Session, database: &SqlitePool) -> Result<UserInfo> {
    let user_id = session
        .get::<i64>(USER_ID_KEY)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read session: {}", e))?
        .ok_or(Error::Unauthorized)?;
    match get_user(database, user_id).await {
        Ok(user) if user.is_active => Ok(user),
        Ok(_) | Err(Error::NotFound(_)) => Err(Error::Unauthorized),
        Err(e) => Err(e),
    }
}

/// Every route under `/api`. The session layer is added by the caller.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest(
            "/api",
            Router::new()
                .merge(user::get_user_scope())
                .merge(course::get_course_scope())
                .merge(lesson::get_lesson_scope())
                .merge(enrollment::get_enrollment_scope()),
        )
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    info(title = "course server", version = "0.1.0"),
    paths(
        user::register,
        user::login,
        user::logout,
        user::profile,
        user::list_users,
        course::list_courses,
        course::list_instructor_courses,
        course::list_categories,
        course::create_course,
        course::get_course,
        course::set_course_status,
        course::delete_course,
        course::list_reviews,
        course::create_review,
        course::rating_summary,
        course::course_progress,
        lesson::list_lessons,
        lesson::list_instructor_lessons,
        lesson::list_course_lessons,
        lesson::create_lesson,
        lesson::update_lesson,
        lesson::delete_lesson,
        lesson::record_progress,
        enrollment::list_enrollments,
        enrollment::list_instructor_enrollments,
        enrollment::create_enrollment,
        enrollment::update_enrollment,
    ),
    components(schemas(Message, StatusRequest))
)]
pub struct ApiDoc;

pub fn get_openapi_json() -> anyhow::Result<String> {
    Ok(ApiDoc::openapi().to_pretty_json()?)
}
