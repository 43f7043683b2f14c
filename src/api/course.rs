use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::Deserialize;
use tower_sessions::Session;
use utoipa::ToSchema;

use super::{AppState, Message, StatusRequest, current_user};
use crate::{
    course::{
        self as courses, Category, Course, CourseFilter, CourseStatus, CourseView,
        CourseWithLessons, NewCourse,
    },
    error::{Error, Result},
    lesson::NewLesson,
    pagination::{Page, PageQuery},
    progress::{self, CourseProgress},
    review::{self, NewReview, RatingSummary, Review, ReviewView},
    role::{Permission, authorize, authorize_course_owner},
    user::UserInfo,
};

#[derive(Deserialize, ToSchema)]
pub struct CreateCourseRequest {
    #[serde(flatten)]
    pub course: NewCourse,
    /// Stored with positions 1..N in this order
    #[serde(default)]
    pub lessons: Vec<NewLesson>,
}

/// Loads a course the user may manage.
pub(super) async fn owned_course(state: &AppState, user: &UserInfo, id: i64) -> Result<Course> {
    let course = courses::find_course(&state.database, id)
        .await?
        .filter(|c| c.is_active)
        .ok_or(Error::NotFound("course"))?;
    authorize_course_owner(user.role, user.id, course.instructor_id)?;
    Ok(course)
}

#[utoipa::path(
    get,
    path = "/api/courses/list",
    params(CourseFilter, PageQuery),
    responses(
        (status = 200, description = "Published courses", body = Page<CourseView>),
        (status = 401, description = "Unauthorized", body = Message)
    )
)]
pub async fn list_courses(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(filter): Query<CourseFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<CourseView>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ListCourses)?;
    let page = state.page(&page)?;
    Ok(Json(courses::list_courses(&state.database, &filter, page).await?))
}

#[utoipa::path(
    get,
    path = "/api/courses/list_by_instructor",
    params(PageQuery),
    responses(
        (status = 200, description = "Courses owned by the logged in instructor", body = Page<CourseView>),
        (status = 401, description = "Unauthorized", body = Message),
        (status = 403, description = "Forbidden", body = Message)
    )
)]
pub async fn list_instructor_courses(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<CourseView>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ManageOwnCourses)?;
    let page = state.page(&page)?;
    Ok(Json(
        courses::list_instructor_courses(&state.database, user.id, page).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/api/courses/categories",
    responses(
        (status = 200, description = "Course categories", body = Vec<Category>)
    )
)]
pub async fn list_categories(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Category>>> {
    Ok(Json(courses::list_categories(&state.database).await?))
}

#[utoipa::path(
    post,
    path = "/api/courses/create",
    request_body = CreateCourseRequest,
    responses(
        (status = 201, description = "Course created with its lessons", body = CourseWithLessons),
        (status = 400, description = "Invalid course data", body = Message),
        (status = 403, description = "Forbidden", body = Message)
    )
)]
pub async fn create_course(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<CreateCourseRequest>,
) -> Result<impl IntoResponse> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::CreateCourse)?;
    let created =
        courses::create_course_with_lessons(&state.database, user.id, req.course, req.lessons)
            .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course detail", body = CourseView),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn get_course(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Json<CourseView>> {
    current_user(&session, &state.database).await?;
    Ok(Json(courses::get_course(&state.database, id).await?))
}

#[utoipa::path(
    patch,
    path = "/api/courses/{id}/status",
    params(("id" = i64, Path, description = "Course id")),
    request_body = StatusRequest,
    responses(
        (status = 200, description = "Status changed", body = Course),
        (status = 400, description = "Unknown status", body = Message),
        (status = 403, description = "Not the course owner", body = Message),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn set_course_status(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Course>> {
    let user = current_user(&session, &state.database).await?;
    let status: CourseStatus = req.status.parse()?;
    owned_course(&state, &user, id).await?;
    Ok(Json(
        courses::set_course_status(&state.database, id, status).await?,
    ))
}

#[utoipa::path(
    delete,
    path = "/api/courses/{id}",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course deactivated", body = Message),
        (status = 403, description = "Not the course owner", body = Message),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn delete_course(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Json<Message>> {
    let user = current_user(&session, &state.database).await?;
    owned_course(&state, &user, id).await?;
    courses::deactivate_course(&state.database, id).await?;
    Ok(Message::new("Course deactivated"))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}/reviews",
    params(("id" = i64, Path, description = "Course id"), PageQuery),
    responses(
        (status = 200, description = "Reviews, newest first", body = Page<ReviewView>),
        (status = 404, description = "No such course or page", body = Message)
    )
)]
pub async fn list_reviews(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<ReviewView>>> {
    current_user(&session, &state.database).await?;
    let page = state.page(&page)?;
    courses::get_course(&state.database, id).await?;
    Ok(Json(review::list_reviews(&state.database, id, page).await?))
}

#[utoipa::path(
    post,
    path = "/api/courses/{id}/reviews",
    params(("id" = i64, Path, description = "Course id")),
    request_body = NewReview,
    responses(
        (status = 201, description = "Review stored", body = Review),
        (status = 400, description = "Invalid rating, not enrolled or already reviewed", body = Message),
        (status = 403, description = "Students only", body = Message)
    )
)]
pub async fn create_review(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
    Json(req): Json<NewReview>,
) -> Result<impl IntoResponse> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::WriteReview)?;
    let created = review::create_review(&state.database, user.id, id, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}/rating",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Review count and average rating", body = RatingSummary),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn rating_summary(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Json<RatingSummary>> {
    current_user(&session, &state.database).await?;
    courses::get_course(&state.database, id).await?;
    Ok(Json(review::rating_summary(&state.database, id).await?))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}/progress",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "The student's progress through the course", body = CourseProgress),
        (status = 403, description = "Students only", body = Message),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn course_progress(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Json<CourseProgress>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::TrackProgress)?;
    Ok(Json(
        progress::course_progress(&state.database, user.id, id).await?,
    ))
}

pub fn get_course_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/courses",
        Router::new()
            .route("/list", get(list_courses))
            .route("/list_by_instructor", get(list_instructor_courses))
            .route("/categories", get(list_categories))
            .route("/create", post(create_course))
            .route("/{id}", get(get_course).delete(delete_course))
            .route("/{id}/status", patch(set_course_status))
            .route("/{id}/reviews", get(list_reviews).post(create_review))
            .route("/{id}/rating", get(rating_summary))
            .route("/{id}/progress", get(course_progress)),
    )
}
