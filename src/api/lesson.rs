use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use tower_sessions::Session;
use utoipa::ToSchema;

use super::{AppState, Message, course::owned_course, current_user};
use crate::{
    course,
    error::Result,
    lesson::{self as lessons, Lesson, LessonView, NewLesson},
    pagination::{Page, PageQuery},
    progress::{self, LessonProgress, ProgressUpdate},
    role::{Permission, authorize},
};

#[derive(Deserialize, ToSchema)]
pub struct CreateLessonRequest {
    pub course_id: i64,
    #[serde(flatten)]
    pub lesson: NewLesson,
}

#[utoipa::path(
    get,
    path = "/api/lessons/list",
    params(PageQuery),
    responses(
        (status = 200, description = "Every lesson, by course and position", body = Page<LessonView>),
        (status = 403, description = "Admins only", body = Message)
    )
)]
pub async fn list_lessons(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<LessonView>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ListAllLessons)?;
    let page = state.page(&page)?;
    Ok(Json(lessons::list_lessons(&state.database, page).await?))
}

#[utoipa::path(
    get,
    path = "/api/lessons/list_by_instructor",
    params(PageQuery),
    responses(
        (status = 200, description = "Lessons of the instructor's courses", body = Page<LessonView>),
        (status = 403, description = "Forbidden", body = Message)
    )
)]
pub async fn list_instructor_lessons(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<LessonView>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ManageOwnCourses)?;
    let page = state.page(&page)?;
    Ok(Json(
        lessons::list_instructor_lessons(&state.database, user.id, page).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/api/lessons/by_course/{course_id}",
    params(("course_id" = i64, Path, description = "Course id"), PageQuery),
    responses(
        (status = 200, description = "Lessons of the course in position order", body = Page<LessonView>),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn list_course_lessons(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(course_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<LessonView>>> {
    current_user(&session, &state.database).await?;
    let page = state.page(&page)?;
    course::get_course(&state.database, course_id).await?;
    Ok(Json(
        lessons::list_course_lessons(&state.database, course_id, page).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/lessons/create",
    request_body = CreateLessonRequest,
    responses(
        (status = 201, description = "Lesson appended to the course", body = Lesson),
        (status = 400, description = "Invalid lesson", body = Message),
        (status = 403, description = "Not the course owner", body = Message),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn create_lesson(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<CreateLessonRequest>,
) -> Result<impl IntoResponse> {
    let user = current_user(&session, &state.database).await?;
    owned_course(&state, &user, req.course_id).await?;
    let lesson = lessons::add_lesson(&state.database, req.course_id, req.lesson).await?;
    Ok((StatusCode::CREATED, Json(lesson)))
}

#[utoipa::path(
    put,
    path = "/api/lessons/update/{id}",
    params(("id" = i64, Path, description = "Lesson id")),
    request_body = NewLesson,
    responses(
        (status = 200, description = "Lesson updated, position kept", body = Lesson),
        (status = 403, description = "Not the course owner", body = Message),
        (status = 404, description = "No such lesson", body = Message)
    )
)]
pub async fn update_lesson(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
    Json(req): Json<NewLesson>,
) -> Result<Json<Lesson>> {
    let user = current_user(&session, &state.database).await?;
    let lesson = lessons::get_lesson(&state.database, id).await?;
    owned_course(&state, &user, lesson.course_id).await?;
    Ok(Json(lessons::update_lesson(&state.database, id, req).await?))
}

#[utoipa::path(
    delete,
    path = "/api/lessons/delete/{id}",
    params(("id" = i64, Path, description = "Lesson id")),
    responses(
        (status = 200, description = "Lesson deleted", body = Message),
        (status = 403, description = "Not the course owner", body = Message),
        (status = 404, description = "No such lesson", body = Message)
    )
)]
pub async fn delete_lesson(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Json<Message>> {
    let user = current_user(&session, &state.database).await?;
    let lesson = lessons::get_lesson(&state.database, id).await?;
    owned_course(&state, &user, lesson.course_id).await?;
    lessons::delete_lesson(&state.database, id).await?;
    Ok(Message::new("Lesson deleted"))
}

#[utoipa::path(
    post,
    path = "/api/lessons/{id}/progress",
    params(("id" = i64, Path, description = "Lesson id")),
    request_body = ProgressUpdate,
    responses(
        (status = 200, description = "Progress stored", body = LessonProgress),
        (status = 400, description = "Invalid percentage or no active enrollment", body = Message),
        (status = 403, description = "Students only", body = Message),
        (status = 404, description = "No such lesson", body = Message)
    )
)]
pub async fn record_progress(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
    Json(req): Json<ProgressUpdate>,
) -> Result<Json<LessonProgress>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::TrackProgress)?;
    Ok(Json(
        progress::record_progress(&state.database, user.id, id, req).await?,
    ))
}

pub fn get_lesson_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/lessons",
        Router::new()
            .route("/list", get(list_lessons))
            .route("/list_by_instructor", get(list_instructor_lessons))
            .route("/by_course/{course_id}", get(list_course_lessons))
            .route("/create", post(create_lesson))
            .route("/update/{id}", put(update_lesson))
            .route("/delete/{id}", delete(delete_lesson))
            .route("/{id}/progress", post(record_progress)),
    )
}
