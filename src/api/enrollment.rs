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
use utoipa::{IntoParams, ToSchema};

use super::{AppState, Message, StatusRequest, current_user};
use crate::{
    enrollment::{self as enrollments, EnrollOutcome, Enrollment, EnrollmentView},
    error::{Error, Result},
    pagination::{Page, PageQuery},
    role::{Permission, authorize},
    user,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EnrollmentFilter {
    /// Substring of the course title
    pub search_term: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct EnrollRequest {
    pub course_id: i64,
    /// Admins only; defaults to the logged in student
    pub student_id: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/enrollments/list",
    params(EnrollmentFilter, PageQuery),
    responses(
        (status = 200, description = "The student's active and completed enrollments", body = Page<EnrollmentView>),
        (status = 403, description = "Students only", body = Message)
    )
)]
pub async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(filter): Query<EnrollmentFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<EnrollmentView>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ListMyEnrollments)?;
    let page = state.page(&page)?;
    Ok(Json(
        enrollments::list_student_enrollments(
            &state.database,
            user.id,
            filter.search_term.as_deref(),
            page,
        )
        .await?,
    ))
}

#[utoipa::path(
    get,
    path = "/api/enrollments/list_by_instructor",
    params(EnrollmentFilter, PageQuery),
    responses(
        (status = 200, description = "Enrollments in the instructor's courses", body = Page<EnrollmentView>),
        (status = 403, description = "Instructors only", body = Message)
    )
)]
pub async fn list_instructor_enrollments(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(filter): Query<EnrollmentFilter>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<EnrollmentView>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ListCourseEnrollments)?;
    let page = state.page(&page)?;
    Ok(Json(
        enrollments::list_instructor_enrollments(
            &state.database,
            user.id,
            filter.search_term.as_deref(),
            page,
        )
        .await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/enrollments/create",
    request_body = EnrollRequest,
    responses(
        (status = 201, description = "Enrolled", body = Enrollment),
        (status = 200, description = "Cancelled enrollment reactivated", body = Enrollment),
        (status = 400, description = "Already enrolled, completed or course closed", body = Message),
        (status = 403, description = "Forbidden", body = Message),
        (status = 404, description = "No such course", body = Message)
    )
)]
pub async fn create_enrollment(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<EnrollRequest>,
) -> Result<impl IntoResponse> {
    let current = current_user(&session, &state.database).await?;
    let student_id = match req.student_id {
        Some(id) if id != current.id => {
            authorize(current.role, Permission::EnrollOthers)?;
            let student = user::get_user(&state.database, id).await?;
            if !student.role.allows(Permission::EnrollSelf) || !student.is_active {
                return Err(Error::Validation("only active students can enroll".into()));
            }
            id
        }
        _ => {
            authorize(current.role, Permission::EnrollSelf)?;
            current.id
        }
    };
    let outcome = enrollments::enroll(&state.database, student_id, req.course_id).await?;
    let status = match outcome {
        EnrollOutcome::Created(_) => StatusCode::CREATED,
        EnrollOutcome::Reactivated(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome.into_inner())))
}

#[utoipa::path(
    patch,
    path = "/api/enrollments/update/{id}",
    params(("id" = i64, Path, description = "Enrollment id")),
    request_body = StatusRequest,
    responses(
        (status = 200, description = "Status changed", body = Enrollment),
        (status = 400, description = "Unknown status", body = Message),
        (status = 403, description = "Forbidden", body = Message),
        (status = 404, description = "No such enrollment, or it is cancelled", body = Message)
    )
)]
pub async fn update_enrollment(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Enrollment>> {
    let user = current_user(&session, &state.database).await?;
    let detail = enrollments::get_enrollment(&state.database, id).await?;
    let allowed = user.role.allows(Permission::ManageAnyEnrollment)
        || (user.role.allows(Permission::ManageOwnCourses) && detail.instructor_id == user.id)
        || (user.role.allows(Permission::EnrollSelf) && detail.enrollment.student_id == user.id);
    if !allowed {
        return Err(Error::Forbidden);
    }
    Ok(Json(
        enrollments::update_status(&state.database, id, &req.status).await?,
    ))
}

pub fn get_enrollment_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/enrollments",
        Router::new()
            .route("/list", get(list_enrollments))
            .route("/list_by_instructor", get(list_instructor_enrollments))
            .route("/create", post(create_enrollment))
            .route("/update/{id}", patch(update_enrollment)),
    )
}
