use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;
use utoipa::ToSchema;

use super::{AppState, Message, USER_ID_KEY, current_user};
use crate::{
    error::Result,
    pagination::{Page, PageQuery},
    role::{Permission, authorize},
    user::{self as users, NewUser, UserInfo},
};

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/users/register",
    request_body = NewUser,
    responses(
        (status = 201, description = "User created", body = UserInfo),
        (status = 400, description = "Invalid registration data", body = Message),
        (status = 409, description = "Email already registered", body = Message)
    )
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewUser>,
) -> Result<impl IntoResponse> {
    let user = users::register(&state.database, req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/api/users/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = UserInfo),
        (status = 401, description = "Invalid credentials", body = Message)
    )
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<LoginRequest>,
) -> Result<Json<UserInfo>> {
    let LoginRequest { email, password } = req;
    let id = users::login(&state.database, &email, &password).await?;
    // new session id on privilege change
    session
        .cycle_id()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to cycle session: {}", e))?;
    session
        .insert(USER_ID_KEY, id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write session: {}", e))?;
    info!("user {} logged in", id);
    Ok(Json(users::get_user(&state.database, id).await?))
}

#[utoipa::path(
    post,
    path = "/api/users/logout",
    responses(
        (status = 200, description = "Logout successful", body = Message),
        (status = 500, description = "Session could not be removed", body = Message)
    )
)]
pub async fn logout(session: Session) -> Result<Json<Message>> {
    session
        .flush()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to remove session: {}", e))?;
    Ok(Message::new("Logout successful"))
}

#[utoipa::path(
    get,
    path = "/api/users/profile",
    responses(
        (status = 200, description = "The logged in user", body = UserInfo),
        (status = 401, description = "Unauthorized", body = Message)
    )
)]
pub async fn profile(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Json<UserInfo>> {
    Ok(Json(current_user(&session, &state.database).await?))
}

#[utoipa::path(
    get,
    path = "/api/users/list",
    params(PageQuery),
    responses(
        (status = 200, description = "Active users", body = Page<UserInfo>),
        (status = 401, description = "Unauthorized", body = Message),
        (status = 403, description = "Admins only", body = Message)
    )
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<UserInfo>>> {
    let user = current_user(&session, &state.database).await?;
    authorize(user.role, Permission::ListUsers)?;
    let page = state.page(&page)?;
    Ok(Json(users::list_users(&state.database, page).await?))
}

pub fn get_user_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/users",
        Router::new()
            .route("/register", post(register))
            .route("/login", post(login))
            .route("/logout", post(logout))
            .route("/profile", get(profile))
            .route("/list", get(list_users)),
    )
}
