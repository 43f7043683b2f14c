use std::sync::LazyLock;

use argon2::{
    Argon2, PasswordVerifier,
    password_hash::{PasswordHash, PasswordHasher, SaltString, rand_core::OsRng},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    error::{Error, Result},
    pagination::{Page, PageRequest},
    role::Role,
    utils::{normalize_email, now_utc},
};

const MIN_PASSWORD_LEN: usize = 8;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct UserInfo {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UserInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewUser {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();
    Ok(password_hash)
}

async fn insert_user(database: &SqlitePool, user: NewUser) -> Result<UserInfo> {
    let email = normalize_email(&user.email);
    if !EMAIL_RE.is_match(&email) {
        return Err(Error::Validation(format!("invalid email: {}", email)));
    }
    if user.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let password_hash = hash_password(&user.password)?;
    let created = sqlx::query_as::<_, UserInfo>(
        r#"
        insert into user (email, first_name, last_name, password, role, is_active, created_at)
        values (?, ?, ?, ?, ?, 1, ?)
        returning id, email, first_name, last_name, role, is_active, created_at
        "#,
    )
    .bind(&email)
    .bind(user.first_name.trim())
    .bind(user.last_name.trim())
    .bind(password_hash)
    .bind(user.role)
    .bind(now_utc())
    .fetch_one(database)
    .await
    .map_err(|e| match Error::from(e) {
        Error::UniqueConstraintViolation(_) => {
            Error::Conflict(format!("email already registered: {}", email))
        }
        other => other,
    })?;
    info!("user {} registered as {}", created.id, created.role);
    Ok(created)
}

/// Self-service registration; admins can only be created through [`create_admin`].
pub async fn register(database: &SqlitePool, user: NewUser) -> Result<UserInfo> {
    if user.role == Role::Admin {
        return Err(Error::Validation("cannot register as admin".into()));
    }
    insert_user(database, user).await
}

pub async fn create_admin(
    database: &SqlitePool,
    email: String,
    password: String,
    first_name: String,
    last_name: String,
) -> Result<UserInfo> {
    insert_user(
        database,
        NewUser {
            first_name,
            last_name,
            email,
            password,
            role: Role::Admin,
        },
    )
    .await
}

pub async fn login(database: &SqlitePool, email: &str, password: &str) -> Result<i64> {
    let email = normalize_email(email);
    let Some((id, stored, is_active)) = sqlx::query_as::<_, (i64, String, bool)>(
        "select id, password, is_active from user where email = ?",
    )
    .bind(&email)
    .fetch_optional(database)
    .await?
    else {
        return Err(Error::InvalidCredentials);
    };
    if !is_active {
        return Err(Error::InvalidCredentials);
    }
    let parsed_hash = PasswordHash::new(&stored)
        .map_err(|e| anyhow::anyhow!("Failed to parse password hash: {}", e))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| Error::InvalidCredentials)?;
    Ok(id)
}

pub async fn get_user(database: &SqlitePool, id: i64) -> Result<UserInfo> {
    sqlx::query_as::<_, UserInfo>(
        "select id, email, first_name, last_name, role, is_active, created_at from user where id = ?",
    )
    .bind(id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("user"))
}

pub async fn list_users(database: &SqlitePool, page: PageRequest) -> Result<Page<UserInfo>> {
    let count: i64 = sqlx::query_scalar("select count(*) from user where is_active = 1")
        .fetch_one(database)
        .await?;
    let users = sqlx::query_as::<_, UserInfo>(
        r#"
        select id, email, first_name, last_name, role, is_active, created_at
        from user where is_active = 1
        order by id
        limit ? offset ?
        "#,
    )
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(database)
    .await?;
    Page::new(page, count, users)
}
