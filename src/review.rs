use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    db::begin_write,
    enrollment::{self, EnrollmentStatus},
    error::{Error, Result},
    pagination::{Page, PageRequest},
    utils::now_utc,
};

#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct Review {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub rating: i64,
    pub comment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct ReviewView {
    pub id: i64,
    pub student: String,
    pub rating: i64,
    pub comment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewReview {
    pub rating: i64,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema, sqlx::FromRow)]
pub struct RatingSummary {
    pub count: i64,
    pub average: Option<f64>,
}

pub async fn create_review(
    database: &SqlitePool,
    student_id: i64,
    course_id: i64,
    review: NewReview,
) -> Result<Review> {
    if !(1..=5).contains(&review.rating) {
        return Err(Error::Validation("rating must be between 1 and 5".into()));
    }
    let mut tx = begin_write(database).await.map_err(Error::aborted)?;
    match enrollment::enrollment_status(&mut *tx, student_id, course_id).await? {
        Some(EnrollmentStatus::Active | EnrollmentStatus::Completed) => {}
        _ => {
            return Err(Error::Validation(
                "only enrolled students can review a course".into(),
            ));
        }
    }
    let created = sqlx::query_as::<_, Review>(
        r#"
        insert into review (student_id, course_id, rating, comment, created_at)
        values (?, ?, ?, ?, ?)
        returning id, student_id, course_id, rating, comment, created_at
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .bind(review.rating)
    .bind(review.comment.trim())
    .bind(now_utc())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match Error::aborted(e) {
        Error::UniqueConstraintViolation(_) => Error::AlreadyReviewed,
        other => other,
    })?;
    tx.commit().await.map_err(Error::aborted)?;
    info!(
        "student {} rated course {} with {}",
        student_id, course_id, created.rating
    );
    Ok(created)
}

/// Reviews of a course, newest first.
pub async fn list_reviews(
    database: &SqlitePool,
    course_id: i64,
    page: PageRequest,
) -> Result<Page<ReviewView>> {
    let count: i64 = sqlx::query_scalar("select count(*) from review where course_id = ?")
        .bind(course_id)
        .fetch_one(database)
        .await?;
    let reviews = sqlx::query_as::<_, ReviewView>(
        r#"
        select r.id, trim(u.first_name || ' ' || u.last_name) as student,
               r.rating, r.comment, r.created_at
        from review r
        join user u on u.id = r.student_id
        where r.course_id = ?
        order by r.created_at desc, r.id desc
        limit ? offset ?
        "#,
    )
    .bind(course_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(database)
    .await?;
    Page::new(page, count, reviews)
}

pub async fn rating_summary(database: &SqlitePool, course_id: i64) -> Result<RatingSummary> {
    let summary = sqlx::query_as::<_, RatingSummary>(
        "select count(*) as count, avg(rating) as average from review where course_id = ?",
    )
    .bind(course_id)
    .fetch_one(database)
    .await?;
    Ok(summary)
}
