use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    db::begin_write,
    enrollment::{self, EnrollmentStatus},
    error::{Error, Result},
    lesson,
    utils::now_utc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    NotStarted,
    InProgress,
    Completed,
}

/// Tracks a student's progress through one lesson
#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct LessonProgress {
    pub id: i64,
    pub student_id: i64,
    pub lesson_id: i64,
    /// Percentage complete, 0.00 to 100.00
    pub progress: f64,
    pub completed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl LessonProgress {
    pub fn status(&self) -> LessonStatus {
        if self.completed {
            LessonStatus::Completed
        } else if self.progress > 0.0 {
            LessonStatus::InProgress
        } else {
            LessonStatus::NotStarted
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ProgressUpdate {
    pub progress: f64,
    /// Defaults to `progress >= 100`
    pub completed: Option<bool>,
}

/// Aggregated view of a student's progress through a course
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema, sqlx::FromRow)]
pub struct CourseProgress {
    pub course_id: i64,
    pub total_lessons: i64,
    pub completed_lessons: i64,
    /// Mean of the per-lesson percentages, lessons never opened count as 0
    pub average_progress: f64,
}

impl CourseProgress {
    pub fn is_complete(&self) -> bool {
        self.total_lessons > 0 && self.completed_lessons == self.total_lessons
    }
}

/// Two decimals, as the percentage is presented.
fn round_percent(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub async fn record_progress(
    database: &SqlitePool,
    student_id: i64,
    lesson_id: i64,
    update: ProgressUpdate,
) -> Result<LessonProgress> {
    if !update.progress.is_finite() || !(0.0..=100.0).contains(&update.progress) {
        return Err(Error::Validation("progress must be between 0 and 100".into()));
    }
    let progress = round_percent(update.progress);
    let completed = update.completed.unwrap_or(progress >= 100.0);

    let mut tx = begin_write(database).await.map_err(Error::aborted)?;
    let lesson = lesson::get_lesson(&mut *tx, lesson_id).await?;
    match enrollment::enrollment_status(&mut *tx, student_id, lesson.course_id).await? {
        Some(EnrollmentStatus::Active) => {}
        _ => {
            return Err(Error::Validation(
                "an active enrollment in the course is required".into(),
            ));
        }
    }

    let recorded = sqlx::query_as::<_, LessonProgress>(
        r#"
        insert into lesson_progress (student_id, lesson_id, progress, completed, updated_at)
        values (?, ?, ?, ?, ?)
        on conflict (student_id, lesson_id) do update set
            progress = excluded.progress,
            completed = excluded.completed,
            updated_at = excluded.updated_at
        returning id, student_id, lesson_id, progress, completed, updated_at
        "#,
    )
    .bind(student_id)
    .bind(lesson_id)
    .bind(progress)
    .bind(completed)
    .bind(now_utc())
    .fetch_one(&mut *tx)
    .await
    .map_err(Error::aborted)?;
    tx.commit().await.map_err(Error::aborted)?;
    info!(
        "student {} lesson {} progress {:.2} ({:?})",
        student_id,
        lesson_id,
        recorded.progress,
        recorded.status()
    );
    Ok(recorded)
}

pub async fn course_progress(
    database: &SqlitePool,
    student_id: i64,
    course_id: i64,
) -> Result<CourseProgress> {
    let exists: Option<i64> = sqlx::query_scalar("select id from course where id = ?")
        .bind(course_id)
        .fetch_optional(database)
        .await?;
    if exists.is_none() {
        return Err(Error::NotFound("course"));
    }
    let summary = sqlx::query_as::<_, CourseProgress>(
        r#"
        select ? as course_id,
               count(l.id) as total_lessons,
               coalesce(sum(case when lp.completed then 1 else 0 end), 0) as completed_lessons,
               coalesce(avg(coalesce(lp.progress, 0.0)), 0.0) as average_progress
        from lesson l
        left join lesson_progress lp on lp.lesson_id = l.id and lp.student_id = ?
        where l.course_id = ?
        "#,
    )
    .bind(course_id)
    .bind(student_id)
    .bind(course_id)
    .fetch_one(database)
    .await?;
    Ok(CourseProgress {
        average_progress: round_percent(summary.average_progress),
        ..summary
    })
}
