//! Enrollment lifecycle.
//!
//! - no record: `enroll` creates it `active`.
//! - `cancelled`: `enroll` reactivates it; `update_status` does not see it.
//! - `active` / `completed`: `enroll` is rejected; `update_status` may set
//!   any of the three statuses.
//!
//! There is never more than one row per (student, course).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    course::CourseStatus,
    db::begin_write,
    error::{Error, Result, retry_on_conflict},
    pagination::{Page, PageRequest},
    utils::now_utc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "completed" => Ok(EnrollmentStatus::Completed),
            "cancelled" => Ok(EnrollmentStatus::Cancelled),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema, sqlx::FromRow)]
pub struct Enrollment {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub status: EnrollmentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
}

/// Listing shape: student name and course title instead of bare ids.
#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct EnrollmentView {
    pub id: i64,
    pub student_id: i64,
    pub student: String,
    pub course_id: i64,
    pub course: String,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
    pub status: EnrollmentStatus,
}

/// An enrollment together with the instructor owning its course.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnrollmentDetail {
    #[sqlx(flatten)]
    pub enrollment: Enrollment,
    pub instructor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Created(Enrollment),
    Reactivated(Enrollment),
}

impl EnrollOutcome {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            EnrollOutcome::Created(e) | EnrollOutcome::Reactivated(e) => e,
        }
    }

    pub fn into_inner(self) -> Enrollment {
        match self {
            EnrollOutcome::Created(e) | EnrollOutcome::Reactivated(e) => e,
        }
    }
}

const ENROLLMENT_COLUMNS: &str = "id, student_id, course_id, status, enrolled_at";

const VIEW_SELECT: &str = r#"
    select e.id, e.student_id, trim(u.first_name || ' ' || u.last_name) as student,
           e.course_id, c.title as course, e.enrolled_at, e.status
    from enrollment e
    join user u on u.id = e.student_id
    join course c on c.id = e.course_id
"#;

const VIEW_COUNT: &str = r#"
    select count(*)
    from enrollment e
    join course c on c.id = e.course_id
"#;

async fn try_enroll(database: &SqlitePool, student_id: i64, course_id: i64) -> Result<EnrollOutcome> {
    // the existing-record read below must not go stale before the write
    let mut tx = begin_write(database).await.map_err(Error::aborted)?;

    let course: Option<(bool, CourseStatus)> =
        sqlx::query_as("select is_active, status from course where id = ?")
            .bind(course_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::aborted)?;
    match course {
        Some((true, CourseStatus::Published)) => {}
        Some((true, _)) => {
            return Err(Error::Validation(
                "course is not open for enrollment".into(),
            ));
        }
        _ => return Err(Error::NotFound("course")),
    }

    let existing = sqlx::query_as::<_, Enrollment>(&format!(
        "select {ENROLLMENT_COLUMNS} from enrollment where student_id = ? and course_id = ?"
    ))
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(Error::aborted)?;

    let outcome = match existing {
        None => {
            // unique constraint backstop; the caller retries once
            let created = sqlx::query_as::<_, Enrollment>(&format!(
                r#"
                insert into enrollment (student_id, course_id, status, enrolled_at)
                values (?, ?, 'active', ?)
                returning {ENROLLMENT_COLUMNS}
                "#
            ))
            .bind(student_id)
            .bind(course_id)
            .bind(now_utc())
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::aborted)?;
            EnrollOutcome::Created(created)
        }
        Some(e) => match e.status {
            EnrollmentStatus::Active => return Err(Error::AlreadyEnrolled),
            EnrollmentStatus::Completed => return Err(Error::AlreadyCompleted),
            EnrollmentStatus::Cancelled => {
                let reactivated = sqlx::query_as::<_, Enrollment>(&format!(
                    r#"
                    update enrollment set status = 'active'
                    where id = ? and status = 'cancelled'
                    returning {ENROLLMENT_COLUMNS}
                    "#
                ))
                .bind(e.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::aborted)?
                .ok_or_else(|| Error::Conflict("enrollment changed concurrently".into()))?;
                EnrollOutcome::Reactivated(reactivated)
            }
        },
    };
    tx.commit().await.map_err(Error::aborted)?;
    Ok(outcome)
}

/// Enrolls a student, creating the record or reactivating a cancelled one.
pub async fn enroll(database: &SqlitePool, student_id: i64, course_id: i64) -> Result<EnrollOutcome> {
    let outcome = retry_on_conflict(move || try_enroll(database, student_id, course_id)).await?;
    match &outcome {
        EnrollOutcome::Created(e) => {
            info!("student {} enrolled in course {} ({})", student_id, course_id, e.id)
        }
        EnrollOutcome::Reactivated(e) => {
            info!("student {} re-enrolled in course {} ({})", student_id, course_id, e.id)
        }
    }
    Ok(outcome)
}

/// Overwrites the status of an active or completed enrollment.
/// Cancelled and missing enrollments are both reported as not found.
pub async fn update_status(
    database: &SqlitePool,
    enrollment_id: i64,
    new_status: &str,
) -> Result<Enrollment> {
    let status: EnrollmentStatus = new_status.parse()?;
    let updated = sqlx::query_as::<_, Enrollment>(&format!(
        r#"
        update enrollment set status = ?
        where id = ? and status in ('active', 'completed')
        returning {ENROLLMENT_COLUMNS}
        "#
    ))
    .bind(status)
    .bind(enrollment_id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("enrollment"))?;
    info!("enrollment {} is now {}", enrollment_id, status);
    Ok(updated)
}

pub async fn get_enrollment(database: &SqlitePool, id: i64) -> Result<EnrollmentDetail> {
    sqlx::query_as::<_, EnrollmentDetail>(
        r#"
        select e.id, e.student_id, e.course_id, e.status, e.enrolled_at, c.instructor_id
        from enrollment e
        join course c on c.id = e.course_id
        where e.id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("enrollment"))
}

pub async fn get_enrollment_view(database: &SqlitePool, id: i64) -> Result<EnrollmentView> {
    sqlx::query_as::<_, EnrollmentView>(&format!("{VIEW_SELECT} where e.id = ?"))
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or(Error::NotFound("enrollment"))
}

/// Status of the student's enrollment in a course, if any.
pub async fn enrollment_status(
    executor: impl SqliteExecutor<'_>,
    student_id: i64,
    course_id: i64,
) -> Result<Option<EnrollmentStatus>> {
    let status = sqlx::query_scalar::<_, EnrollmentStatus>(
        "select status from enrollment where student_id = ? and course_id = ?",
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(executor)
    .await?;
    Ok(status)
}

enum Scope {
    Student(i64),
    Instructor(i64),
}

impl Scope {
    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>, search_term: Option<&str>) {
        match self {
            Scope::Student(id) => {
                qb.push(" where e.student_id = ")
                    .push_bind(*id)
                    .push(" and e.status in ('active', 'completed')");
            }
            Scope::Instructor(id) => {
                qb.push(" where c.instructor_id = ").push_bind(*id);
            }
        }
        if let Some(term) = search_term.map(str::trim).filter(|t| !t.is_empty()) {
            qb.push(" and c.title like ").push_bind(format!("%{}%", term));
        }
    }
}

async fn list_scoped(
    database: &SqlitePool,
    scope: Scope,
    search_term: Option<&str>,
    page: PageRequest,
) -> Result<Page<EnrollmentView>> {
    let mut count_qb = QueryBuilder::<Sqlite>::new(VIEW_COUNT);
    scope.push_where(&mut count_qb, search_term);
    let count = count_qb.build_query_scalar::<i64>().fetch_one(database).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(VIEW_SELECT);
    scope.push_where(&mut qb, search_term);
    qb.push(" order by e.enrolled_at desc, e.id desc limit ")
        .push_bind(page.limit())
        .push(" offset ")
        .push_bind(page.offset());
    let enrollments = qb.build_query_as::<EnrollmentView>().fetch_all(database).await?;
    Page::new(page, count, enrollments)
}

/// The student's active and completed enrollments, newest first.
pub async fn list_student_enrollments(
    database: &SqlitePool,
    student_id: i64,
    search_term: Option<&str>,
    page: PageRequest,
) -> Result<Page<EnrollmentView>> {
    list_scoped(database, Scope::Student(student_id), search_term, page).await
}

/// Every enrollment, in any status, of the instructor's courses, newest first.
pub async fn list_instructor_enrollments(
    database: &SqlitePool,
    instructor_id: i64,
    search_term: Option<&str>,
    page: PageRequest,
) -> Result<Page<EnrollmentView>> {
    list_scoped(database, Scope::Instructor(instructor_id), search_term, page).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        course::{
            CourseStatus, create_course_with_lessons,
            tests::{new_course, published_course},
        },
        db::{connect_in_memory, tests::connect_temp},
        role::Role,
        user::tests::create_user,
    };

    struct Fixture {
        database: SqlitePool,
        instructor: i64,
        student: i64,
        course: i64,
    }

    async fn fixture() -> Fixture {
        let database = connect_in_memory().await.unwrap();
        let instructor = create_user(&database, "prof@b.co", Role::Instructor).await;
        let student = create_user(&database, "ana@b.co", Role::Student).await;
        let course = published_course(&database, instructor).await;
        Fixture {
            database,
            instructor,
            student,
            course,
        }
    }

    async fn rows(database: &SqlitePool, student: i64, course: i64) -> i64 {
        sqlx::query_scalar("select count(*) from enrollment where student_id = ? and course_id = ?")
            .bind(student)
            .bind(course)
            .fetch_one(database)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enroll_twice() {
        let f = fixture().await;
        let created = match enroll(&f.database, f.student, f.course).await.unwrap() {
            EnrollOutcome::Created(e) => e,
            other => panic!("expected a new enrollment, got {:?}", other),
        };
        assert_eq!(created.status, EnrollmentStatus::Active);

        assert!(matches!(
            enroll(&f.database, f.student, f.course).await,
            Err(Error::AlreadyEnrolled)
        ));
        let detail = get_enrollment(&f.database, created.id).await.unwrap();
        assert_eq!(detail.enrollment, created);
        assert_eq!(detail.instructor_id, f.instructor);
        assert_eq!(rows(&f.database, f.student, f.course).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_then_reenroll() {
        let f = fixture().await;
        let created = enroll(&f.database, f.student, f.course)
            .await
            .unwrap()
            .into_inner();
        let cancelled = update_status(&f.database, created.id, "cancelled").await.unwrap();
        assert_eq!(cancelled.status, EnrollmentStatus::Cancelled);

        // cancelled is terminal for update_status
        assert!(matches!(
            update_status(&f.database, created.id, "active").await,
            Err(Error::NotFound("enrollment"))
        ));

        let reactivated = match enroll(&f.database, f.student, f.course).await.unwrap() {
            EnrollOutcome::Reactivated(e) => e,
            other => panic!("expected reactivation, got {:?}", other),
        };
        assert_eq!(reactivated.id, created.id);
        assert_eq!(reactivated.status, EnrollmentStatus::Active);
        assert_eq!(reactivated.enrolled_at, created.enrolled_at);
        assert_eq!(rows(&f.database, f.student, f.course).await, 1);
    }

    #[tokio::test]
    async fn test_completed_rejects_enroll() {
        let f = fixture().await;
        let id = enroll(&f.database, f.student, f.course)
            .await
            .unwrap()
            .enrollment()
            .id;
        update_status(&f.database, id, "completed").await.unwrap();
        assert!(matches!(
            enroll(&f.database, f.student, f.course).await,
            Err(Error::AlreadyCompleted)
        ));
        // completed can still move back to active
        let back = update_status(&f.database, id, "active").await.unwrap();
        assert_eq!(back.status, EnrollmentStatus::Active);
    }

    #[tokio::test]
    async fn test_bogus_status_leaves_record() {
        let f = fixture().await;
        let created = enroll(&f.database, f.student, f.course)
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(
            update_status(&f.database, created.id, "bogus").await,
            Err(Error::InvalidStatus(s)) if s == "bogus"
        ));
        let after = get_enrollment(&f.database, created.id).await.unwrap();
        assert_eq!(after.enrollment, created);
        assert!(matches!(
            update_status(&f.database, 999, "completed").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enrolls_keep_one_row() {
        let (_dir, database) = connect_temp().await;
        let instructor = create_user(&database, "prof@b.co", Role::Instructor).await;
        let course = published_course(&database, instructor).await;
        let mut students = Vec::new();
        for i in 0..8 {
            students.push(create_user(&database, &format!("s{i}@b.co"), Role::Student).await);
        }
        let contested = students[0];

        // eight racing for one pair, seven more enrolling other students at the same time
        let pairs = std::iter::repeat_n(contested, 8).chain(students[1..].iter().copied());
        let tasks = pairs.map(|student| {
            let database = database.clone();
            tokio::spawn(async move { (student, enroll(&database, student, course).await) })
        });
        let results: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        for (student, result) in &results {
            match result {
                Ok(EnrollOutcome::Created(e)) => assert_eq!(e.student_id, *student),
                Err(Error::AlreadyEnrolled) => assert_eq!(*student, contested),
                other => panic!("unexpected enroll result for {student}: {other:?}"),
            }
        }
        let created = results
            .iter()
            .filter(|(student, r)| *student == contested && matches!(r, Ok(EnrollOutcome::Created(_))))
            .count();
        assert_eq!(created, 1);
        for student in &students {
            assert_eq!(rows(&database, *student, course).await, 1);
        }
    }

    #[tokio::test]
    async fn test_course_must_be_open() {
        let f = fixture().await;
        assert!(matches!(
            enroll(&f.database, f.student, 999).await,
            Err(Error::NotFound("course"))
        ));
        let draft = create_course_with_lessons(
            &f.database,
            f.instructor,
            new_course("Draft", CourseStatus::Draft),
            vec![],
        )
        .await
        .unwrap()
        .course
        .id;
        assert!(matches!(
            enroll(&f.database, f.student, draft).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(rows(&f.database, f.student, draft).await, 0);
    }

    #[tokio::test]
    async fn test_listings_by_role() {
        let f = fixture().await;
        let other_student = create_user(&f.database, "luis@b.co", Role::Student).await;
        let mut second = new_course("Go Basics", CourseStatus::Published);
        second.category_id = 2;
        let second = create_course_with_lessons(&f.database, f.instructor, second, vec![])
            .await
            .unwrap()
            .course
            .id;

        let a = enroll(&f.database, f.student, f.course).await.unwrap().into_inner();
        let b = enroll(&f.database, f.student, second).await.unwrap().into_inner();
        enroll(&f.database, other_student, f.course).await.unwrap();
        update_status(&f.database, a.id, "cancelled").await.unwrap();

        let mine = list_student_enrollments(&f.database, f.student, None, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(mine.count, 1);
        assert_eq!(mine.results[0].id, b.id);
        assert_eq!(mine.results[0].course, "Go Basics");

        let teaching =
            list_instructor_enrollments(&f.database, f.instructor, None, PageRequest::default())
                .await
                .unwrap();
        assert_eq!(teaching.count, 3);
        // newest first
        assert_eq!(teaching.results[0].student_id, other_student);
        assert!(
            teaching
                .results
                .iter()
                .any(|e| e.status == EnrollmentStatus::Cancelled)
        );

        let searched = list_instructor_enrollments(
            &f.database,
            f.instructor,
            Some("go"),
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(searched.count, 1);
        assert_eq!(searched.results[0].course_id, second);

        let view = get_enrollment_view(&f.database, b.id).await.unwrap();
        assert_eq!(view.student, "Test ana");
        assert_eq!(
            enrollment_status(&f.database, f.student, f.course).await.unwrap(),
            Some(EnrollmentStatus::Cancelled)
        );
    }
}
