use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    error::{Error, Result, retry_on_conflict},
    pagination::{Page, PageRequest},
    utils::now_utc,
};

#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct Lesson {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub content: String,
    /// Ordering index within the course, starting at 1
    pub position: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A lesson with the course title resolved, as listings return it.
#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct LessonView {
    pub id: i64,
    pub course_id: i64,
    pub course: String,
    pub title: String,
    pub content: String,
    pub position: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewLesson {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

const LESSON_COLUMNS: &str = "id, course_id, title, content, position, created_at";

const VIEW_SELECT: &str = r#"
    select l.id, l.course_id, c.title as course, l.title, l.content, l.position, l.created_at
    from lesson l
    join course c on c.id = l.course_id
"#;

fn validate(lesson: &NewLesson) -> Result<()> {
    if lesson.title.trim().is_empty() {
        return Err(Error::Validation("lesson title is required".into()));
    }
    Ok(())
}

pub(crate) async fn insert_lesson(
    conn: &mut SqliteConnection,
    course_id: i64,
    lesson: &NewLesson,
    position: i64,
) -> sqlx::Result<Lesson> {
    sqlx::query_as::<_, Lesson>(&format!(
        r#"
        insert into lesson (course_id, title, content, position, created_at)
        values (?, ?, ?, ?, ?)
        returning {LESSON_COLUMNS}
        "#
    ))
    .bind(course_id)
    .bind(lesson.title.trim())
    .bind(&lesson.content)
    .bind(position)
    .bind(now_utc())
    .fetch_one(conn)
    .await
}

/// Highest position in use for the course, `None` when it has no lessons.
pub async fn max_position(executor: impl SqliteExecutor<'_>, course_id: i64) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, Option<i64>>("select max(position) from lesson where course_id = ?")
        .bind(course_id)
        .fetch_one(executor)
        .await
}

async fn append_lesson(database: &SqlitePool, course_id: i64, lesson: &NewLesson) -> Result<Lesson> {
    let mut tx = database.begin().await.map_err(Error::aborted)?;
    // write to the course row before reading the max, so the store's write
    // lock is held across the read-modify-write
    let touched = sqlx::query("update course set updated_at = ? where id = ? and is_active = 1")
        .bind(now_utc())
        .bind(course_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::aborted)?;
    if touched.rows_affected() == 0 {
        return Err(Error::NotFound("course"));
    }
    let position = max_position(&mut *tx, course_id)
        .await
        .map_err(Error::aborted)?
        .unwrap_or(0)
        + 1;
    let lesson = insert_lesson(&mut tx, course_id, lesson, position)
        .await
        .map_err(Error::aborted)?;
    tx.commit().await.map_err(Error::aborted)?;
    Ok(lesson)
}

/// Appends a lesson at `max(position) + 1`. Positions of deleted lessons are
/// not compacted, so gaps left by deletions stay.
pub async fn add_lesson(database: &SqlitePool, course_id: i64, lesson: NewLesson) -> Result<Lesson> {
    validate(&lesson)?;
    let lesson = &lesson;
    let created = retry_on_conflict(move || append_lesson(database, course_id, lesson)).await?;
    info!(
        "lesson {} added to course {} at position {}",
        created.id, course_id, created.position
    );
    Ok(created)
}

pub async fn get_lesson(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Lesson> {
    sqlx::query_as::<_, Lesson>(&format!("select {LESSON_COLUMNS} from lesson where id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or(Error::NotFound("lesson"))
}

/// Changes title and content; the position is kept.
pub async fn update_lesson(database: &SqlitePool, id: i64, lesson: NewLesson) -> Result<Lesson> {
    validate(&lesson)?;
    sqlx::query_as::<_, Lesson>(&format!(
        "update lesson set title = ?, content = ? where id = ? returning {LESSON_COLUMNS}"
    ))
    .bind(lesson.title.trim())
    .bind(&lesson.content)
    .bind(id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("lesson"))
}

/// Removes one lesson. Siblings keep their positions.
pub async fn delete_lesson(database: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("delete from lesson where id = ?")
        .bind(id)
        .execute(database)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound("lesson"));
    }
    info!("lesson {} deleted", id);
    Ok(())
}

pub async fn list_lessons(database: &SqlitePool, page: PageRequest) -> Result<Page<LessonView>> {
    let count: i64 = sqlx::query_scalar("select count(*) from lesson")
        .fetch_one(database)
        .await?;
    let lessons = sqlx::query_as::<_, LessonView>(&format!(
        "{VIEW_SELECT} order by l.course_id, l.position limit ? offset ?"
    ))
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(database)
    .await?;
    Page::new(page, count, lessons)
}

pub async fn list_course_lessons(
    database: &SqlitePool,
    course_id: i64,
    page: PageRequest,
) -> Result<Page<LessonView>> {
    let count: i64 = sqlx::query_scalar("select count(*) from lesson where course_id = ?")
        .bind(course_id)
        .fetch_one(database)
        .await?;
    let lessons = sqlx::query_as::<_, LessonView>(&format!(
        "{VIEW_SELECT} where l.course_id = ? order by l.position limit ? offset ?"
    ))
    .bind(course_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(database)
    .await?;
    Page::new(page, count, lessons)
}

pub async fn list_instructor_lessons(
    database: &SqlitePool,
    instructor_id: i64,
    page: PageRequest,
) -> Result<Page<LessonView>> {
    let count: i64 = sqlx::query_scalar(
        "select count(*) from lesson l join course c on c.id = l.course_id where c.instructor_id = ?",
    )
    .bind(instructor_id)
    .fetch_one(database)
    .await?;
    let lessons = sqlx::query_as::<_, LessonView>(&format!(
        "{VIEW_SELECT} where c.instructor_id = ? order by l.course_id, l.position limit ? offset ?"
    ))
    .bind(instructor_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(database)
    .await?;
    Page::new(page, count, lessons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        course::{
            CourseStatus, create_course_with_lessons, deactivate_course,
            tests::{new_course, new_lessons},
        },
        db::{connect_in_memory, tests::connect_temp},
        role::Role,
        user::tests::create_user,
    };

    async fn course_with(database: &SqlitePool, titles: &[&str]) -> i64 {
        let instructor = create_user(database, "prof@b.co", Role::Instructor).await;
        create_course_with_lessons(
            database,
            instructor,
            new_course("Course", CourseStatus::Draft),
            new_lessons(titles),
        )
        .await
        .unwrap()
        .course
        .id
    }

    fn lesson(title: &str) -> NewLesson {
        NewLesson {
            title: title.into(),
            content: String::new(),
        }
    }

    #[tokio::test]
    async fn test_first_lesson_gets_position_one() {
        let database = connect_in_memory().await.unwrap();
        let course = course_with(&database, &[]).await;
        assert_eq!(max_position(&database, course).await.unwrap(), None);
        let first = add_lesson(&database, course, lesson("Intro")).await.unwrap();
        assert_eq!(first.position, 1);
        let second = add_lesson(&database, course, lesson("Next")).await.unwrap();
        assert_eq!(second.position, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_get_distinct_positions() {
        let (_dir, database) = connect_temp().await;
        let course = course_with(&database, &[]).await;
        let tasks = (0..10).map(|i| {
            let database = database.clone();
            tokio::spawn(async move {
                add_lesson(&database, course, lesson(&format!("Lesson {i}"))).await
            })
        });
        let results = futures::future::join_all(tasks).await;
        let mut positions: Vec<i64> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().position)
            .collect();
        positions.sort();
        assert_eq!(positions, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_deletion_leaves_gap() {
        let database = connect_in_memory().await.unwrap();
        let course = course_with(&database, &["A", "B", "C"]).await;
        let page = list_course_lessons(&database, course, PageRequest::default())
            .await
            .unwrap();
        let middle = page.results.iter().find(|l| l.position == 2).unwrap().id;
        delete_lesson(&database, middle).await.unwrap();

        let added = add_lesson(&database, course, lesson("D")).await.unwrap();
        assert_eq!(added.position, 4);
        let positions: Vec<i64> = list_course_lessons(&database, course, PageRequest::default())
            .await
            .unwrap()
            .results
            .iter()
            .map(|l| l.position)
            .collect();
        assert_eq!(positions, vec![1, 3, 4]);
        assert!(matches!(
            delete_lesson(&database, middle).await,
            Err(Error::NotFound("lesson"))
        ));
    }

    #[tokio::test]
    async fn test_position_uniqueness_is_enforced() {
        let database = connect_in_memory().await.unwrap();
        let course = course_with(&database, &["A"]).await;
        let mut conn = database.acquire().await.unwrap();
        let err = insert_lesson(&mut conn, course, &lesson("Dup"), 1)
            .await
            .unwrap_err();
        assert!(Error::from(err).is_retryable());
    }

    #[tokio::test]
    async fn test_add_to_missing_or_inactive_course() {
        let database = connect_in_memory().await.unwrap();
        assert!(matches!(
            add_lesson(&database, 42, lesson("Lost")).await,
            Err(Error::NotFound("course"))
        ));
        let course = course_with(&database, &[]).await;
        deactivate_course(&database, course).await.unwrap();
        assert!(matches!(
            add_lesson(&database, course, lesson("Late")).await,
            Err(Error::NotFound("course"))
        ));
        assert!(matches!(
            add_lesson(&database, course, lesson(" ")).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_position() {
        let database = connect_in_memory().await.unwrap();
        let course = course_with(&database, &["A", "B"]).await;
        let b = list_course_lessons(&database, course, PageRequest::default())
            .await
            .unwrap()
            .results[1]
            .id;
        let updated = update_lesson(
            &database,
            b,
            NewLesson {
                title: "B2".into(),
                content: "new".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.position, 2);
        assert_eq!(get_lesson(&database, b).await.unwrap().title, "B2");
        assert!(matches!(
            update_lesson(&database, 999, lesson("X")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listings() {
        let database = connect_in_memory().await.unwrap();
        let course = course_with(&database, &["A", "B", "C"]).await;
        let other = create_user(&database, "other@b.co", Role::Instructor).await;
        create_course_with_lessons(
            &database,
            other,
            new_course("Other", CourseStatus::Draft),
            new_lessons(&["X"]),
        )
        .await
        .unwrap();

        let all = list_lessons(&database, PageRequest::default()).await.unwrap();
        assert_eq!(all.count, 4);
        assert_eq!(all.results[0].course_id, course);
        assert_eq!(all.results[0].course, "Course");

        let instructor: i64 = sqlx::query_scalar("select instructor_id from course where id = ?")
            .bind(course)
            .fetch_one(&database)
            .await
            .unwrap();
        let mine = list_instructor_lessons(&database, instructor, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(mine.count, 3);

        let paged = list_course_lessons(
            &database,
            course,
            PageRequest {
                page: 2,
                page_size: 2,
                paginate: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(paged.results.len(), 1);
        assert_eq!(paged.results[0].title, "C");
        assert_eq!(paged.previous, Some(1));
    }
}
