use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::{Error, Result},
    lesson::{self, Lesson, NewLesson},
    pagination::{Page, PageRequest},
    utils::now_utc,
};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CourseStatus {
    #[default]
    Draft,
    Archived,
    Published,
}

impl CourseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CourseStatus::Draft => "draft",
            CourseStatus::Archived => "archived",
            CourseStatus::Published => "published",
        }
    }
}

impl fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CourseStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(CourseStatus::Draft),
            "archived" => Ok(CourseStatus::Archived),
            "published" => Ok(CourseStatus::Published),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// A course row as stored.
#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: CourseStatus,
    pub is_active: bool,
    pub instructor_id: i64,
    pub category_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A course with its category label and instructor name resolved.
#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct CourseView {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: CourseStatus,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub category: String,
    pub instructor: String,
    pub instructor_id: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewCourse {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category_id: i64,
    #[serde(default)]
    pub status: CourseStatus,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CourseWithLessons {
    pub course: Course,
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CourseFilter {
    /// Substring of the course title
    pub search_title: Option<String>,
    /// Substring of the category key or label
    pub search_category: Option<String>,
    /// Whitespace separated terms, each matched against first or last name
    pub search_instructor: Option<String>,
}

const COURSE_COLUMNS: &str =
    "id, title, description, status, is_active, instructor_id, category_id, created_at, updated_at";

const VIEW_SELECT: &str = r#"
    select c.id, c.title, c.description, c.status, c.is_active, c.created_at, c.instructor_id,
           cat.label as category, trim(u.first_name || ' ' || u.last_name) as instructor
    from course c
    join category cat on cat.id = c.category_id
    join user u on u.id = c.instructor_id
"#;

const VIEW_COUNT: &str = r#"
    select count(*)
    from course c
    join category cat on cat.id = c.category_id
    join user u on u.id = c.instructor_id
"#;

fn like(term: &str) -> String {
    format!("%{}%", term.trim())
}

impl CourseFilter {
    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" where c.is_active = 1 and c.status = 'published'");
        if let Some(title) = self.search_title.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" and c.title like ").push_bind(like(title));
        }
        if let Some(category) = self
            .search_category
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            qb.push(" and (cat.label like ")
                .push_bind(like(category))
                .push(" or cat.key like ")
                .push_bind(like(category))
                .push(")");
        }
        if let Some(instructor) = self.search_instructor.as_deref() {
            for term in instructor.split_whitespace() {
                qb.push(" and (u.first_name like ")
                    .push_bind(like(term))
                    .push(" or u.last_name like ")
                    .push_bind(like(term))
                    .push(")");
            }
        }
    }
}

pub async fn list_categories(database: &SqlitePool) -> Result<Vec<Category>> {
    let categories = sqlx::query_as::<_, Category>("select id, key, label from category order by id")
        .fetch_all(database)
        .await?;
    Ok(categories)
}

async fn insert_course(
    conn: &mut SqliteConnection,
    instructor_id: i64,
    course: &NewCourse,
) -> sqlx::Result<Course> {
    let now = now_utc();
    sqlx::query_as::<_, Course>(&format!(
        r#"
        insert into course (title, description, status, is_active, instructor_id, category_id, created_at, updated_at)
        values (?, ?, ?, 1, ?, ?, ?, ?)
        returning {COURSE_COLUMNS}
        "#
    ))
    .bind(course.title.trim())
    .bind(&course.description)
    .bind(course.status)
    .bind(instructor_id)
    .bind(course.category_id)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await
}

/// Creates a course and its lessons as one unit. Lessons get positions 1..N
/// in the order given. Any failure rolls back the course and every lesson.
pub async fn create_course_with_lessons(
    database: &SqlitePool,
    instructor_id: i64,
    course: NewCourse,
    lessons: Vec<NewLesson>,
) -> Result<CourseWithLessons> {
    if course.title.trim().is_empty() {
        return Err(Error::Validation("course title is required".into()));
    }
    if lessons.iter().any(|l| l.title.trim().is_empty()) {
        return Err(Error::Validation("lesson title is required".into()));
    }
    let category: Option<i64> = sqlx::query_scalar("select id from category where id = ?")
        .bind(course.category_id)
        .fetch_optional(database)
        .await?;
    if category.is_none() {
        return Err(Error::Validation(format!(
            "unknown category: {}",
            course.category_id
        )));
    }

    let mut tx = database.begin().await.map_err(Error::TransactionAborted)?;
    let course = insert_course(&mut tx, instructor_id, &course)
        .await
        .map_err(Error::TransactionAborted)?;
    let mut created = Vec::with_capacity(lessons.len());
    for (index, lesson) in lessons.iter().enumerate() {
        let position = index as i64 + 1;
        let lesson = lesson::insert_lesson(&mut tx, course.id, lesson, position)
            .await
            .map_err(Error::TransactionAborted)?;
        created.push(lesson);
    }
    tx.commit().await.map_err(Error::TransactionAborted)?;
    info!(
        "course {} created by instructor {} with {} lessons",
        course.id,
        instructor_id,
        created.len()
    );
    Ok(CourseWithLessons {
        course,
        lessons: created,
    })
}

/// Raw lookup, including inactive courses.
pub async fn find_course(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Option<Course>> {
    let course = sqlx::query_as::<_, Course>(&format!(
        "select {COURSE_COLUMNS} from course where id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(course)
}

/// Active courses only; a soft-deleted course is not found.
pub async fn get_course(database: &SqlitePool, id: i64) -> Result<CourseView> {
    let mut qb = QueryBuilder::<Sqlite>::new(VIEW_SELECT);
    qb.push(" where c.is_active = 1 and c.id = ").push_bind(id);
    qb.build_query_as::<CourseView>()
        .fetch_optional(database)
        .await?
        .ok_or(Error::NotFound("course"))
}

/// Published, active courses matching the filter, oldest first.
pub async fn list_courses(
    database: &SqlitePool,
    filter: &CourseFilter,
    page: PageRequest,
) -> Result<Page<CourseView>> {
    let mut count_qb = QueryBuilder::<Sqlite>::new(VIEW_COUNT);
    filter.push_where(&mut count_qb);
    let count: i64 = count_qb.build_query_scalar::<i64>().fetch_one(database).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(VIEW_SELECT);
    filter.push_where(&mut qb);
    qb.push(" order by c.created_at asc, c.id asc limit ")
        .push_bind(page.limit())
        .push(" offset ")
        .push_bind(page.offset());
    let courses = qb.build_query_as::<CourseView>().fetch_all(database).await?;
    Page::new(page, count, courses)
}

/// Every active course owned by the instructor, whatever its status.
pub async fn list_instructor_courses(
    database: &SqlitePool,
    instructor_id: i64,
    page: PageRequest,
) -> Result<Page<CourseView>> {
    let count: i64 =
        sqlx::query_scalar("select count(*) from course where is_active = 1 and instructor_id = ?")
            .bind(instructor_id)
            .fetch_one(database)
            .await?;
    let mut qb = QueryBuilder::<Sqlite>::new(VIEW_SELECT);
    qb.push(" where c.is_active = 1 and c.instructor_id = ")
        .push_bind(instructor_id)
        .push(" order by c.created_at desc, c.id desc limit ")
        .push_bind(page.limit())
        .push(" offset ")
        .push_bind(page.offset());
    let courses = qb.build_query_as::<CourseView>().fetch_all(database).await?;
    Page::new(page, count, courses)
}

pub async fn set_course_status(
    database: &SqlitePool,
    id: i64,
    status: CourseStatus,
) -> Result<Course> {
    let course = sqlx::query_as::<_, Course>(&format!(
        "update course set status = ?, updated_at = ? where id = ? and is_active = 1 returning {COURSE_COLUMNS}"
    ))
    .bind(status)
    .bind(now_utc())
    .bind(id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("course"))?;
    info!("course {} is now {}", id, status);
    Ok(course)
}

/// Soft delete. Lessons and enrollments keep referencing the row.
pub async fn deactivate_course(database: &SqlitePool, id: i64) -> Result<()> {
    let result =
        sqlx::query("update course set is_active = 0, updated_at = ? where id = ? and is_active = 1")
            .bind(now_utc())
            .bind(id)
            .execute(database)
            .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound("course"));
    }
    info!("course {} deactivated", id);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{db::connect_in_memory, role::Role, user::tests::create_user};

    pub(crate) fn new_course(title: &str, status: CourseStatus) -> NewCourse {
        NewCourse {
            title: title.into(),
            description: format!("About {}", title),
            category_id: 1,
            status,
        }
    }

    pub(crate) fn new_lessons(titles: &[&str]) -> Vec<NewLesson> {
        titles
            .iter()
            .map(|t| NewLesson {
                title: t.to_string(),
                content: format!("{} content", t),
            })
            .collect()
    }

    pub(crate) async fn published_course(database: &SqlitePool, instructor_id: i64) -> i64 {
        create_course_with_lessons(
            database,
            instructor_id,
            new_course("Rust", CourseStatus::Published),
            vec![],
        )
        .await
        .unwrap()
        .course
        .id
    }

    async fn count(database: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("select count(*) from {table}"))
            .fetch_one(database)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_positions_follow_input_order() {
        let database = connect_in_memory().await.unwrap();
        let instructor = create_user(&database, "prof@b.co", Role::Instructor).await;
        // titles sort opposite to input order; positions must ignore that
        let created = create_course_with_lessons(
            &database,
            instructor,
            new_course("Systems", CourseStatus::Draft),
            new_lessons(&["Zeta", "Mu", "Alpha"]),
        )
        .await
        .unwrap();
        let positions: Vec<(String, i64)> = created
            .lessons
            .iter()
            .map(|l| (l.title.clone(), l.position))
            .collect();
        assert_eq!(
            positions,
            vec![
                ("Zeta".to_string(), 1),
                ("Mu".to_string(), 2),
                ("Alpha".to_string(), 3)
            ]
        );
        assert_eq!(created.course.status, CourseStatus::Draft);
        assert!(created.course.is_active);
    }

    #[tokio::test]
    async fn test_failed_lesson_rolls_back_everything() {
        let database = connect_in_memory().await.unwrap();
        let instructor = create_user(&database, "prof@b.co", Role::Instructor).await;
        sqlx::query(
            "create trigger fail_third_lesson before insert on lesson when new.position = 3 \
             begin select raise(abort, 'forced failure'); end",
        )
        .execute(&database)
        .await
        .unwrap();

        let result = create_course_with_lessons(
            &database,
            instructor,
            new_course("Doomed", CourseStatus::Published),
            new_lessons(&["L1", "L2", "L3", "L4"]),
        )
        .await;
        assert!(matches!(result, Err(Error::TransactionAborted(_))));
        assert_eq!(count(&database, "course").await, 0);
        assert_eq!(count(&database, "lesson").await, 0);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let database = connect_in_memory().await.unwrap();
        let instructor = create_user(&database, "prof@b.co", Role::Instructor).await;
        let mut course = new_course("  ", CourseStatus::Draft);
        assert!(matches!(
            create_course_with_lessons(&database, instructor, course.clone(), vec![]).await,
            Err(Error::Validation(_))
        ));
        course.title = "Fine".into();
        course.category_id = 999;
        assert!(matches!(
            create_course_with_lessons(&database, instructor, course, vec![]).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(count(&database, "course").await, 0);
    }

    #[tokio::test]
    async fn test_list_courses_filters() {
        let database = connect_in_memory().await.unwrap();
        let ana = register_named(&database, "ana@b.co", "Ana Maria", "Lopez").await;
        let juan = register_named(&database, "juan@b.co", "Juan", "Perez").await;
        for (owner, title, status, category) in [
            (ana, "Rust for Beginners", CourseStatus::Published, 1),
            (ana, "Advanced Rust", CourseStatus::Draft, 1),
            (juan, "Cloud Rust", CourseStatus::Published, 3),
            (juan, "Marketing 101", CourseStatus::Published, 14),
        ] {
            let mut course = new_course(title, status);
            course.category_id = category;
            create_course_with_lessons(&database, owner, course, vec![])
                .await
                .unwrap();
        }

        let all = list_courses(&database, &CourseFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(all.count, 3);

        let filter = CourseFilter {
            search_title: Some("rust".into()),
            ..Default::default()
        };
        let rust = list_courses(&database, &filter, PageRequest::default())
            .await
            .unwrap();
        let titles: Vec<_> = rust.results.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Rust for Beginners", "Cloud Rust"]);

        let filter = CourseFilter {
            search_category: Some("devops".into()),
            ..Default::default()
        };
        let cloud = list_courses(&database, &filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(cloud.count, 1);
        assert_eq!(cloud.results[0].title, "Cloud Rust");
        assert_eq!(cloud.results[0].category, "Cloud Computing and DevOps");

        let filter = CourseFilter {
            search_instructor: Some("maria lopez".into()),
            ..Default::default()
        };
        let by_ana = list_courses(&database, &filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(by_ana.count, 1);
        assert_eq!(by_ana.results[0].instructor, "Ana Maria Lopez");

        let mine = list_instructor_courses(&database, ana, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(mine.count, 2);
    }

    #[tokio::test]
    async fn test_status_and_soft_delete() {
        let database = connect_in_memory().await.unwrap();
        let instructor = create_user(&database, "prof@b.co", Role::Instructor).await;
        let id = create_course_with_lessons(
            &database,
            instructor,
            new_course("Draft", CourseStatus::Draft),
            new_lessons(&["Intro"]),
        )
        .await
        .unwrap()
        .course
        .id;
        let course = set_course_status(&database, id, CourseStatus::Published)
            .await
            .unwrap();
        assert_eq!(course.status, CourseStatus::Published);
        assert_eq!(get_course(&database, id).await.unwrap().status, CourseStatus::Published);

        deactivate_course(&database, id).await.unwrap();
        assert!(matches!(get_course(&database, id).await, Err(Error::NotFound(_))));
        assert!(matches!(
            deactivate_course(&database, id).await,
            Err(Error::NotFound(_))
        ));
        // the row and its lessons survive
        assert!(!find_course(&database, id).await.unwrap().unwrap().is_active);
        assert_eq!(count(&database, "lesson").await, 1);
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("archived".parse::<CourseStatus>().unwrap(), CourseStatus::Archived);
        assert!(matches!(
            "borrador".parse::<CourseStatus>(),
            Err(Error::InvalidStatus(_))
        ));
    }

    async fn register_named(database: &SqlitePool, email: &str, first: &str, last: &str) -> i64 {
        crate::user::register(
            database,
            crate::user::NewUser {
                first_name: first.into(),
                last_name: last.into(),
                email: email.into(),
                password: "password123".into(),
                role: Role::Instructor,
            },
        )
        .await
        .unwrap()
        .id
    }
}
