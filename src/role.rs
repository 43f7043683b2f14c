use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Role {
    Admin,
    Instructor,
    Student,
}

/// Actions guarded by role. Ownership of a specific course is checked
/// separately, on top of the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ListUsers,
    ListCourses,
    CreateCourse,
    ManageOwnCourses,
    ManageAnyCourse,
    ListAllLessons,
    /// A student's own enrollments
    ListMyEnrollments,
    /// Enrollments in the courses an instructor teaches
    ListCourseEnrollments,
    ManageAnyEnrollment,
    EnrollSelf,
    EnrollOthers,
    TrackProgress,
    WriteReview,
}

impl Role {
    pub fn allows(self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Role::Admin => !matches!(
                permission,
                ListMyEnrollments
                    | ListCourseEnrollments
                    | EnrollSelf
                    | TrackProgress
                    | WriteReview
            ),
            Role::Instructor => matches!(
                permission,
                ListCourses | CreateCourse | ManageOwnCourses | ListCourseEnrollments
            ),
            Role::Student => matches!(
                permission,
                ListCourses | ListMyEnrollments | EnrollSelf | TrackProgress | WriteReview
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Instructor => "instructor",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "instructor" => Ok(Role::Instructor),
            "student" => Ok(Role::Student),
            _ => Err(Error::Validation(format!("unknown role: {}", s))),
        }
    }
}

pub fn authorize(role: Role, permission: Permission) -> Result<()> {
    if role.allows(permission) {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

/// Course-scoped check: the course owner with `ManageOwnCourses`, or anyone
/// with `ManageAnyCourse`.
pub fn authorize_course_owner(role: Role, user_id: i64, instructor_id: i64) -> Result<()> {
    if role.allows(Permission::ManageAnyCourse)
        || (role.allows(Permission::ManageOwnCourses) && user_id == instructor_id)
    {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}
