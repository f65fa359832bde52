//! Author model and related types

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Author model from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Author {
    pub id: i32,
    pub name: String,
    pub bio: Option<String>,
}

/// Create author request
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAuthor {
    #[validate(length(min = 1, message = "Name must not be empty"))]
    pub name: String,
    pub bio: Option<String>,
}

/// Update author request
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAuthor {
    #[validate(length(min = 1, message = "Name must not be empty"))]
    pub name: Option<String>,
    pub bio: Option<String>,
}

/// Author query parameters
#[derive(Debug, Default, Deserialize)]
pub struct AuthorQuery {
    /// Case-insensitive substring match on name
    pub name: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}
