//! Book (catalog entry) model and related types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use super::author::Author;
use super::category::Category;

/// Book model from database.
///
/// `quantity` is the number of copies the library owns; `available` is
/// the number currently on the shelf. `0 <= available <= quantity`
/// holds at all times, and `available` is only ever moved by the
/// borrow lifecycle and by quantity edits.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Book {
    pub id: i32,
    pub title: String,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub cover_url: Option<String>,
    pub page_count: Option<i32>,
    pub quantity: i32,
    pub available: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Book with its author and category associations, for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDetails {
    #[serde(flatten)]
    pub book: Book,
    pub authors: Vec<Author>,
    pub categories: Vec<Category>,
}

/// Short book representation for lists and borrow details
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BookSummary {
    pub id: i32,
    pub title: String,
    pub isbn: Option<String>,
    pub cover_url: Option<String>,
    pub quantity: i32,
    pub available: i32,
}

/// Create book request
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBook {
    #[validate(length(min = 1, message = "Title must not be empty"))]
    pub title: String,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub cover_url: Option<String>,
    #[validate(range(min = 1, message = "Page count must be positive"))]
    pub page_count: Option<i32>,
    #[validate(range(min = 0, message = "Quantity must not be negative"))]
    pub quantity: i32,
    #[serde(default)]
    pub author_ids: Vec<i32>,
    #[serde(default)]
    pub category_ids: Vec<i32>,
}

/// Update book request.
///
/// Association lists, when present, replace the existing join rows.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateBook {
    #[validate(length(min = 1, message = "Title must not be empty"))]
    pub title: Option<String>,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub cover_url: Option<String>,
    #[validate(range(min = 1, message = "Page count must be positive"))]
    pub page_count: Option<i32>,
    #[validate(range(min = 0, message = "Quantity must not be negative"))]
    pub quantity: Option<i32>,
    pub author_ids: Option<Vec<i32>>,
    pub category_ids: Option<Vec<i32>>,
}

/// Book query parameters
#[derive(Debug, Default, Deserialize)]
pub struct BookQuery {
    /// Case-insensitive substring match on title
    pub title: Option<String>,
    pub author_id: Option<i32>,
    pub category_id: Option<i32>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}
