//! Borrow (loan) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::book::BookSummary;
use super::user::UserSummary;

/// Borrow status.
///
/// Only BORROWED and RETURNED correspond to stored state; OVERDUE is a
/// read-time predicate over an unreturned borrow whose due date has
/// passed. It is never persisted, so it can never go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BorrowStatus {
    Borrowed,
    Returned,
    Overdue,
}

impl BorrowStatus {
    /// Derive the displayed status from the two stored fields and a clock
    pub fn derive(
        due_date: DateTime<Utc>,
        returned_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        match returned_at {
            Some(_) => BorrowStatus::Returned,
            None if now > due_date => BorrowStatus::Overdue,
            None => BorrowStatus::Borrowed,
        }
    }
}

impl std::fmt::Display for BorrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BorrowStatus::Borrowed => "BORROWED",
            BorrowStatus::Returned => "RETURNED",
            BorrowStatus::Overdue => "OVERDUE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BorrowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BORROWED" => Ok(BorrowStatus::Borrowed),
            "RETURNED" => Ok(BorrowStatus::Returned),
            "OVERDUE" => Ok(BorrowStatus::Overdue),
            _ => Err(format!("Invalid borrow status: {}", s)),
        }
    }
}

/// Borrow model from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Borrow {
    pub id: i32,
    pub user_id: i32,
    pub book_id: i32,
    pub borrowed_at: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl Borrow {
    /// Status of this borrow as seen at `now`
    pub fn status_at(&self, now: DateTime<Utc>) -> BorrowStatus {
        BorrowStatus::derive(self.due_date, self.returned_at, now)
    }
}

/// Borrow with user and book summaries for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowDetails {
    pub id: i32,
    pub user: UserSummary,
    pub book: BookSummary,
    pub borrowed_at: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub status: BorrowStatus,
}

/// Create borrow request
#[derive(Debug, Deserialize)]
pub struct CreateBorrow {
    pub user_id: i32,
    pub book_id: i32,
    pub due_date: DateTime<Utc>,
    pub note: Option<String>,
}

/// Borrow query parameters
#[derive(Debug, Default, Deserialize)]
pub struct BorrowQuery {
    pub status: Option<BorrowStatus>,
    pub user_id: Option<i32>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}
