//! Borrow lifecycle service

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::BorrowsConfig,
    error::{AppError, AppResult},
    models::{
        borrow::{BorrowDetails, BorrowQuery, CreateBorrow},
        user::UserClaims,
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct BorrowsService {
    repository: Repository,
    config: BorrowsConfig,
}

impl BorrowsService {
    pub fn new(repository: Repository, config: BorrowsConfig) -> Self {
        Self { repository, config }
    }

    /// Create a new borrow (take a book off the shelf).
    ///
    /// The actor must be the borrowing user, or staff acting on their
    /// behalf. The due date must fall in the allowed loan window.
    pub async fn create_borrow(
        &self,
        actor: &UserClaims,
        borrow: CreateBorrow,
    ) -> AppResult<BorrowDetails> {
        actor.ensure_password_current()?;
        actor.require_self_or_staff(borrow.user_id)?;

        validate_due_date(borrow.due_date, Utc::now(), self.config.max_due_days)?;

        // Verify user exists before touching the book row
        self.repository.users.get_by_id(borrow.user_id).await?;

        let created = self.repository.borrows.create(&borrow).await?;
        self.repository.borrows.get_details(created.id).await
    }

    /// Return a borrowed book
    pub async fn return_borrow(&self, actor: &UserClaims, id: i32) -> AppResult<BorrowDetails> {
        actor.ensure_password_current()?;

        let borrow = self.repository.borrows.get_by_id(id).await?;
        actor.require_self_or_staff(borrow.user_id)?;

        let returned = self.repository.borrows.return_borrow(id).await?;
        self.repository.borrows.get_details(returned.id).await
    }

    /// Search borrows with status filter and pagination (staff only)
    pub async fn list_borrows(
        &self,
        actor: &UserClaims,
        query: &BorrowQuery,
    ) -> AppResult<(Vec<BorrowDetails>, i64)> {
        actor.require_staff()?;
        self.repository.borrows.search(query).await
    }

    /// Get all borrows for a user (self or staff)
    pub async fn list_user_borrows(
        &self,
        actor: &UserClaims,
        user_id: i32,
    ) -> AppResult<Vec<BorrowDetails>> {
        actor.require_self_or_staff(user_id)?;

        // Verify user exists
        self.repository.users.get_by_id(user_id).await?;
        self.repository.borrows.get_user_borrows(user_id).await
    }

    /// Count active borrows (staff only)
    pub async fn count_active(&self, actor: &UserClaims) -> AppResult<i64> {
        actor.require_staff()?;
        self.repository.borrows.count_active().await
    }

    /// Count overdue borrows (staff only)
    pub async fn count_overdue(&self, actor: &UserClaims) -> AppResult<i64> {
        actor.require_staff()?;
        self.repository.borrows.count_overdue().await
    }
}

/// A due date must be strictly more than one day ahead of `now`, and
/// at most `max_due_days` ahead (inclusive).
fn validate_due_date(
    due_date: DateTime<Utc>,
    now: DateTime<Utc>,
    max_due_days: i64,
) -> AppResult<()> {
    let earliest = now + Duration::days(1);
    let latest = now + Duration::days(max_due_days);

    if due_date <= earliest {
        return Err(AppError::Validation(
            "Due date must be at least one day ahead".to_string(),
        ));
    }
    if due_date > latest {
        return Err(AppError::Validation(format!(
            "Due date must be at most {} days ahead",
            max_due_days
        )));
    }

    Ok(())
}
