//! Borrows repository for database operations.
//!
//! Availability accounting lives here: creating a borrow takes a copy
//! off the shelf, returning puts it back, and both happen inside one
//! database transaction with the book row locked. Correctness does not
//! depend on in-process locks, so multiple server instances stay safe.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};

use crate::{
    error::{AppError, AppResult},
    models::{
        book::BookSummary,
        borrow::{Borrow, BorrowDetails, BorrowQuery, BorrowStatus, CreateBorrow},
        user::UserSummary,
    },
};

#[derive(Clone)]
pub struct BorrowsRepository {
    pool: Pool<Postgres>,
}

impl BorrowsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get borrow by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<Borrow> {
        sqlx::query_as::<_, Borrow>("SELECT * FROM borrows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Borrow with id {} not found", id)))
    }

    /// Create a new borrow, taking one copy off the shelf.
    ///
    /// The book row is locked for the duration, so concurrent requests
    /// for the last copy serialize: exactly one wins, the rest see
    /// `Unavailable`.
    pub async fn create(&self, borrow: &CreateBorrow) -> AppResult<Borrow> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let available: i32 =
            sqlx::query_scalar("SELECT available FROM books WHERE id = $1 FOR UPDATE")
                .bind(borrow.book_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Book with id {} not found", borrow.book_id))
                })?;

        if available <= 0 {
            return Err(AppError::Unavailable(format!(
                "No copies of book {} available",
                borrow.book_id
            )));
        }

        sqlx::query("UPDATE books SET available = available - 1 WHERE id = $1")
            .bind(borrow.book_id)
            .execute(&mut *tx)
            .await?;

        let created = sqlx::query_as::<_, Borrow>(
            r#"
            INSERT INTO borrows (user_id, book_id, borrowed_at, due_date, note)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(borrow.user_id)
        .bind(borrow.book_id)
        .bind(now)
        .bind(borrow.due_date)
        .bind(&borrow.note)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_foreign_key_violation() {
                    return AppError::NotFound(format!(
                        "User with id {} not found",
                        borrow.user_id
                    ));
                }
            }
            AppError::Database(e)
        })?;

        tx.commit().await?;

        Ok(created)
    }

    /// Return a borrow, putting the copy back on the shelf.
    ///
    /// The increment is capped at `quantity` so a double return can
    /// never push `available` past the owned copies.
    pub async fn return_borrow(&self, id: i32) -> AppResult<Borrow> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let borrow = sqlx::query_as::<_, Borrow>("SELECT * FROM borrows WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Borrow with id {} not found", id)))?;

        if borrow.returned_at.is_some() {
            return Err(AppError::AlreadyReturned(format!(
                "Borrow {} was already returned",
                id
            )));
        }

        let returned = sqlx::query_as::<_, Borrow>(
            "UPDATE borrows SET returned_at = $1 WHERE id = $2 RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE books SET available = LEAST(available + 1, quantity) WHERE id = $1")
            .bind(borrow.book_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(returned)
    }

    /// Get borrow details (user and book summaries, derived status)
    pub async fn get_details(&self, id: i32) -> AppResult<BorrowDetails> {
        let row = sqlx::query(&format!("{} WHERE bw.id = $1", DETAILS_QUERY))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Borrow with id {} not found", id)))?;

        Ok(details_from_row(&row, Utc::now()))
    }

    /// Search borrows with status filter and pagination.
    ///
    /// The status filter is a predicate over (`returned_at`,
    /// `due_date`, NOW()); no stored status column exists.
    pub async fn search(&self, query: &BorrowQuery) -> AppResult<(Vec<BorrowDetails>, i64)> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * per_page;

        let mut conditions: Vec<String> = Vec::new();

        match query.status {
            Some(BorrowStatus::Borrowed) => {
                conditions.push("bw.returned_at IS NULL AND bw.due_date >= NOW()".to_string())
            }
            Some(BorrowStatus::Overdue) => {
                conditions.push("bw.returned_at IS NULL AND bw.due_date < NOW()".to_string())
            }
            Some(BorrowStatus::Returned) => {
                conditions.push("bw.returned_at IS NOT NULL".to_string())
            }
            None => {}
        }
        if query.user_id.is_some() {
            conditions.push(format!("bw.user_id = ${}", conditions.len() + 1));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_query = format!("SELECT COUNT(*) FROM borrows bw {}", where_clause);
        let mut count_builder = sqlx::query_scalar::<_, i64>(&count_query);
        if let Some(user_id) = query.user_id {
            count_builder = count_builder.bind(user_id);
        }
        let total = count_builder.fetch_one(&self.pool).await?;

        let select_query = format!(
            "{} {} ORDER BY bw.borrowed_at DESC, bw.id DESC LIMIT {} OFFSET {}",
            DETAILS_QUERY, where_clause, per_page, offset
        );
        let mut select_builder = sqlx::query(&select_query);
        if let Some(user_id) = query.user_id {
            select_builder = select_builder.bind(user_id);
        }
        let rows = select_builder.fetch_all(&self.pool).await?;

        let now = Utc::now();
        let borrows = rows.iter().map(|row| details_from_row(row, now)).collect();

        Ok((borrows, total))
    }

    /// Get all borrows for a user, newest first
    pub async fn get_user_borrows(&self, user_id: i32) -> AppResult<Vec<BorrowDetails>> {
        let rows = sqlx::query(&format!(
            "{} WHERE bw.user_id = $1 ORDER BY bw.borrowed_at DESC, bw.id DESC",
            DETAILS_QUERY
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        Ok(rows.iter().map(|row| details_from_row(row, now)).collect())
    }

    /// Count borrow records for a user (returned history included)
    pub async fn count_for_user(&self, user_id: i32) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM borrows WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Count active borrows
    pub async fn count_active(&self) -> AppResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM borrows WHERE returned_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Count overdue borrows
    pub async fn count_overdue(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM borrows WHERE returned_at IS NULL AND due_date < NOW()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

const DETAILS_QUERY: &str = r#"
    SELECT bw.id, bw.user_id, bw.book_id, bw.borrowed_at, bw.due_date, bw.returned_at, bw.note,
           u.name AS user_name, u.email AS user_email, u.role AS user_role,
           bk.title, bk.isbn, bk.cover_url, bk.quantity, bk.available
    FROM borrows bw
    JOIN users u ON bw.user_id = u.id
    JOIN books bk ON bw.book_id = bk.id
"#;

fn details_from_row(row: &sqlx::postgres::PgRow, now: DateTime<Utc>) -> BorrowDetails {
    let due_date: DateTime<Utc> = row.get("due_date");
    let returned_at: Option<DateTime<Utc>> = row.get("returned_at");

    BorrowDetails {
        id: row.get("id"),
        user: UserSummary {
            id: row.get("user_id"),
            name: row.get("user_name"),
            email: row.get("user_email"),
            role: row.get("user_role"),
            active_borrows: None,
            overdue_borrows: None,
        },
        book: BookSummary {
            id: row.get("book_id"),
            title: row.get("title"),
            isbn: row.get("isbn"),
            cover_url: row.get("cover_url"),
            quantity: row.get("quantity"),
            available: row.get("available"),
        },
        borrowed_at: row.get("borrowed_at"),
        due_date,
        returned_at,
        note: row.get("note"),
        status: BorrowStatus::derive(due_date, returned_at, now),
    }
}
