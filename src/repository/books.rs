//! Books repository for database operations

use chrono::Utc;
use sqlx::{Pool, Postgres, Row};

use crate::{
    error::{AppError, AppResult},
    models::{
        author::Author,
        book::{Book, BookDetails, BookQuery, BookSummary, CreateBook, UpdateBook},
        category::Category,
    },
};

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get book by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<Book> {
        sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    /// Get book by ID with author and category associations
    pub async fn get_details(&self, id: i32) -> AppResult<BookDetails> {
        let book = self.get_by_id(id).await?;

        let authors = sqlx::query_as::<_, Author>(
            r#"
            SELECT a.* FROM authors a
            JOIN book_authors ba ON ba.author_id = a.id
            WHERE ba.book_id = $1
            ORDER BY a.name
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let categories = sqlx::query_as::<_, Category>(
            r#"
            SELECT c.* FROM categories c
            JOIN book_categories bc ON bc.category_id = c.id
            WHERE bc.book_id = $1
            ORDER BY c.name
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(BookDetails { book, authors, categories })
    }

    /// Search books with pagination
    pub async fn search(&self, query: &BookQuery) -> AppResult<(Vec<BookSummary>, i64)> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * per_page;

        let mut conditions = Vec::new();
        let mut title_pattern = None;

        if let Some(ref title) = query.title {
            title_pattern = Some(format!("%{}%", title));
            conditions.push("b.title ILIKE $1".to_string());
        }
        if query.author_id.is_some() {
            conditions.push(format!(
                "EXISTS(SELECT 1 FROM book_authors ba WHERE ba.book_id = b.id AND ba.author_id = ${})",
                conditions.len() + 1
            ));
        }
        if query.category_id.is_some() {
            conditions.push(format!(
                "EXISTS(SELECT 1 FROM book_categories bc WHERE bc.book_id = b.id AND bc.category_id = ${})",
                conditions.len() + 1
            ));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        macro_rules! bind_filters {
            ($builder:expr) => {{
                let mut b = $builder;
                if let Some(ref p) = title_pattern {
                    b = b.bind(p);
                }
                if let Some(author_id) = query.author_id {
                    b = b.bind(author_id);
                }
                if let Some(category_id) = query.category_id {
                    b = b.bind(category_id);
                }
                b
            }};
        }

        let count_query = format!("SELECT COUNT(*) FROM books b {}", where_clause);
        let total = bind_filters!(sqlx::query_scalar::<_, i64>(&count_query))
            .fetch_one(&self.pool)
            .await?;

        let select_query = format!(
            r#"
            SELECT b.id, b.title, b.isbn, b.cover_url, b.quantity, b.available
            FROM books b
            {}
            ORDER BY b.title, b.id
            LIMIT {} OFFSET {}
            "#,
            where_clause, per_page, offset
        );
        let books = bind_filters!(sqlx::query_as::<_, BookSummary>(&select_query))
            .fetch_all(&self.pool)
            .await?;

        Ok((books, total))
    }

    /// Create a new book with its associations.
    ///
    /// `available` starts equal to `quantity`: every copy is on the shelf.
    pub async fn create(&self, book: &CreateBook) -> AppResult<BookDetails> {
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO books (title, isbn, description, publication_date, cover_url, page_count, quantity, available)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id
            "#,
        )
        .bind(&book.title)
        .bind(&book.isbn)
        .bind(&book.description)
        .bind(book.publication_date)
        .bind(&book.cover_url)
        .bind(book.page_count)
        .bind(book.quantity)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_joins(&mut tx, id, &book.author_ids, &book.category_ids).await?;

        tx.commit().await?;

        self.get_details(id).await
    }

    /// Update an existing book.
    ///
    /// A quantity change keeps the outstanding-loan count intact: with
    /// `on_loan = quantity - available`, the new quantity must not drop
    /// below `on_loan`, and `available` becomes `quantity_new - on_loan`.
    /// The row is locked so a concurrent borrow cannot slip in between.
    pub async fn update(&self, id: i32, book: &UpdateBook) -> AppResult<BookDetails> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT quantity, available FROM books WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;

        let quantity: i32 = row.get("quantity");
        let available: i32 = row.get("available");
        let on_loan = quantity - available;

        let new_available = match book.quantity {
            Some(new_quantity) => {
                if new_quantity < on_loan {
                    return Err(AppError::Validation(format!(
                        "Quantity {} is below the {} copies currently on loan",
                        new_quantity, on_loan
                    )));
                }
                Some(new_quantity - on_loan)
            }
            None => None,
        };

        let mut sets = vec!["updated_at = $1".to_string()];
        let mut param_idx = 2;

        macro_rules! add_field {
            ($field:expr, $name:expr) => {
                if $field.is_some() {
                    sets.push(format!("{} = ${}", $name, param_idx));
                    param_idx += 1;
                }
            };
        }

        add_field!(book.title, "title");
        add_field!(book.isbn, "isbn");
        add_field!(book.description, "description");
        add_field!(book.publication_date, "publication_date");
        add_field!(book.cover_url, "cover_url");
        add_field!(book.page_count, "page_count");
        add_field!(book.quantity, "quantity");
        add_field!(new_available, "available");
        let _ = param_idx;

        let query = format!("UPDATE books SET {} WHERE id = {}", sets.join(", "), id);

        let mut builder = sqlx::query(&query).bind(now);

        macro_rules! bind_field {
            ($field:expr) => {
                if let Some(ref val) = $field {
                    builder = builder.bind(val);
                }
            };
        }

        bind_field!(book.title);
        bind_field!(book.isbn);
        bind_field!(book.description);
        bind_field!(book.publication_date);
        bind_field!(book.cover_url);
        bind_field!(book.page_count);
        bind_field!(book.quantity);
        bind_field!(new_available);

        builder.execute(&mut *tx).await?;

        if let Some(ref author_ids) = book.author_ids {
            sqlx::query("DELETE FROM book_authors WHERE book_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Self::insert_joins(&mut tx, id, author_ids, &[]).await?;
        }
        if let Some(ref category_ids) = book.category_ids {
            sqlx::query("DELETE FROM book_categories WHERE book_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Self::insert_joins(&mut tx, id, &[], category_ids).await?;
        }

        tx.commit().await?;

        self.get_details(id).await
    }

    /// Delete a book.
    ///
    /// Refused while any borrow of the book is unreturned; otherwise
    /// the returned borrow history goes with the book in one
    /// transaction (join rows cascade).
    pub async fn delete(&self, id: i32) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let has_active: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM borrows WHERE book_id = $1 AND returned_at IS NULL)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        if has_active {
            return Err(AppError::DependencyExists(
                "Book has active borrows".to_string(),
            ));
        }

        sqlx::query("DELETE FROM borrows WHERE book_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Book with id {} not found", id)));
        }

        tx.commit().await?;

        Ok(())
    }

    async fn insert_joins(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        book_id: i32,
        author_ids: &[i32],
        category_ids: &[i32],
    ) -> AppResult<()> {
        for &author_id in author_ids {
            sqlx::query("INSERT INTO book_authors (book_id, author_id) VALUES ($1, $2)")
                .bind(book_id)
                .bind(author_id)
                .execute(&mut **tx)
                .await
                .map_err(map_join_error)?;
        }
        for &category_id in category_ids {
            sqlx::query("INSERT INTO book_categories (book_id, category_id) VALUES ($1, $2)")
                .bind(book_id)
                .bind(category_id)
                .execute(&mut **tx)
                .await
                .map_err(map_join_error)?;
        }
        Ok(())
    }
}

/// An unknown author/category id violates the join foreign key; report
/// it as a validation failure rather than a database error.
fn map_join_error(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_foreign_key_violation() {
            return AppError::Validation("Unknown author or category id".to_string());
        }
    }
    AppError::Database(e)
}
