//! Catalog management service

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{
        author::{Author, AuthorQuery, CreateAuthor, UpdateAuthor},
        book::{BookDetails, BookQuery, BookSummary, CreateBook, UpdateBook},
        category::{Category, CreateCategory, UpdateCategory},
        user::UserClaims,
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
}

impl CatalogService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    // Books

    /// Search books with filters
    pub async fn search_books(&self, query: &BookQuery) -> AppResult<(Vec<BookSummary>, i64)> {
        self.repository.books.search(query).await
    }

    /// Get book by ID with full details
    pub async fn get_book(&self, id: i32) -> AppResult<BookDetails> {
        self.repository.books.get_details(id).await
    }

    /// Create a new book
    pub async fn create_book(&self, actor: &UserClaims, book: CreateBook) -> AppResult<BookDetails> {
        actor.ensure_password_current()?;
        actor.require_staff()?;
        book.validate()?;

        self.repository.books.create(&book).await
    }

    /// Update an existing book
    pub async fn update_book(
        &self,
        actor: &UserClaims,
        id: i32,
        book: UpdateBook,
    ) -> AppResult<BookDetails> {
        actor.ensure_password_current()?;
        actor.require_staff()?;
        book.validate()?;

        self.repository.books.update(id, &book).await
    }

    /// Delete a book (refused while borrows are outstanding)
    pub async fn delete_book(&self, actor: &UserClaims, id: i32) -> AppResult<()> {
        actor.ensure_password_current()?;
        actor.require_staff()?;

        self.repository.books.delete(id).await
    }

    // Authors

    /// Search authors by name
    pub async fn search_authors(&self, query: &AuthorQuery) -> AppResult<(Vec<Author>, i64)> {
        self.repository.authors.search(query).await
    }

    /// Get author by ID
    pub async fn get_author(&self, id: i32) -> AppResult<Author> {
        self.repository.authors.get_by_id(id).await
    }

    /// Create a new author
    pub async fn create_author(&self, actor: &UserClaims, author: CreateAuthor) -> AppResult<Author> {
        actor.ensure_password_current()?;
        actor.require_staff()?;
        author.validate()?;

        self.repository.authors.create(&author).await
    }

    /// Update an existing author
    pub async fn update_author(
        &self,
        actor: &UserClaims,
        id: i32,
        author: UpdateAuthor,
    ) -> AppResult<Author> {
        actor.ensure_password_current()?;
        actor.require_staff()?;
        author.validate()?;

        self.repository.authors.update(id, &author).await
    }

    /// Delete an author (books keep existing, join rows are detached)
    pub async fn delete_author(&self, actor: &UserClaims, id: i32) -> AppResult<()> {
        actor.ensure_password_current()?;
        actor.require_staff()?;

        self.repository.authors.delete(id).await
    }

    // Categories

    /// List all categories
    pub async fn list_categories(&self) -> AppResult<Vec<Category>> {
        self.repository.categories.list().await
    }

    /// Create a new category
    pub async fn create_category(
        &self,
        actor: &UserClaims,
        category: CreateCategory,
    ) -> AppResult<Category> {
        actor.ensure_password_current()?;
        actor.require_staff()?;
        category.validate()?;

        if self
            .repository
            .categories
            .name_exists(&category.name, None)
            .await?
        {
            return Err(AppError::Conflict("Category name already exists".to_string()));
        }

        self.repository.categories.create(&category).await
    }

    /// Update an existing category
    pub async fn update_category(
        &self,
        actor: &UserClaims,
        id: i32,
        category: UpdateCategory,
    ) -> AppResult<Category> {
        actor.ensure_password_current()?;
        actor.require_staff()?;
        category.validate()?;

        if self
            .repository
            .categories
            .name_exists(&category.name, Some(id))
            .await?
        {
            return Err(AppError::Conflict("Category name already exists".to_string()));
        }

        self.repository.categories.update(id, &category).await
    }

    /// Delete a category (books keep existing, join rows are detached)
    pub async fn delete_category(&self, actor: &UserClaims, id: i32) -> AppResult<()> {
        actor.ensure_password_current()?;
        actor.require_staff()?;

        self.repository.categories.delete(id).await
    }
}
