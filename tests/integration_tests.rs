//! Service integration tests
//!
//! These run against a live PostgreSQL pointed to by DATABASE_URL.
//! Run with: cargo test -- --ignored

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;

use athenaeum::{
    config::{AuthConfig, BorrowsConfig},
    error::AppError,
    models::{
        book::{CreateBook, UpdateBook},
        borrow::{BorrowQuery, BorrowStatus, CreateBorrow},
        category::CreateCategory,
        user::{ChangePassword, CreateUser, RegisterUser, Role, User, UserClaims},
    },
    repository::Repository,
    services::Services,
};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique suffix for emails/titles so tests never collide
fn unique() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .subsec_nanos();
    format!("{}-{}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

async fn setup() -> (Repository, Services) {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("Failed to connect to database");

    let repository = Repository::new(pool);
    repository.migrate().await.expect("Failed to run migrations");

    let services = Services::new(
        repository.clone(),
        AuthConfig::default(),
        BorrowsConfig::default(),
    );

    (repository, services)
}

fn claims_for(user: &User) -> UserClaims {
    let now = Utc::now().timestamp();
    UserClaims {
        sub: user.email.clone(),
        user_id: user.id,
        role: user.role,
        requires_password_change: user.requires_password_change,
        exp: now + 3600,
        iat: now,
    }
}

/// Create an account directly through the repository (test bootstrap)
async fn create_account(
    repository: &Repository,
    services: &Services,
    role: Role,
    requires_password_change: bool,
) -> User {
    let create = CreateUser {
        email: format!("{}-{}@test.local", role, unique()),
        password: "correct horse battery".to_string(),
        name: format!("Test {}", role),
        role: Some(role),
        avatar_url: None,
        requires_password_change: None,
    };
    let hash = services
        .users
        .hash_password(&create.password)
        .expect("Failed to hash password");
    repository
        .users
        .create(&create, &hash, role, requires_password_change)
        .await
        .expect("Failed to create account")
}

async fn create_book(services: &Services, actor: &UserClaims, quantity: i32) -> i32 {
    let book = services
        .catalog
        .create_book(
            actor,
            CreateBook {
                title: format!("Test Book {}", unique()),
                isbn: None,
                description: None,
                publication_date: None,
                cover_url: None,
                page_count: Some(320),
                quantity,
                author_ids: vec![],
                category_ids: vec![],
            },
        )
        .await
        .expect("Failed to create book");
    book.book.id
}

fn borrow_request(user_id: i32, book_id: i32) -> CreateBorrow {
    CreateBorrow {
        user_id,
        book_id,
        due_date: Utc::now() + Duration::days(7),
        note: None,
    }
}

#[tokio::test]
#[ignore]
async fn borrowing_exhausts_availability() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let patron = create_account(&repository, &services, Role::User, false).await;
    let actor = claims_for(&admin);

    let book_id = create_book(&services, &actor, 3).await;

    for expected_available in [2, 1, 0] {
        services
            .borrows
            .create_borrow(&actor, borrow_request(patron.id, book_id))
            .await
            .expect("Borrow should succeed while copies remain");
        let details = services.catalog.get_book(book_id).await.unwrap();
        assert_eq!(details.book.available, expected_available);
        assert_eq!(details.book.quantity, 3);
    }

    let err = services
        .borrows
        .create_borrow(&actor, borrow_request(patron.id, book_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unavailable(_)), "got {:?}", err);
}

#[tokio::test]
#[ignore]
async fn double_return_fails_and_increments_once() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let patron = create_account(&repository, &services, Role::User, false).await;
    let actor = claims_for(&admin);

    let book_id = create_book(&services, &actor, 2).await;
    let borrow = services
        .borrows
        .create_borrow(&actor, borrow_request(patron.id, book_id))
        .await
        .unwrap();

    let returned = services.borrows.return_borrow(&actor, borrow.id).await.unwrap();
    assert_eq!(returned.status, BorrowStatus::Returned);
    assert!(returned.returned_at.is_some());

    let err = services.borrows.return_borrow(&actor, borrow.id).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyReturned(_)), "got {:?}", err);

    // Incremented exactly once
    let details = services.catalog.get_book(book_id).await.unwrap();
    assert_eq!(details.book.available, 2);
}

#[tokio::test]
#[ignore]
async fn concurrent_borrows_of_last_copy_yield_one_success() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let patron = create_account(&repository, &services, Role::User, false).await;
    let actor = claims_for(&admin);

    let book_id = create_book(&services, &actor, 1).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let services = services.clone();
        let actor = actor.clone();
        let request = borrow_request(patron.id, book_id);
        handles.push(tokio::spawn(async move {
            services.borrows.create_borrow(&actor, request).await
        }));
    }

    let mut successes = 0;
    let mut unavailable = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(AppError::Unavailable(_)) => unavailable += 1,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(unavailable, 3);

    let details = services.catalog.get_book(book_id).await.unwrap();
    assert_eq!(details.book.available, 0);
}

#[tokio::test]
#[ignore]
async fn librarian_user_management_rules() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let librarian = create_account(&repository, &services, Role::Librarian, false).await;
    let librarian_claims = claims_for(&librarian);
    let admin_claims = claims_for(&admin);

    // Librarian may not delete an admin
    let err = services
        .users
        .delete_user(&librarian_claims, admin.id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "got {:?}", err);

    // Librarian deletes a clean patron
    let clean = create_account(&repository, &services, Role::User, false).await;
    services
        .users
        .delete_user(&librarian_claims, clean.id, false)
        .await
        .expect("Deleting a patron without borrows should succeed");

    // Patron with an active borrow blocks a plain delete
    let patron = create_account(&repository, &services, Role::User, false).await;
    let book_id = create_book(&services, &admin_claims, 1).await;
    services
        .borrows
        .create_borrow(&admin_claims, borrow_request(patron.id, book_id))
        .await
        .unwrap();

    let err = services
        .users
        .delete_user(&librarian_claims, patron.id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DependencyExists(_)), "got {:?}", err);

    // Force delete cascades the borrow and restores availability
    services
        .users
        .delete_user(&librarian_claims, patron.id, true)
        .await
        .expect("Force delete should succeed");
    assert_eq!(repository.borrows.count_for_user(patron.id).await.unwrap(), 0);
    let details = services.catalog.get_book(book_id).await.unwrap();
    assert_eq!(details.book.available, 1);
}

#[tokio::test]
#[ignore]
async fn self_deletion_is_always_rejected() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let claims = claims_for(&admin);

    let err = services.users.delete_user(&claims, admin.id, true).await.unwrap_err();
    assert!(matches!(err, AppError::CannotDeleteSelf), "got {:?}", err);
}

#[tokio::test]
#[ignore]
async fn quantity_cannot_drop_below_outstanding_loans() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let patron = create_account(&repository, &services, Role::User, false).await;
    let actor = claims_for(&admin);

    let book_id = create_book(&services, &actor, 5).await;
    for _ in 0..4 {
        services
            .borrows
            .create_borrow(&actor, borrow_request(patron.id, book_id))
            .await
            .unwrap();
    }

    // 4 copies on loan: shrinking to 2 must be rejected
    let err = services
        .catalog
        .update_book(
            &actor,
            book_id,
            UpdateBook { quantity: Some(2), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "got {:?}", err);

    // Shrinking to exactly the outstanding count leaves nothing available
    let details = services
        .catalog
        .update_book(
            &actor,
            book_id,
            UpdateBook { quantity: Some(4), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(details.book.quantity, 4);
    assert_eq!(details.book.available, 0);
}

#[tokio::test]
#[ignore]
async fn email_uniqueness_is_case_insensitive() {
    let (_repository, services) = setup().await;

    let email = format!("Unique-{}@Test.Local", unique());
    services
        .users
        .register(RegisterUser {
            email: email.clone(),
            password: "correct horse battery".to_string(),
            name: "First".to_string(),
        })
        .await
        .expect("First registration should succeed");

    let err = services
        .users
        .register(RegisterUser {
            email: email.to_lowercase(),
            password: "correct horse battery".to_string(),
            name: "Second".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "got {:?}", err);
}

#[tokio::test]
#[ignore]
async fn due_date_window_is_enforced() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let actor = claims_for(&admin);
    let book_id = create_book(&services, &actor, 1).await;

    for bad_due in [Utc::now() + Duration::days(20), Utc::now() + Duration::hours(12)] {
        let err = services
            .borrows
            .create_borrow(
                &actor,
                CreateBorrow {
                    user_id: admin.id,
                    book_id,
                    due_date: bad_due,
                    note: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "got {:?}", err);
    }

    // Nothing was taken off the shelf
    let details = services.catalog.get_book(book_id).await.unwrap();
    assert_eq!(details.book.available, 1);
}

#[tokio::test]
#[ignore]
async fn status_filter_matches_derived_state() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let patron = create_account(&repository, &services, Role::User, false).await;
    let actor = claims_for(&admin);

    let book_id = create_book(&services, &actor, 1).await;
    let borrow = services
        .borrows
        .create_borrow(&actor, borrow_request(patron.id, book_id))
        .await
        .unwrap();
    assert_eq!(borrow.status, BorrowStatus::Borrowed);

    let query = |status| BorrowQuery {
        status: Some(status),
        user_id: Some(patron.id),
        page: None,
        per_page: None,
    };

    let (active, _) = services
        .borrows
        .list_borrows(&actor, &query(BorrowStatus::Borrowed))
        .await
        .unwrap();
    assert!(active.iter().any(|b| b.id == borrow.id));

    let (returned, _) = services
        .borrows
        .list_borrows(&actor, &query(BorrowStatus::Returned))
        .await
        .unwrap();
    assert!(!returned.iter().any(|b| b.id == borrow.id));

    services.borrows.return_borrow(&actor, borrow.id).await.unwrap();

    let (returned, _) = services
        .borrows
        .list_borrows(&actor, &query(BorrowStatus::Returned))
        .await
        .unwrap();
    assert!(returned.iter().any(|b| b.id == borrow.id));
}

#[tokio::test]
#[ignore]
async fn deleting_category_detaches_books() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let actor = claims_for(&admin);

    let category = services
        .catalog
        .create_category(&actor, CreateCategory { name: format!("Genre {}", unique()) })
        .await
        .unwrap();

    let book = services
        .catalog
        .create_book(
            &actor,
            CreateBook {
                title: format!("Categorized {}", unique()),
                isbn: None,
                description: None,
                publication_date: None,
                cover_url: None,
                page_count: None,
                quantity: 1,
                author_ids: vec![],
                category_ids: vec![category.id],
            },
        )
        .await
        .unwrap();
    assert_eq!(book.categories.len(), 1);

    services.catalog.delete_category(&actor, category.id).await.unwrap();

    // The book survives, only the association is gone
    let details = services.catalog.get_book(book.book.id).await.unwrap();
    assert!(details.categories.is_empty());
}

#[tokio::test]
#[ignore]
async fn pending_password_change_blocks_everything_but_the_change() {
    let (repository, services) = setup().await;
    let admin = create_account(&repository, &services, Role::Admin, false).await;
    let actor = claims_for(&admin);
    let book_id = create_book(&services, &actor, 1).await;

    // Staff-created account: must set a password before anything else
    let newcomer = create_account(&repository, &services, Role::User, true).await;
    let newcomer_claims = claims_for(&newcomer);
    assert!(newcomer_claims.requires_password_change);

    let err = services
        .borrows
        .create_borrow(&newcomer_claims, borrow_request(newcomer.id, book_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "got {:?}", err);

    // Changing the password is allowed and clears the flag
    let token = services
        .users
        .change_password(
            &newcomer_claims,
            ChangePassword {
                current_password: "correct horse battery".to_string(),
                new_password: "a brand new passphrase".to_string(),
            },
        )
        .await
        .expect("Password change should be allowed");

    let refreshed = UserClaims::from_token(&token, &AuthConfig::default().jwt_secret).unwrap();
    assert!(!refreshed.requires_password_change);

    services
        .borrows
        .create_borrow(&refreshed, borrow_request(newcomer.id, book_id))
        .await
        .expect("Mutations should work after the password change");
}

#[tokio::test]
#[ignore]
async fn authenticate_verifies_credentials() {
    let (_repository, services) = setup().await;

    let email = format!("login-{}@test.local", unique());
    services
        .users
        .register(RegisterUser {
            email: email.clone(),
            password: "correct horse battery".to_string(),
            name: "Login Test".to_string(),
        })
        .await
        .unwrap();

    let (token, user) = services
        .users
        .authenticate(&email, "correct horse battery")
        .await
        .expect("Valid credentials should authenticate");
    assert_eq!(user.email, email);
    assert!(UserClaims::from_token(&token, &AuthConfig::default().jwt_secret).is_ok());

    let err = services
        .users
        .authenticate(&email, "wrong password")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authentication(_)), "got {:?}", err);
}
