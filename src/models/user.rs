//! User model, roles and authentication claims

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, FromRow, Postgres};
use validator::Validate;

use crate::error::{AppError, AppResult};

/// Account roles, ordered by privilege: USER < LIBRARIAN < ADMIN
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Librarian,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Librarian => "librarian",
            Role::Admin => "admin",
        }
    }

    /// Whether this role may manage (create, edit, delete) accounts of
    /// the target role. Admins manage everyone; librarians manage
    /// patrons only.
    pub fn can_manage(self, target: Role) -> bool {
        match (self, target) {
            (Role::Admin, _) => true,
            (Role::Librarian, Role::User) => true,
            (Role::Librarian, _) => false,
            (Role::User, _) => false,
        }
    }

    /// Librarian or admin
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Librarian | Role::Admin)
    }

    /// Plain patron account
    pub fn is_patron(self) -> bool {
        self == Role::User
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "librarian" => Ok(Role::Librarian),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

// SQLx conversions: roles are stored as text
impl sqlx::Type<Postgres> for Role {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> Decode<'r, Postgres> for Role {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s: String = Decode::<Postgres>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

impl Encode<'_, Postgres> for Role {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        let s: String = self.as_str().to_string();
        <String as Encode<Postgres>>::encode(s, buf)
    }
}

/// Full user model from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i32,
    pub email: String,
    /// Hashed password (argon2)
    #[serde(skip_serializing, default)]
    pub password: String,
    pub name: String,
    pub role: Role,
    pub avatar_url: Option<String>,
    /// Forces a password-set flow before any other mutation is allowed
    pub requires_password_change: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Short user representation for lists
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserSummary {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub active_borrows: Option<i64>,
    pub overdue_borrows: Option<i64>,
}

/// Create user request (staff-created account)
#[derive(Debug, Deserialize, Validate)]
pub struct CreateUser {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    #[validate(length(min = 1, message = "Name must not be empty"))]
    pub name: String,
    pub role: Option<Role>,
    pub avatar_url: Option<String>,
    /// Defaults to true for staff-created accounts
    pub requires_password_change: Option<bool>,
}

/// Self-registration request
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterUser {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    #[validate(length(min = 1, message = "Name must not be empty"))]
    pub name: String,
}

/// Update user request (management edit)
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateUser {
    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,
    #[validate(length(min = 1, message = "Name must not be empty"))]
    pub name: Option<String>,
    pub role: Option<Role>,
    pub avatar_url: Option<String>,
}

/// Update own profile request (for authenticated users)
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateProfile {
    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,
    #[validate(length(min = 1, message = "Name must not be empty"))]
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Password change request
#[derive(Debug, Deserialize, Validate)]
pub struct ChangePassword {
    pub current_password: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub new_password: String,
}

/// User query parameters
#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    /// Case-insensitive substring match on name or email
    pub name: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// JWT claims for authenticated users.
///
/// Claims are the request-scoped identity passed into every service
/// call; they are validated per request and never cached globally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,
    pub user_id: i32,
    pub role: Role,
    pub requires_password_change: bool,
    pub exp: i64,
    pub iat: i64,
}

impl UserClaims {
    /// Create a new JWT token
    pub fn create_token(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{encode, EncodingKey, Header};
        encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }

    /// Parse JWT token
    pub fn from_token(token: &str, secret: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        let token_data = decode::<Self>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    // Authorization checks

    /// Require librarian or admin privileges
    pub fn require_staff(&self) -> AppResult<()> {
        if self.role.is_staff() {
            Ok(())
        } else {
            Err(AppError::Forbidden("Staff privileges required".to_string()))
        }
    }

    /// Require admin privileges
    pub fn require_admin(&self) -> AppResult<()> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(AppError::Forbidden("Administrator privileges required".to_string()))
        }
    }

    /// Require management rights over an account of the target role
    pub fn require_can_manage(&self, target: Role) -> AppResult<()> {
        if self.role.can_manage(target) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "Insufficient rights to manage a {} account",
                target
            )))
        }
    }

    /// Require the subject to be the target user, or staff
    pub fn require_self_or_staff(&self, target_user_id: i32) -> AppResult<()> {
        if self.user_id == target_user_id || self.role.is_staff() {
            Ok(())
        } else {
            Err(AppError::Forbidden("Not allowed to act for another user".to_string()))
        }
    }

    /// Reject mutations while a forced password change is pending
    pub fn ensure_password_current(&self) -> AppResult<()> {
        if self.requires_password_change {
            Err(AppError::Forbidden("Password change required before any other action".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::User < Role::Librarian);
        assert!(Role::Librarian < Role::Admin);
    }

    #[test]
    fn can_manage_table() {
        assert!(Role::Admin.can_manage(Role::Admin));
        assert!(Role::Admin.can_manage(Role::Librarian));
        assert!(Role::Admin.can_manage(Role::User));

        assert!(Role::Librarian.can_manage(Role::User));
        assert!(!Role::Librarian.can_manage(Role::Librarian));
        assert!(!Role::Librarian.can_manage(Role::Admin));

        assert!(!Role::User.can_manage(Role::User));
        assert!(!Role::User.can_manage(Role::Librarian));
        assert!(!Role::User.can_manage(Role::Admin));
    }

    #[test]
    fn patron_check_is_single_comparison() {
        assert!(Role::User.is_patron());
        assert!(!Role::Librarian.is_patron());
        assert!(!Role::Admin.is_patron());
    }

    #[test]
    fn role_parse_round_trip() {
        for role in [Role::User, Role::Librarian, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn claims_token_round_trip() {
        let now = Utc::now().timestamp();
        let claims = UserClaims {
            sub: "reader@example.org".to_string(),
            user_id: 7,
            role: Role::Librarian,
            requires_password_change: false,
            exp: now + 3600,
            iat: now,
        };

        let token = claims.create_token("test-secret").unwrap();
        let parsed = UserClaims::from_token(&token, "test-secret").unwrap();
        assert_eq!(parsed.user_id, 7);
        assert_eq!(parsed.role, Role::Librarian);
        assert!(UserClaims::from_token(&token, "other-secret").is_err());
    }

    #[test]
    fn pending_password_change_blocks_mutations() {
        let claims = UserClaims {
            sub: "new@example.org".to_string(),
            user_id: 1,
            role: Role::User,
            requires_password_change: true,
            exp: 0,
            iat: 0,
        };
        assert!(matches!(
            claims.ensure_password_current(),
            Err(AppError::Forbidden(_))
        ));
    }
}
