//! Authentication and user management service

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use validator::Validate;

use crate::{
    config::AuthConfig,
    error::{AppError, AppResult},
    models::user::{
        ChangePassword, CreateUser, RegisterUser, Role, UpdateProfile, UpdateUser, User,
        UserClaims, UserQuery, UserSummary,
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct UsersService {
    repository: Repository,
    config: AuthConfig,
}

impl UsersService {
    pub fn new(repository: Repository, config: AuthConfig) -> Self {
        Self { repository, config }
    }

    /// Authenticate by email and return a JWT token with the user
    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<(String, User)> {
        let user = self
            .repository
            .users
            .get_by_email(email)
            .await?
            .ok_or_else(|| AppError::Authentication("Invalid email or password".to_string()))?;

        // Check password
        if !self.verify_password(&user, password)? {
            return Err(AppError::Authentication("Invalid email or password".to_string()));
        }

        let token = self.create_token_for_user(&user)?;
        Ok((token, user))
    }

    /// Create a JWT token for a user
    fn create_token_for_user(&self, user: &User) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let exp = now + (self.config.jwt_expiration_hours as i64 * 3600);

        let claims = UserClaims {
            sub: user.email.clone(),
            user_id: user.id,
            role: user.role,
            requires_password_change: user.requires_password_change,
            exp,
            iat: now,
        };

        claims
            .create_token(&self.config.jwt_secret)
            .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))
    }

    /// Self-registration: creates a patron account
    pub async fn register(&self, user: RegisterUser) -> AppResult<User> {
        user.validate()?;

        if self.repository.users.email_exists(&user.email, None).await? {
            return Err(AppError::Conflict("Email already exists".to_string()));
        }

        let password_hash = self.hash_password(&user.password)?;
        let create = CreateUser {
            email: user.email,
            password: user.password,
            name: user.name,
            role: None,
            avatar_url: None,
            requires_password_change: None,
        };

        // Self-registered users picked their own password
        self.repository
            .users
            .create(&create, &password_hash, Role::User, false)
            .await
    }

    /// Create a new user (staff operation)
    pub async fn create_user(&self, actor: &UserClaims, user: CreateUser) -> AppResult<User> {
        actor.ensure_password_current()?;
        actor.require_staff()?;

        let role = user.role.unwrap_or(Role::User);
        actor.require_can_manage(role)?;

        user.validate()?;

        if self.repository.users.email_exists(&user.email, None).await? {
            return Err(AppError::Conflict("Email already exists".to_string()));
        }

        let password_hash = self.hash_password(&user.password)?;
        // Staff-created accounts must set their own password on first login
        let requires_password_change = user.requires_password_change.unwrap_or(true);

        self.repository
            .users
            .create(&user, &password_hash, role, requires_password_change)
            .await
    }

    /// Get user by ID (self or staff)
    pub async fn get_user(&self, actor: &UserClaims, id: i32) -> AppResult<User> {
        actor.require_self_or_staff(id)?;
        self.repository.users.get_by_id(id).await
    }

    /// Search users (staff only)
    pub async fn list_users(
        &self,
        actor: &UserClaims,
        query: &UserQuery,
    ) -> AppResult<(Vec<UserSummary>, i64)> {
        actor.require_staff()?;
        self.repository.users.search(query).await
    }

    /// Update an existing user (management edit)
    pub async fn update_user(&self, actor: &UserClaims, id: i32, user: UpdateUser) -> AppResult<User> {
        actor.ensure_password_current()?;

        let target = self.repository.users.get_by_id(id).await?;
        actor.require_can_manage(target.role)?;

        // A role change also needs rights over the new role
        if let Some(new_role) = user.role {
            actor.require_can_manage(new_role)?;
        }

        user.validate()?;

        if let Some(ref email) = user.email {
            if self.repository.users.email_exists(email, Some(id)).await? {
                return Err(AppError::Conflict("Email already exists".to_string()));
            }
        }

        self.repository.users.update(id, &user).await
    }

    /// Update the actor's own profile
    pub async fn update_profile(&self, actor: &UserClaims, profile: UpdateProfile) -> AppResult<User> {
        actor.ensure_password_current()?;
        profile.validate()?;

        if let Some(ref email) = profile.email {
            if self
                .repository
                .users
                .email_exists(email, Some(actor.user_id))
                .await?
            {
                return Err(AppError::Conflict("Email already exists".to_string()));
            }
        }

        self.repository.users.update_profile(actor.user_id, &profile).await
    }

    /// Change the actor's password and issue a fresh token.
    ///
    /// This is the one mutation allowed while `requires_password_change`
    /// is set; completing it clears the flag.
    pub async fn change_password(
        &self,
        actor: &UserClaims,
        change: ChangePassword,
    ) -> AppResult<String> {
        change.validate()?;

        let user = self.repository.users.get_by_id(actor.user_id).await?;

        if !self.verify_password(&user, &change.current_password)? {
            return Err(AppError::Authentication("Current password is incorrect".to_string()));
        }

        let password_hash = self.hash_password(&change.new_password)?;
        self.repository.users.set_password(user.id, &password_hash).await?;

        let user = self.repository.users.get_by_id(user.id).await?;
        self.create_token_for_user(&user)
    }

    /// Delete a user.
    ///
    /// Without `force`, any dependent borrow record blocks the delete.
    /// With `force`, the user's borrow history is cascade-deleted in
    /// one transaction; this is destructive and is audit-logged.
    pub async fn delete_user(&self, actor: &UserClaims, id: i32, force: bool) -> AppResult<()> {
        actor.ensure_password_current()?;

        if actor.user_id == id {
            return Err(AppError::CannotDeleteSelf);
        }

        let target = self.repository.users.get_by_id(id).await?;
        actor.require_can_manage(target.role)?;

        let dependent_borrows = self.repository.borrows.count_for_user(id).await?;
        if dependent_borrows > 0 && !force {
            return Err(AppError::DependencyExists(format!(
                "User has {} borrow record(s); use force to cascade-delete them",
                dependent_borrows
            )));
        }

        if force {
            let removed = self.repository.users.force_delete(id).await?;
            tracing::warn!(
                actor_id = actor.user_id,
                user_id = id,
                email = %target.email,
                borrows_removed = removed,
                "Force-deleted user and cascade-deleted borrow records"
            );
        } else {
            self.repository.users.delete(id).await?;
        }

        Ok(())
    }

    /// Verify a password against the stored argon2 hash
    fn verify_password(&self, user: &User, password: &str) -> AppResult<bool> {
        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Hash a password using Argon2
    pub fn hash_password(&self, password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;
        Ok(hash.to_string())
    }
}
