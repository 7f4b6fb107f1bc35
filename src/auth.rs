use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode};
use tower_sessions::Session;
use uuid::Uuid;

use crate::constants::*;
use crate::database::Db;
use crate::error::{ApiError, ApiResult};
use crate::extract::AppJson;
use crate::models::{LoginPayload, Member, PublicMember, RegisterPayload};

fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to hash password: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> ApiResult<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to parse password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn validate_credentials(username: &str, password: &str) -> ApiResult<()> {
    if username.trim().is_empty() {
        return Err(ApiError::validation("Username cannot be empty"));
    }
    if username.len() < MIN_USERNAME_LENGTH || username.len() > MAX_USERNAME_LENGTH {
        return Err(ApiError::validation(format!(
            "Username must be between {} and {} characters",
            MIN_USERNAME_LENGTH, MAX_USERNAME_LENGTH
        )));
    }
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LENGTH
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::validation(
            "Username can only contain alphanumeric characters, underscores, and hyphens",
        ));
    }
    Ok(())
}

/// Creates a member in `family_id`.
pub async fn create_member(
    db: &Db,
    family_id: &str,
    username: &str,
    password: &str,
) -> ApiResult<PublicMember> {
    validate_credentials(username, password)?;
    let hash = hash_password(password)?;
    let id = Uuid::new_v4().to_string();
    let conn = db.write().await;

    conn.execute(
        "INSERT INTO members (id, family_id, name, password_hash) VALUES (?, ?, ?, ?)",
        (id.as_str(), family_id, username, hash.as_str()),
    )
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE constraint failed") {
            ApiError::Conflict("Username already exists".to_string())
        } else {
            ApiError::Database(e)
        }
    })?;

    tracing::info!(member_id = %id, family_id, "member created");
    Ok(PublicMember {
        id,
        family_id: family_id.to_string(),
        username: username.to_string(),
    })
}

async fn start_session(session: &Session, member: &PublicMember) -> ApiResult<()> {
    let store_err = |e: tower_sessions::session::Error| ApiError::Internal(e.into());
    session.insert("member_id", &member.id).await.map_err(store_err)?;
    session
        .insert("username", &member.username)
        .await
        .map_err(store_err)?;
    session
        .insert("family_id", &member.family_id)
        .await
        .map_err(store_err)?;
    Ok(())
}

/// Registers a member in a brand-new family and logs them in.
pub async fn register(
    State(db): State<Db>,
    session: Session,
    AppJson(payload): AppJson<RegisterPayload>,
) -> ApiResult<(StatusCode, Json<PublicMember>)> {
    let family_id = Uuid::new_v4().to_string();
    let member = create_member(&db, &family_id, &payload.username, &payload.password).await?;
    start_session(&session, &member).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

/// Adds another member to the caller's family.
pub async fn add_family_member(
    State(db): State<Db>,
    session: Session,
    AppJson(payload): AppJson<RegisterPayload>,
) -> ApiResult<(StatusCode, Json<PublicMember>)> {
    let current = get_current_member(&session).await?;
    let member =
        create_member(&db, &current.family_id, &payload.username, &payload.password).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn get_member_by_username(db: &Db, username: &str) -> ApiResult<Option<Member>> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            "SELECT id, family_id, name, password_hash FROM members WHERE name = ?",
            [username],
        )
        .await?;

    if let Some(row) = rows.next().await? {
        Ok(Some(Member {
            id: row.get(0)?,
            family_id: row.get(1)?,
            username: row.get(2)?,
            password_hash: row.get(3)?,
        }))
    } else {
        Ok(None)
    }
}

pub async fn login(
    State(db): State<Db>,
    session: Session,
    AppJson(payload): AppJson<LoginPayload>,
) -> ApiResult<(StatusCode, Json<PublicMember>)> {
    if payload.username.trim().is_empty() {
        return Err(ApiError::validation("Username cannot be empty"));
    }
    if payload.password.is_empty() {
        return Err(ApiError::validation("Password cannot be empty"));
    }

    let Some(member) = get_member_by_username(&db, &payload.username).await? else {
        return Err(ApiError::Unauthorized);
    };

    if !verify_password(&payload.password, &member.password_hash)? {
        return Err(ApiError::Unauthorized);
    }

    let public = PublicMember {
        id: member.id,
        family_id: member.family_id,
        username: member.username,
    };
    start_session(&session, &public).await?;

    Ok((StatusCode::OK, Json(public)))
}

/// Caller identity from the session; every ledger endpoint is scoped by its
/// `family_id`.
pub async fn get_current_member(session: &Session) -> ApiResult<PublicMember> {
    let read = |e: tower_sessions::session::Error| ApiError::Internal(e.into());
    let member_id: Option<String> = session.get("member_id").await.map_err(read)?;
    let username: Option<String> = session.get("username").await.map_err(read)?;
    let family_id: Option<String> = session.get("family_id").await.map_err(read)?;

    match (member_id, username, family_id) {
        (Some(id), Some(username), Some(family_id)) => Ok(PublicMember {
            id,
            family_id,
            username,
        }),
        _ => Err(ApiError::Unauthorized),
    }
}

pub async fn me(session: Session) -> ApiResult<(StatusCode, Json<PublicMember>)> {
    let member = get_current_member(&session).await?;
    Ok((StatusCode::OK, Json(member)))
}

pub async fn logout(session: Session) -> ApiResult<StatusCode> {
    session.clear().await;
    Ok(StatusCode::NO_CONTENT)
}
