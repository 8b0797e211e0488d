// SPDX-License-Identifier: MIT

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Users (profile mirror of the vendor identity platform)
//! - Rate limit records (transactional attempt counting)
//! - Devices (known-device set per user)

use crate::db::collections;
use crate::error::AppError;
use crate::models::{DeviceInfo, RateLimitAction, RateLimitDecision, RateLimitRecord, User};
use chrono::{DateTime, Utc};

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        // If the emulator environment variable is set, use unauthenticated
        // connection to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a mock Firestore client for testing (offline mode).
    ///
    /// All database operations will return an error if called.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    // ─── User Operations ─────────────────────────────────────────

    /// Get a user by vendor id.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Create or update a user.
    pub async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(&user.id)
            .object(user)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Find a user by email (linking-conflict detection).
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let email = email.to_lowercase();
        let users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| q.field("email").eq(email.clone()))
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(users.into_iter().next())
    }

    /// Find a user by phone (linking-conflict detection).
    pub async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>, AppError> {
        let phone = phone.to_string();
        let users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| q.field("phone").eq(phone.clone()))
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(users.into_iter().next())
    }

    // ─── Rate Limit Operations ───────────────────────────────────

    /// Atomically apply one attempt to the (action, identifier) record.
    ///
    /// Runs inside a Firestore transaction: the record read registers the
    /// document for conflict detection, so two concurrent requests
    /// incrementing the same counter cannot lose an update — the loser is
    /// retried by Firestore with fresh data.
    pub async fn apply_rate_limit_attempt(
        &self,
        action: RateLimitAction,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let doc_id = Self::rate_limit_doc_id(action, identifier);
        let policy = action.policy();

        let mut transaction = self
            .get_client()?
            .begin_transaction()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        // Read (registers the document for conflict detection)
        let current: Option<RateLimitRecord> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::RATE_LIMITS)
            .obj()
            .one(&doc_id)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to read rate limit record: {}", e))
            })?;

        let mut record = current.unwrap_or_else(|| RateLimitRecord::new(now));
        let decision = record.record_attempt(policy, now);

        self.get_client()?
            .fluent()
            .update()
            .in_col(collections::RATE_LIMITS)
            .document_id(&doc_id)
            .object(&record)
            .add_to_transaction(&mut transaction)
            .map_err(|e| {
                AppError::Database(format!("Failed to add rate limit write: {}", e))
            })?;

        transaction
            .commit()
            .await
            .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;

        Ok(decision)
    }

    /// Document id for a rate limit record.
    pub fn rate_limit_doc_id(action: RateLimitAction, identifier: &str) -> String {
        // Identifiers can contain characters Firestore dislikes in ids
        format!("{}:{}", action.as_str(), urlencoding::encode(identifier))
    }

    // ─── Device Operations ───────────────────────────────────────

    /// Get a known device by user and fingerprint.
    pub async fn get_device(
        &self,
        user_id: &str,
        fingerprint: &str,
    ) -> Result<Option<DeviceInfo>, AppError> {
        let doc_id = format!("{}_{}", user_id, fingerprint);
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::DEVICES)
            .obj()
            .one(&doc_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Create or refresh a device record.
    pub async fn upsert_device(&self, device: &DeviceInfo) -> Result<(), AppError> {
        let doc_id = format!("{}_{}", device.user_id, device.fingerprint);
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::DEVICES)
            .document_id(&doc_id)
            .object(device)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// List a user's known devices, most recently seen first.
    pub async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, AppError> {
        let user_id = user_id.to_string();
        self.get_client()?
            .fluent()
            .select()
            .from(collections::DEVICES)
            .filter(move |q| q.field("user_id").eq(user_id.clone()))
            .order_by([(
                "last_seen",
                firestore::FirestoreQueryDirection::Descending,
            )])
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}
