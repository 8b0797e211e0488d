//! User model and sign-in method enumeration.

use serde::{Deserialize, Serialize};

/// Sign-in method supported by the identity vendor.
///
/// Drives which adapter operation is invoked and which verification
/// sub-flow the client shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Google,
    Apple,
    Phone,
    Email,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Google => "google",
            AuthMethod::Apple => "apple",
            AuthMethod::Phone => "phone",
            AuthMethod::Email => "email",
        }
    }

    /// OAuth methods complete via a redirect callback rather than a
    /// code/link verification step.
    pub fn is_oauth(&self) -> bool {
        matches!(self, AuthMethod::Google | AuthMethod::Apple)
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(AuthMethod::Google),
            "apple" => Ok(AuthMethod::Apple),
            "phone" => Ok(AuthMethod::Phone),
            "email" => Ok(AuthMethod::Email),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coaching goals selected during onboarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Focus,
    Organization,
    EmotionalRegulation,
    Productivity,
    Relationships,
    SelfUnderstanding,
}

/// Notification preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub email_reminders: bool,
    pub sms_reminders: bool,
    pub weekly_digest: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            email_reminders: true,
            sms_reminders: false,
            weekly_digest: true,
        }
    }
}

/// User profile stored in Firestore.
///
/// The vendor identity platform is the source of truth for credentials;
/// this document mirrors the profile plus product-level fields. It is
/// held in memory for the session lifetime and never cached to durable
/// local storage beyond the minimal session markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Vendor-issued user id (also used as document ID)
    pub id: String,
    /// Display name (may be absent for phone-only accounts)
    pub display_name: Option<String>,
    /// Email address
    pub email: Option<String>,
    /// Phone number (E.164)
    pub phone: Option<String>,
    /// Sign-in methods linked to this account
    pub providers: Vec<AuthMethod>,
    /// When the account was created (RFC3339)
    pub created_at: String,
    /// Last successful login (RFC3339)
    pub last_login_at: String,
    #[serde(default)]
    pub notification_prefs: NotificationPrefs,
    /// Goal selections from the onboarding quiz
    #[serde(default)]
    pub goals: Vec<Goal>,
}

impl User {
    pub fn has_provider(&self, method: AuthMethod) -> bool {
        self.providers.contains(&method)
    }
}
