//! Embedding attributes
//!
//! The host page hands the embed four string attributes. They arrive either
//! as bare names (`user-id`) or with the `data-` prefix (`data-user-id`).

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use rtc_core::identity::FALLBACK_DISPLAY_NAME;
use rtc_core::{AuthError, IdentityRecord, Participant};

pub const ATTR_USER_NAME: &str = "user-name";
pub const ATTR_USER_ID: &str = "user-id";
pub const ATTR_USER_AVATAR: &str = "user-avatar";
pub const ATTR_USER_TOKEN: &str = "user-token";

/// Identity attributes supplied by the embedding application
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAttributes {
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub user_avatar: Option<String>,
    /// Read from host config but never written back out
    #[serde(default, skip_serializing)]
    pub user_token: Option<String>,
}

impl EmbedAttributes {
    /// Collect attributes from name/value pairs
    ///
    /// Unknown names are ignored; empty values count as absent.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut attrs = Self::default();

        for (name, value) in pairs {
            let name = name.as_ref();
            let key = name.strip_prefix("data-").unwrap_or(name);
            let slot = match key {
                ATTR_USER_NAME => &mut attrs.user_name,
                ATTR_USER_ID => &mut attrs.user_id,
                ATTR_USER_AVATAR => &mut attrs.user_avatar,
                ATTR_USER_TOKEN => &mut attrs.user_token,
                _ => {
                    debug!("Ignoring unknown embed attribute {}", name);
                    continue;
                }
            };
            *slot = non_empty(value.into());
        }

        attrs
    }

    /// Attributes derived from a stored user record and token
    ///
    /// A record without a resolvable id leaves `user_id` unset; `start`
    /// reports that as `MissingIdentity`.
    pub fn from_identity(record: &IdentityRecord, token: &str, asset_origin: Option<&str>) -> Self {
        Self {
            user_name: Some(record.display_name()),
            user_id: record.resolve_user_id().ok(),
            user_avatar: record.avatar_ref(asset_origin),
            user_token: non_empty(token.to_string()),
        }
    }

    /// Attributes as `data-` prefixed pairs, in the order the host sets them
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        [
            (ATTR_USER_NAME, &self.user_name),
            (ATTR_USER_ID, &self.user_id),
            (ATTR_USER_AVATAR, &self.user_avatar),
            (ATTR_USER_TOKEN, &self.user_token),
        ]
        .into_iter()
        .map(|(name, value)| (format!("data-{}", name), value.clone().unwrap_or_default()))
        .collect()
    }

    /// The local participant these attributes describe
    pub fn participant(&self) -> Result<Participant, AuthError> {
        let user_id = self
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingIdentity)?;

        let name = self
            .user_name
            .clone()
            .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string());
        let mut participant = Participant::new(user_id, name);
        if let Some(avatar) = &self.user_avatar {
            participant = participant.with_avatar(avatar.clone());
        }
        if let Some(token) = &self.user_token {
            participant = participant.with_token(token.clone());
        }
        Ok(participant)
    }
}

impl fmt::Debug for EmbedAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbedAttributes")
            .field("user_name", &self.user_name)
            .field("user_id", &self.user_id)
            .field("user_avatar", &self.user_avatar)
            .field("user_token", &self.user_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
