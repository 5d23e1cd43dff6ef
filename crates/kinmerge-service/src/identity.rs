//! Callers and user lookup.

use serde::{Deserialize, Serialize};

use kinmerge_core::{person::normalize_phone, FamilyCode};
use kinmerge_storage::{MergeStore, UserRecord};

use crate::error::ServiceError;
use crate::state::AppState;

/// The authenticated caller of an operation. Authentication happens
/// upstream; the service only checks membership and admin rights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_code: Option<FamilyCode>,
    #[serde(default)]
    pub is_admin: bool,
}

impl Actor {
    pub fn member(user_id: impl Into<String>, family: FamilyCode) -> Self {
        Actor {
            user_id: user_id.into(),
            family_code: Some(family),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>, family: FamilyCode) -> Self {
        Actor {
            is_admin: true,
            ..Actor::member(user_id, family)
        }
    }

    pub fn belongs_to(&self, family: &FamilyCode) -> bool {
        self.family_code.as_ref() == Some(family)
    }

    pub fn is_admin_of(&self, family: &FamilyCode) -> bool {
        self.is_admin && self.belongs_to(family)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhoneLookup {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_code: Option<FamilyCode>,
}

/// Looks a user up by phone number. Formatting characters are ignored.
pub async fn lookup_user_by_phone<S: MergeStore + Send>(
    state: &AppState<S>,
    phone: &str,
) -> Result<PhoneLookup, ServiceError> {
    let digits = normalize_phone(phone);
    if digits.is_empty() {
        return Err(ServiceError::Validation(format!(
            "'{}' contains no digits",
            phone
        )));
    }
    let user = state.with_store(move |store| store.find_by_phone(&digits)).await?;
    Ok(PhoneLookup {
        exists: user.is_some(),
        family_code: user.as_ref().and_then(|u| u.family_code.clone()),
        user,
    })
}
