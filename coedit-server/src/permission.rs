//! Role lookup and capability checks against a document record.

use serde::{Deserialize, Serialize};

use crate::Identifier;
use crate::error::{Error, Result};
use crate::store::{DocumentRecord, DocumentStore};

/// A user's relationship to a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Commenter,
    Viewer,
    None,
}

impl Role {
    pub fn can_read(self) -> bool {
        !matches!(self, Role::None)
    }
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }
    pub fn can_share(self) -> bool {
        self == Role::Owner
    }
    pub fn can_delete(self) -> bool {
        self == Role::Owner
    }
    pub fn can_restore(self) -> bool {
        self == Role::Owner
    }
}

/// Access level required for an operation on a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Edit,
    Owner,
}

/// The role `user_id` holds on `document`: ownership first, then the share
/// table.
pub fn resolve_role(document: &DocumentRecord, user_id: &Identifier) -> Role {
    if document.owner == *user_id {
        Role::Owner
    } else {
        document.shares.get(user_id).copied().unwrap_or(Role::None)
    }
}

fn permits(role: Role, required: Access) -> bool {
    match required {
        Access::Read => role.can_read(),
        Access::Edit => role.can_edit(),
        Access::Owner => role == Role::Owner,
    }
}

/// Load a document and check the caller's access in one step.
///
/// Called again on every edit, not just at join, so mid-session role
/// changes take effect.
pub async fn get_document_with_access(
    store: &dyn DocumentStore,
    id: &Identifier,
    user_id: &Identifier,
    required: Access,
) -> Result<(DocumentRecord, Role)> {
    let document = store.get_by_id(id).await?.ok_or(Error::NotFound)?;
    let role = resolve_role(&document, user_id);
    if !permits(role, required) {
        return Err(Error::Forbidden);
    }
    Ok((document, role))
}
