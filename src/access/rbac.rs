//! Role to permission mapping.
//!
//! The table is a total, exhaustive `match`: adding a role without deciding its
//! permissions does not compile. There is no implicit hierarchy between roles.
//! Checks always read the session's current role, never the login-time snapshot.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

use super::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Moderator,
}

impl Role {
    pub const ALL: [Self; 3] = [Self::SuperAdmin, Self::Admin, Self::Moderator];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::Moderator => "moderator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "super_admin" => Ok(Self::SuperAdmin),
            "admin" => Ok(Self::Admin),
            "moderator" => Ok(Self::Moderator),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewDashboard,
    ViewRsvps,
    ManageRsvps,
    ModerateGuestbook,
    ManageGallery,
    ManageNotifications,
    ViewAuditLog,
    ExportData,
    ManageUsers,
    ManageSettings,
}

impl Permission {
    pub const ALL: [Self; 10] = [
        Self::ViewDashboard,
        Self::ViewRsvps,
        Self::ManageRsvps,
        Self::ModerateGuestbook,
        Self::ManageGallery,
        Self::ManageNotifications,
        Self::ViewAuditLog,
        Self::ExportData,
        Self::ManageUsers,
        Self::ManageSettings,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ViewDashboard => "view_dashboard",
            Self::ViewRsvps => "view_rsvps",
            Self::ManageRsvps => "manage_rsvps",
            Self::ModerateGuestbook => "moderate_guestbook",
            Self::ManageGallery => "manage_gallery",
            Self::ManageNotifications => "manage_notifications",
            Self::ViewAuditLog => "view_audit_log",
            Self::ExportData => "export_data",
            Self::ManageUsers => "manage_users",
            Self::ManageSettings => "manage_settings",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|permission| permission.as_str() == value)
            .ok_or_else(|| format!("unknown permission: {value}"))
    }
}

const SUPER_ADMIN_PERMISSIONS: [Permission; 10] = Permission::ALL;

const ADMIN_PERMISSIONS: [Permission; 8] = [
    Permission::ViewDashboard,
    Permission::ViewRsvps,
    Permission::ManageRsvps,
    Permission::ModerateGuestbook,
    Permission::ManageGallery,
    Permission::ManageNotifications,
    Permission::ViewAuditLog,
    Permission::ExportData,
];

const MODERATOR_PERMISSIONS: [Permission; 3] = [
    Permission::ViewDashboard,
    Permission::ViewRsvps,
    Permission::ModerateGuestbook,
];

#[must_use]
pub const fn role_permissions(role: Role) -> &'static [Permission] {
    match role {
        Role::SuperAdmin => &SUPER_ADMIN_PERMISSIONS,
        Role::Admin => &ADMIN_PERMISSIONS,
        Role::Moderator => &MODERATOR_PERMISSIONS,
    }
}

#[must_use]
pub fn role_grants(role: Role, permission: Permission) -> bool {
    role_permissions(role).contains(&permission)
}

#[must_use]
pub fn has_permission(session: &Session, permission: Permission) -> bool {
    role_grants(session.role, permission)
}

#[must_use]
pub fn has_role(session: &Session, role: Role) -> bool {
    session.role == role
}

#[must_use]
pub fn has_any_role(session: &Session, roles: &[Role]) -> bool {
    roles.contains(&session.role)
}
