//! Role-based authorization over object rows and folders. Grounded in the
//! teacher's `AuthClaims` grant shape (`examples/chat/src/models/subscription.rs`),
//! generalized from a fixed claim set to the four CRUD actions
//! (`canCreate`/`canRead`/`canUpdate`/`canDelete`), each stored as its own
//! column rather than packed bits.

use diesel::sql_types::{BigInt, Bool, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;

use crate::db::Connection;
use crate::error::Result;
use crate::model::{Action, CurrentUser};

pub struct IsAuthorized<'a> {
    pub action: Action,
    pub object_pk: i64,
    pub folder_pk: Option<i64>,
    pub user: &'a CurrentUser,
}

#[derive(QueryableByName)]
struct GrantRow {
    #[diesel(sql_type = Bool)]
    allow: bool,
    #[diesel(sql_type = Bool)]
    is_inherited: bool,
}

/// `canRead|canUpdate|canDelete` join the object's `_pk` through the auth
/// table and role memberships; explicit denies override inherited allows;
/// among equally-direct grants the most permissive wins. A super-user
/// bypasses all checks.
pub async fn is_authorized(conn: &mut Connection<'_>, request: IsAuthorized<'_>) -> Result<bool> {
    if request.user.is_super_user {
        return Ok(true);
    }

    let column = request.action.column();
    let rows: Vec<GrantRow> = diesel::sql_query(format!(
        "SELECT auth.{column} AS allow, auth.is_inherited AS is_inherited
         FROM auth
         JOIN role_member ON role_member.role = auth.role
         WHERE auth.object_pk = $1 AND role_member.member = $2"
    ))
    .bind::<BigInt, _>(request.object_pk)
    .bind::<Text, _>(request.user.username.clone())
    .load(conn)
    .await
    .map_err(|error| crate::err!(500, message = format!("authorization lookup failed: {error}")))?;

    if rows.is_empty() {
        return Ok(false);
    }

    // Direct (non-inherited) grants win over inherited ones; among equally
    // direct grants, any explicit deny wins over an allow.
    let most_direct_is_inherited = rows.iter().all(|row| row.is_inherited);
    let decisive: Vec<&GrantRow> = rows.iter().filter(|row| row.is_inherited == most_direct_is_inherited).collect();

    if request.action == Action::CanCreate {
        if let Some(folder_pk) = request.folder_pk {
            let member_allowed = member_grant(conn, folder_pk, request.user).await?;
            if !member_allowed {
                return Ok(false);
            }
        }
    }

    Ok(decisive.iter().any(|row| row.allow))
}

async fn member_grant(conn: &mut Connection<'_>, folder_pk: i64, user: &CurrentUser) -> Result<bool> {
    Box::pin(is_authorized(
        conn,
        IsAuthorized {
            action: Action::CanCreate,
            object_pk: folder_pk,
            folder_pk: None,
            user,
        },
    ))
    .await
}

pub struct Grant<'a> {
    pub object_pk: i64,
    pub role: &'a str,
    pub is_member: bool,
    pub can_create: bool,
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

/// Upserts a grant; deleting the last action on a member grant deletes the
/// row entirely rather than leaving an all-false row behind.
pub async fn save_authorization(conn: &mut Connection<'_>, grant: Grant<'_>) -> Result<()> {
    let no_actions_remain = !grant.can_create && !grant.can_read && !grant.can_update && !grant.can_delete;

    if grant.is_member && no_actions_remain {
        diesel::sql_query("DELETE FROM auth WHERE object_pk = $1 AND role = $2 AND is_member_auth = TRUE")
            .bind::<BigInt, _>(grant.object_pk)
            .bind::<Text, _>(grant.role.to_owned())
            .execute(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to delete grant: {error}")))?;
        return Ok(());
    }

    diesel::sql_query(
        "INSERT INTO auth (object_pk, role, is_member_auth, can_create, can_read, can_update, can_delete, is_inherited)
         VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
         ON CONFLICT (object_pk, role, is_member_auth) DO UPDATE SET
             can_create = EXCLUDED.can_create,
             can_read = EXCLUDED.can_read,
             can_update = EXCLUDED.can_update,
             can_delete = EXCLUDED.can_delete,
             is_inherited = FALSE",
    )
    .bind::<BigInt, _>(grant.object_pk)
    .bind::<Text, _>(grant.role.to_owned())
    .bind::<Bool, _>(grant.is_member)
    .bind::<Bool, _>(grant.can_create)
    .bind::<Bool, _>(grant.can_read)
    .bind::<Bool, _>(grant.can_update)
    .bind::<Bool, _>(grant.can_delete)
    .execute(conn)
    .await
    .map_err(|error| crate::err!(500, message = format!("failed to save grant: {error}")))?;

    if grant.is_member {
        propagate_auth(conn, PropagateAuth {
            folder_pk: grant.object_pk,
            role: Some(grant.role.to_owned()),
            is_deleted: false,
        })
        .await?;
    }

    Ok(())
}

pub struct PropagateAuth {
    pub folder_pk: i64,
    pub role: Option<String>,
    pub is_deleted: bool,
}

#[derive(QueryableByName)]
struct ContainedPk {
    #[diesel(sql_type = BigInt)]
    object_pk: i64,
}

/// Recursively walks `folder -> contained objects -> child folders`,
/// replacing inherited member grants for `role`, stopping at any direct
/// (non-inherited) grant already present on a descendant.
pub async fn propagate_auth(conn: &mut Connection<'_>, request: PropagateAuth) -> Result<()> {
    let Some(role) = &request.role else {
        return Ok(());
    };

    let contained: Vec<ContainedPk> = diesel::sql_query("SELECT _pk AS object_pk FROM object WHERE folder = $1")
        .bind::<BigInt, _>(request.folder_pk)
        .load(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to list folder contents: {error}")))?;

    for row in contained {
        let has_direct_grant: bool = diesel::sql_query(
            "SELECT EXISTS(SELECT 1 FROM auth WHERE object_pk = $1 AND role = $2 AND is_inherited = FALSE) AS allow",
        )
        .bind::<BigInt, _>(row.object_pk)
        .bind::<Text, _>(role.clone())
        .get_result::<GrantRow>(conn)
        .await
        .map(|row| row.allow)
        .unwrap_or(false);

        if has_direct_grant {
            continue;
        }

        if request.is_deleted {
            diesel::sql_query("DELETE FROM auth WHERE object_pk = $1 AND role = $2 AND is_inherited = TRUE")
                .bind::<BigInt, _>(row.object_pk)
                .bind::<Text, _>(role.clone())
                .execute(conn)
                .await
                .ok();
        } else {
            diesel::sql_query(
                "INSERT INTO auth (object_pk, role, is_member_auth, can_create, can_read, can_update, can_delete, is_inherited)
                 SELECT $1, role, TRUE, can_create, can_read, can_update, can_delete, TRUE
                 FROM auth WHERE object_pk = $2 AND role = $3 AND is_member_auth = TRUE
                 ON CONFLICT (object_pk, role, is_member_auth) DO UPDATE SET
                     can_create = EXCLUDED.can_create, can_read = EXCLUDED.can_read,
                     can_update = EXCLUDED.can_update, can_delete = EXCLUDED.can_delete",
            )
            .bind::<BigInt, _>(row.object_pk)
            .bind::<BigInt, _>(request.folder_pk)
            .bind::<Text, _>(role.clone())
            .execute(conn)
            .await
            .ok();
        }

        Box::pin(propagate_auth(
            conn,
            PropagateAuth {
                folder_pk: row.object_pk,
                role: Some(role.clone()),
                is_deleted: request.is_deleted,
            },
        ))
        .await?;
    }

    Ok(())
}
