use serde::Serialize;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    database::Database,
    error::{StockError, StockResult},
    models::{BranchAccess, Role, User},
    utils::verify_token,
    AppState,
};

pub const STAFF: &[Role] = &[Role::Admin, Role::Employee];

#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub branch_access: BranchAccess,
}

impl CurrentUser {
    pub fn from_user_and_access(user: User, branch_access: BranchAccess) -> Self {
        Self {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            role: user.role,
            branch_access,
        }
    }

    pub fn is_staff(&self) -> bool {
        STAFF.contains(&self.role)
    }

    pub fn require_branch(&self, branch_id: Uuid) -> StockResult<()> {
        if self.branch_access.allows(branch_id) {
            Ok(())
        } else {
            Err(StockError::Forbidden)
        }
    }

    /// Staff member who may operate `branch_id`.
    pub fn require_staff_at(&self, branch_id: Uuid) -> StockResult<()> {
        if !self.is_staff() {
            return Err(StockError::Forbidden);
        }
        self.require_branch(branch_id)
    }
}

pub async fn get_current_user(cookies: &Cookies, state: &AppState) -> Option<CurrentUser> {
    let token = cookies.get("auth_token")?.value().to_string();

    let claims = match verify_token(&token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            log::debug!("Rejected session token: {}", e);
            return None;
        }
    };

    get_user_by_id(&state.db, claims.user_id()?).await
}

/// Resolves the session user and checks their role.
pub async fn require_user(cookies: &Cookies, state: &AppState, roles: &[Role]) -> StockResult<CurrentUser> {
    let user = get_current_user(cookies, state)
        .await
        .ok_or(StockError::Unauthorized)?;

    if !roles.contains(&user.role) {
        return Err(StockError::Forbidden);
    }
    Ok(user)
}

async fn get_user_by_id(db: &Database, user_id: Uuid) -> Option<CurrentUser> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, first_name, last_name, role, branch_id, is_active, created_at \
         FROM users WHERE id = $1 AND is_active = TRUE",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await
    .map_err(|e| log::error!("Failed to load user {}: {}", user_id, e))
    .ok()??;

    let access = match get_branch_access(db, &user).await {
        Ok(access) => access,
        Err(e) => {
            log::error!("Failed to load branch access for {}: {}", user_id, e);
            return None;
        }
    };

    Some(CurrentUser::from_user_and_access(user, access))
}

/// Admins reach every branch. Employees reach their home branch plus any
/// explicitly granted ones. Customers operate on no branch directly.
pub async fn get_branch_access(db: &Database, user: &User) -> StockResult<BranchAccess> {
    match user.role {
        Role::Admin => Ok(BranchAccess::All),
        Role::Customer => Ok(BranchAccess::Nothing),
        Role::Employee => {
            let mut branches = sqlx::query_scalar::<_, Uuid>(
                "SELECT branch_id FROM employee_branch_access WHERE employee_id = $1",
            )
            .bind(user.id)
            .fetch_all(db)
            .await?;

            if let Some(home) = user.branch_id {
                branches.push(home);
            }
            branches.sort();
            branches.dedup();

            Ok(branch_access_from(branches))
        }
    }
}

fn branch_access_from(branches: Vec<Uuid>) -> BranchAccess {
    if branches.is_empty() {
        BranchAccess::Nothing
    } else {
        BranchAccess::Only(branches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role, branch_access: BranchAccess) -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            email: "staff@example.com".into(),
            first_name: "Sam".into(),
            last_name: "Reyes".into(),
            role,
            branch_access,
        }
    }

    #[test]
    fn employees_without_grants_reach_nothing() {
        assert_eq!(branch_access_from(vec![]), BranchAccess::Nothing);
    }

    #[test]
    fn branch_checks_follow_access() {
        let home = Uuid::new_v4();
        let employee = user(Role::Employee, BranchAccess::Only(vec![home]));
        assert!(employee.is_staff());
        assert!(employee.require_branch(home).is_ok());
        assert!(matches!(employee.require_branch(Uuid::new_v4()), Err(StockError::Forbidden)));

        let customer = user(Role::Customer, BranchAccess::Nothing);
        assert!(!customer.is_staff());
        assert!(customer.require_branch(home).is_err());
    }

    #[test]
    fn employees_route_orders_only_to_their_branches() {
        let home = Uuid::new_v4();
        let employee = user(Role::Employee, BranchAccess::Only(vec![home]));
        assert!(employee.require_staff_at(home).is_ok());
        assert!(matches!(employee.require_staff_at(Uuid::new_v4()), Err(StockError::Forbidden)));

        let admin = user(Role::Admin, BranchAccess::All);
        assert!(admin.require_staff_at(Uuid::new_v4()).is_ok());

        let customer = user(Role::Customer, BranchAccess::All);
        assert!(matches!(customer.require_staff_at(home), Err(StockError::Forbidden)));
    }
}
