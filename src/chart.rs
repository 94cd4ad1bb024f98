//! Chart of accounts management.

use std::sync::Arc;

use tallybook_core::{
    Account, AccountId, Currency, CreateAccountCommand, Organization, OrganizationId, StorageBackend,
    SystemRole,
};

use crate::error::LedgerError;

pub struct AccountDirectory {
    storage: Arc<dyn StorageBackend>,
}

impl AccountDirectory {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn create_organization(
        &self,
        name: &str,
        currency: Currency,
    ) -> Result<Organization, LedgerError> {
        let organization = Organization {
            id: OrganizationId::new(),
            name: Arc::from(name),
            currency,
        };
        self.storage.create_organization(&organization)?;
        tracing::info!(organization_id = %organization.id, "organization created");
        Ok(organization)
    }

    /// Provisions the six well-known role accounts a fresh organization needs
    /// before any document can post.
    pub fn seed_chart(&self, organization_id: OrganizationId) -> Result<Vec<Account>, LedgerError> {
        let organization = self.storage.organization(organization_id)?;
        let mut created = Vec::with_capacity(SystemRole::all().len());
        for role in SystemRole::all() {
            if self.storage.system_account(organization_id, role)?.is_some() {
                continue;
            }
            let account_type = role.account_type();
            let account = Account {
                id: AccountId::new(),
                organization_id,
                name: Arc::from(role.default_name()),
                account_type,
                normal_side: account_type.normal_side(),
                parent_account_id: None,
                system_role: Some(role),
                is_active: true,
                currency: organization.currency,
            };
            self.storage.insert_account(&account)?;
            created.push(account);
        }
        Ok(created)
    }

    pub fn create_account(
        &self,
        organization_id: OrganizationId,
        cmd: CreateAccountCommand,
    ) -> Result<Account, LedgerError> {
        let organization = self.storage.organization(organization_id)?;

        if cmd.name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "account name must not be empty".into(),
            ));
        }

        let currency = cmd.currency.unwrap_or(organization.currency);
        if currency != organization.currency {
            return Err(LedgerError::Validation(format!(
                "account currency {} differs from organization currency {}",
                currency, organization.currency
            )));
        }

        if let Some(role) = cmd.system_role {
            if self.storage.system_account(organization_id, role)?.is_some() {
                return Err(LedgerError::Validation(format!(
                    "organization already has a {} account",
                    role.default_name()
                )));
            }
            if role.account_type() != cmd.account_type {
                return Err(LedgerError::Validation(format!(
                    "{} accounts must be of type {:?}",
                    role.default_name(),
                    role.account_type()
                )));
            }
        }

        if let Some(parent_id) = cmd.parent_account_id {
            self.validate_parent_chain(organization_id, parent_id)?;
        }

        let account = Account {
            id: AccountId::new(),
            organization_id,
            name: cmd.name,
            account_type: cmd.account_type,
            normal_side: cmd.normal_side.unwrap_or(cmd.account_type.normal_side()),
            parent_account_id: cmd.parent_account_id,
            system_role: cmd.system_role,
            is_active: true,
            currency,
        };
        self.storage.insert_account(&account)?;
        tracing::debug!(account_id = %account.id, name = %account.name, "account created");
        Ok(account)
    }

    pub fn account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
    ) -> Result<Account, LedgerError> {
        Ok(self.storage.account(organization_id, account_id)?)
    }

    pub fn list_accounts(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Account>, LedgerError> {
        Ok(self.storage.list_accounts(organization_id)?)
    }

    pub fn resolve_system_account(
        &self,
        organization_id: OrganizationId,
        role: SystemRole,
    ) -> Result<Account, LedgerError> {
        self.storage
            .system_account(organization_id, role)?
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "organization has no {} account",
                    role.default_name()
                ))
            })
    }

    pub fn rename_account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
        name: &str,
    ) -> Result<Account, LedgerError> {
        if name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "account name must not be empty".into(),
            ));
        }
        let mut account = self.storage.account(organization_id, account_id)?;
        account.name = Arc::from(name);
        self.storage.update_account(&account)?;
        Ok(account)
    }

    /// Accounts are deactivated, never deleted; history must stay readable.
    pub fn deactivate_account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
    ) -> Result<Account, LedgerError> {
        let mut account = self.storage.account(organization_id, account_id)?;
        if account.is_system() {
            return Err(LedgerError::Validation(
                "system accounts cannot be deactivated".into(),
            ));
        }
        account.is_active = false;
        self.storage.update_account(&account)?;
        tracing::debug!(account_id = %account.id, "account deactivated");
        Ok(account)
    }

    /// Walks the parent chain to confirm every ancestor exists in this
    /// organization and the chain terminates.
    fn validate_parent_chain(
        &self,
        organization_id: OrganizationId,
        parent_id: AccountId,
    ) -> Result<(), LedgerError> {
        let mut seen = vec![parent_id];
        let mut current = parent_id;
        loop {
            let parent = self
                .storage
                .account(organization_id, current)
                .map_err(|_| LedgerError::ForeignAccount(current))?;
            match parent.parent_account_id {
                None => return Ok(()),
                Some(next) => {
                    if seen.contains(&next) {
                        return Err(LedgerError::Validation(
                            "account parent chain forms a cycle".into(),
                        ));
                    }
                    seen.push(next);
                    current = next;
                }
            }
        }
    }
}
