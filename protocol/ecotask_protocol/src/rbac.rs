//! # Role-Based Access Control
//!
//! Two independent authorization layers live here.
//!
//! ## Roles (identities)
//!
//! | Role         | Can do                                                        |
//! |--------------|---------------------------------------------------------------|
//! | `SuperAdmin` | Everything an Admin can, plus grant SuperAdmin / transfer it  |
//! | `Admin`      | Grant/revoke Admin and Validator, pause/unpause               |
//! | `Validator`  | Eligible for selection into verification rounds               |
//!
//! Each address holds at most one role. There is exactly one SuperAdmin once
//! [`AccessControl::init_super_admin`] has run; it can only be replaced with
//! [`AccessControl::transfer_super_admin`], never revoked.
//!
//! The validator roster keeps grant order. Revoking a validator deactivates
//! its roster entry (so it is skipped by future selections) but never
//! removes it from a round that was already fixed.
//!
//! ## Capabilities (components)
//!
//! Status transitions reserved to one component (only the funding pool may
//! mark a task `Funded`, and so on) take a [`Capability`] argument that is
//! checked against the transition's owner.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::types::{Address, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Validator,
}

/// Component identity used to gate cross-component transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    FundingPool,
    CollateralManager,
    VerificationManager,
}

impl Capability {
    pub(crate) fn require(self, expected: Capability, operation: &str) -> Result<()> {
        if self != expected {
            return Err(Error::Authorization(format!(
                "{operation} is reserved to {expected:?}, called by {self:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub address: Address,
    pub active: bool,
    pub added_at: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControl {
    super_admin: Option<Address>,
    roles: BTreeMap<Address, Role>,
    validators: Vec<ValidatorEntry>,
}

impl AccessControl {
    /// Set the first SuperAdmin. Fails with `AlreadyDone` on any later call.
    pub fn init_super_admin(&mut self, super_admin: &Address) -> Result<()> {
        if self.super_admin.is_some() {
            return Err(Error::AlreadyDone("access control already initialised".to_string()));
        }
        self.super_admin = Some(super_admin.clone());
        self.roles.insert(super_admin.clone(), Role::SuperAdmin);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.super_admin.is_some()
    }

    pub fn super_admin(&self) -> Option<&Address> {
        self.super_admin.as_ref()
    }

    pub fn role_of(&self, address: &Address) -> Option<Role> {
        self.roles.get(address).copied()
    }

    pub fn has_role(&self, address: &Address, role: Role) -> bool {
        self.role_of(address) == Some(role)
    }

    pub fn require_admin_or_above(&self, caller: &Address) -> Result<()> {
        match self.role_of(caller) {
            Some(Role::SuperAdmin) | Some(Role::Admin) => Ok(()),
            _ => Err(Error::Authorization(format!(
                "{caller} must hold Admin or SuperAdmin"
            ))),
        }
    }

    /// Grant `role` to `target`, replacing any role it held before.
    pub fn grant_role(
        &mut self,
        caller: &Address,
        target: &Address,
        role: Role,
        now: Timestamp,
    ) -> Result<()> {
        self.require_admin_or_above(caller)?;
        if role == Role::SuperAdmin {
            return Err(Error::Authorization(
                "SuperAdmin can only be handed over with transfer_super_admin".to_string(),
            ));
        }
        if self.super_admin.as_ref() == Some(target) {
            return Err(Error::Authorization(
                "the SuperAdmin's role cannot be replaced".to_string(),
            ));
        }

        let previous = self.roles.insert(target.clone(), role);
        if previous == Some(Role::Validator) && role != Role::Validator {
            self.set_validator_active(target, false);
        }
        if role == Role::Validator {
            match self.validators.iter_mut().find(|v| &v.address == target) {
                Some(entry) => entry.active = true,
                None => self.validators.push(ValidatorEntry {
                    address: target.clone(),
                    active: true,
                    added_at: now,
                }),
            }
        }
        Ok(())
    }

    pub fn revoke_role(&mut self, caller: &Address, target: &Address) -> Result<()> {
        self.require_admin_or_above(caller)?;
        if self.super_admin.as_ref() == Some(target) {
            return Err(Error::Authorization(
                "the SuperAdmin cannot be revoked; use transfer_super_admin".to_string(),
            ));
        }
        match self.roles.remove(target) {
            Some(Role::Validator) => {
                self.set_validator_active(target, false);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("{target} holds no role"))),
        }
    }

    pub fn transfer_super_admin(&mut self, current: &Address, new: &Address) -> Result<()> {
        if self.super_admin.as_ref() != Some(current) {
            return Err(Error::Authorization(format!("{current} is not the SuperAdmin")));
        }
        if current == new {
            return Err(Error::Validation("new SuperAdmin equals the current one".to_string()));
        }
        if self.roles.get(new) == Some(&Role::Validator) {
            self.set_validator_active(new, false);
        }
        self.roles.remove(current);
        self.roles.insert(new.clone(), Role::SuperAdmin);
        self.super_admin = Some(new.clone());
        Ok(())
    }

    /// Active validators in grant order.
    pub fn active_validators(&self) -> Vec<Address> {
        self.validators
            .iter()
            .filter(|v| v.active)
            .map(|v| v.address.clone())
            .collect()
    }

    /// Full roster, including deactivated entries.
    pub fn validators(&self) -> &[ValidatorEntry] {
        &self.validators
    }

    fn set_validator_active(&mut self, address: &Address, active: bool) {
        if let Some(entry) = self.validators.iter_mut().find(|v| &v.address == address) {
            entry.active = active;
        }
    }
}
