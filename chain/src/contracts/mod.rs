// The closed action set. Every handler mirrors the shape of the others:
// check routing, unpack the payload, validate against the token
// database, mutate.

mod payloads;

use std::collections::HashMap;

use log::info;
use sigil_common::{
    crypto::Hash,
    name::{Name, Name128},
    serializer::Serializer,
    time::BlockTimestamp,
    token::{
        AccountDef, DelayDef, DelayStatus, DomainDef, TokenDef, PERMISSION_ISSUE,
        PERMISSION_MANAGE, PERMISSION_TRANSFER, TOKEN_KEY_ISSUE,
    },
    transaction::Action,
};

pub use payloads::*;

use crate::{
    authority_checker::AuthorityChecker, error::ChainError, tokendb::TokenStore,
};

// The four domains every chain is born with
pub const DOMAIN_DOMAIN: Name128 = Name128::constant("domain");
pub const DOMAIN_GROUP: Name128 = Name128::constant("group");
pub const DOMAIN_ACCOUNT: Name128 = Name128::constant("account");
pub const DOMAIN_DELAY: Name128 = Name128::constant("delay");

pub const ACTION_NEWDOMAIN: Name = Name::constant("newdomain");
pub const ACTION_ISSUETOKEN: Name = Name::constant("issuetoken");
pub const ACTION_TRANSFER: Name = Name::constant("transfer");
pub const ACTION_NEWGROUP: Name = Name::constant("newgroup");
pub const ACTION_UPDATEGROUP: Name = Name::constant("updategroup");
pub const ACTION_UPDATEDOMAIN: Name = Name::constant("updatedomain");
pub const ACTION_NEWACCOUNT: Name = Name::constant("newaccount");
pub const ACTION_UPDATEOWNER: Name = Name::constant("updateowner");
pub const ACTION_TRANSFEREVT: Name = Name::constant("transferevt");
pub const ACTION_NEWDELAY: Name = Name::constant("newdelay");
pub const ACTION_APPROVEDELAY: Name = Name::constant("approvedelay");
pub const ACTION_CANCELDELAY: Name = Name::constant("canceldelay");
pub const ACTION_EXECUTEDELAY: Name = Name::constant("executedelay");

pub type ApplyHandler = fn(&mut ApplyContext) -> Result<(), ChainError>;

// Execution environment handed to an apply handler
pub struct ApplyContext<'a> {
    pub token_db: &'a mut TokenStore,
    pub action: &'a Action,
    pub handlers: &'a HashMap<Name, ApplyHandler>,
    pub chain_id: &'a Hash,
    pub pending_block_time: BlockTimestamp,
    pub max_authority_depth: u16,
    pub max_inline_action_depth: u16,
    pub depth: u16,
    pub contracts_console: bool,
    pub console: String,
}

impl<'a> ApplyContext<'a> {
    // Actions must be routed at the (domain, key) their payload names
    fn has_authorized(&self, domain: Name128, key: Name128) -> Result<(), ChainError> {
        if self.action.domain != domain || self.action.key != key {
            return Err(ChainError::InvalidActionRouting {
                name: self.action.name,
                domain: self.action.domain,
                key: self.action.key,
            });
        }
        Ok(())
    }

    fn unpack<T: Serializer>(&self) -> Result<T, ChainError> {
        Ok(T::from_bytes(&self.action.data)?)
    }

    fn console(&mut self, line: String) {
        if self.contracts_console {
            info!("[contract] {}", line);
            self.console.push_str(&line);
            self.console.push('\n');
        }
    }

    // Dispatch a nested action, bounded by the inline depth limit
    fn execute_inline(&mut self, action: &Action) -> Result<(), ChainError> {
        if self.depth >= self.max_inline_action_depth {
            return Err(ChainError::InlineActionDepthExceeded(self.max_inline_action_depth));
        }
        let handler = self
            .handlers
            .get(&action.name)
            .copied()
            .ok_or(ChainError::UnknownAction(action.name))?;
        let mut inner = ApplyContext {
            token_db: &mut *self.token_db,
            action,
            handlers: self.handlers,
            chain_id: self.chain_id,
            pending_block_time: self.pending_block_time,
            max_authority_depth: self.max_authority_depth,
            max_inline_action_depth: self.max_inline_action_depth,
            depth: self.depth + 1,
            contracts_console: self.contracts_console,
            console: String::new(),
        };
        handler(&mut inner)?;
        let inner_console = inner.console;
        self.console.push_str(&inner_console);
        Ok(())
    }
}

pub fn build_apply_handlers() -> HashMap<Name, ApplyHandler> {
    let mut handlers: HashMap<Name, ApplyHandler> = HashMap::new();
    handlers.insert(ACTION_NEWDOMAIN, apply_newdomain);
    handlers.insert(ACTION_ISSUETOKEN, apply_issuetoken);
    handlers.insert(ACTION_TRANSFER, apply_transfer);
    handlers.insert(ACTION_NEWGROUP, apply_newgroup);
    handlers.insert(ACTION_UPDATEGROUP, apply_updategroup);
    handlers.insert(ACTION_UPDATEDOMAIN, apply_updatedomain);
    handlers.insert(ACTION_NEWACCOUNT, apply_newaccount);
    handlers.insert(ACTION_UPDATEOWNER, apply_updateowner);
    handlers.insert(ACTION_TRANSFEREVT, apply_transferevt);
    handlers.insert(ACTION_NEWDELAY, apply_newdelay);
    handlers.insert(ACTION_APPROVEDELAY, apply_approvedelay);
    handlers.insert(ACTION_CANCELDELAY, apply_canceldelay);
    handlers.insert(ACTION_EXECUTEDELAY, apply_executedelay);
    handlers
}

fn apply_newdomain(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewDomain = context.unpack()?;
    context.has_authorized(DOMAIN_DOMAIN, payload.name)?;

    if context.token_db.exists_domain(&payload.name)? {
        return Err(ChainError::DomainExists(payload.name));
    }
    payload.issue.validate(PERMISSION_ISSUE)?;
    payload.transfer.validate(PERMISSION_TRANSFER)?;
    payload.manage.validate(PERMISSION_MANAGE)?;

    let domain = DomainDef {
        name: payload.name,
        issuer: payload.creator,
        issue_time: context.pending_block_time.to_time_point_sec(),
        issue: payload.issue,
        transfer: payload.transfer,
        manage: payload.manage,
    };
    context.token_db.add_domain(&domain)?;
    context.console(format!("domain {} created", domain.name));
    Ok(())
}

fn apply_updatedomain(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: UpdateDomain = context.unpack()?;
    context.has_authorized(DOMAIN_DOMAIN, payload.name)?;

    let mut domain = context.token_db.get_domain(&payload.name)?;
    if let Some(issue) = payload.issue {
        issue.validate(PERMISSION_ISSUE)?;
        domain.issue = issue;
    }
    if let Some(transfer) = payload.transfer {
        transfer.validate(PERMISSION_TRANSFER)?;
        domain.transfer = transfer;
    }
    if let Some(manage) = payload.manage {
        manage.validate(PERMISSION_MANAGE)?;
        domain.manage = manage;
    }
    context.token_db.update_domain(&domain)
}

fn apply_issuetoken(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: IssueToken = context.unpack()?;
    context.has_authorized(payload.domain, TOKEN_KEY_ISSUE)?;

    if !context.token_db.exists_domain(&payload.domain)? {
        return Err(ChainError::DomainNotFound(payload.domain));
    }
    if payload.owner.is_empty() {
        return Err(ChainError::EmptyOwner);
    }
    for name in &payload.names {
        let token = TokenDef {
            domain: payload.domain,
            name: *name,
            owner: payload.owner.clone(),
        };
        context.token_db.add_token(&token)?;
    }
    Ok(())
}

fn apply_transfer(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: Transfer = context.unpack()?;
    context.has_authorized(payload.domain, payload.name)?;

    if payload.to.is_empty() {
        return Err(ChainError::EmptyOwner);
    }
    let mut token = context.token_db.get_token(&payload.domain, &payload.name)?;
    token.owner = payload.to;
    context.token_db.update_token(&token)
}

fn apply_newgroup(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewGroup = context.unpack()?;
    context.has_authorized(DOMAIN_GROUP, payload.name)?;

    if payload.name != payload.group.name {
        return Err(ChainError::GroupNameMismatch {
            action: payload.name,
            definition: payload.group.name,
        });
    }
    if context.token_db.exists_group(&payload.name)? {
        return Err(ChainError::GroupExists(payload.name));
    }
    payload.group.validate()?;
    context.token_db.add_group(&payload.group)
}

fn apply_updategroup(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: UpdateGroup = context.unpack()?;
    context.has_authorized(DOMAIN_GROUP, payload.name)?;

    if payload.name != payload.group.name {
        return Err(ChainError::GroupNameMismatch {
            action: payload.name,
            definition: payload.group.name,
        });
    }
    payload.group.validate()?;
    context.token_db.update_group(&payload.group)
}

fn apply_newaccount(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewAccount = context.unpack()?;
    context.has_authorized(DOMAIN_ACCOUNT, payload.name)?;

    if payload.owner.is_empty() {
        return Err(ChainError::EmptyOwner);
    }
    if context.token_db.exists_account(&payload.name)? {
        return Err(ChainError::AccountExists(payload.name));
    }
    let account = AccountDef {
        name: payload.name,
        creator: payload.owner[0].clone(),
        create_time: context.pending_block_time.to_time_point_sec(),
        balance: 0,
        owner: payload.owner,
    };
    context.token_db.add_account(&account)
}

fn apply_updateowner(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: UpdateOwner = context.unpack()?;
    context.has_authorized(DOMAIN_ACCOUNT, payload.name)?;

    if payload.owner.is_empty() {
        return Err(ChainError::EmptyOwner);
    }
    let mut account = context.token_db.get_account(&payload.name)?;
    account.owner = payload.owner;
    context.token_db.update_account(&account)
}

fn apply_transferevt(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: TransferEvt = context.unpack()?;
    context.has_authorized(DOMAIN_ACCOUNT, payload.from)?;

    let mut from = context.token_db.get_account(&payload.from)?;
    let mut to = context.token_db.get_account(&payload.to)?;

    from.balance = from
        .balance
        .checked_sub(payload.amount)
        .ok_or(ChainError::InsufficientBalance {
            account: payload.from,
            need: payload.amount,
            have: from.balance,
        })?;
    to.balance = to
        .balance
        .checked_add(payload.amount)
        .ok_or(ChainError::BalanceOverflow(payload.to))?;

    context.token_db.update_account(&from)?;
    context.token_db.update_account(&to)?;
    context.console(format!(
        "{} -> {}: {} transferred",
        payload.from, payload.to, payload.amount
    ));
    Ok(())
}

fn apply_newdelay(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewDelay = context.unpack()?;
    context.has_authorized(DOMAIN_DELAY, payload.name)?;

    if context.token_db.exists_delay(&payload.name)? {
        return Err(ChainError::DelayExists(payload.name));
    }
    let delay = DelayDef {
        name: payload.name,
        proposer: payload.proposer,
        status: DelayStatus::Proposed,
        trx: payload.trx,
        signed_keys: Vec::new(),
    };
    context.token_db.add_delay(&delay)
}

fn apply_approvedelay(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: ApproveDelay = context.unpack()?;
    context.has_authorized(DOMAIN_DELAY, payload.name)?;

    let mut delay = context.token_db.get_delay(&payload.name)?;
    if delay.status != DelayStatus::Proposed {
        return Err(ChainError::DelayNotProposed(payload.name));
    }

    // Each payload signature proves one key's approval of the delayed
    // transaction itself
    let digest = delay.trx.sig_digest(context.chain_id);
    for signature in &payload.signatures {
        let key = signature
            .recover(&digest)
            .map_err(|_| ChainError::InvalidDelaySignature(payload.name))?;
        if !delay.signed_keys.contains(&key) {
            delay.signed_keys.push(key);
        }
    }
    context.token_db.update_delay(&delay)
}

fn apply_canceldelay(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: CancelDelay = context.unpack()?;
    context.has_authorized(DOMAIN_DELAY, payload.name)?;

    let mut delay = context.token_db.get_delay(&payload.name)?;
    if delay.status != DelayStatus::Proposed {
        return Err(ChainError::DelayNotProposed(payload.name));
    }
    delay.status = DelayStatus::Cancelled;
    context.token_db.update_delay(&delay)
}

fn apply_executedelay(context: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: ExecuteDelay = context.unpack()?;
    context.has_authorized(DOMAIN_DELAY, payload.name)?;

    let mut delay = context.token_db.get_delay(&payload.name)?;
    if delay.status != DelayStatus::Proposed {
        return Err(ChainError::DelayNotProposed(payload.name));
    }

    // The keys gathered through approvals must satisfy the delayed
    // transaction's own authorities
    {
        let signed_keys = delay.signed_keys.iter().cloned().collect();
        let mut checker = AuthorityChecker::new(
            &signed_keys,
            context.token_db,
            context.max_authority_depth,
        );
        for action in &delay.trx.actions {
            if !checker.satisfied(action)? {
                return Err(ChainError::UnsatisfiedAuthorization {
                    domain: action.domain,
                    key: action.key,
                    name: action.name,
                });
            }
        }
    }

    for action in &delay.trx.actions {
        context.execute_inline(action)?;
    }

    delay.status = DelayStatus::Executed;
    context.token_db.update_delay(&delay)
}
