// The token database: domains, the tokens issued under them, groups,
// accounts and delayed transactions. Savepoints use the same undo-level
// machinery as the chain-state store, tagged with the revision the
// enclosing block runs under.

use std::path::Path;

use log::trace;
use sigil_common::{
    name::Name128,
    serializer::Serializer,
    token::{AccountDef, DelayDef, DomainDef, GroupDef, TokenDef},
};

use crate::{error::ChainError, store::UndoStore};

const TREE_DOMAINS: usize = 0;
const TREE_TOKENS: usize = 1;
const TREE_GROUPS: usize = 2;
const TREE_ACCOUNTS: usize = 3;
const TREE_DELAYS: usize = 4;

pub struct TokenStore {
    store: UndoStore,
}

impl TokenStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let store = UndoStore::open(path, &["domains", "tokens", "groups", "accounts", "delays"])?;
        Ok(Self { store })
    }

    // Savepoint stack

    pub fn new_savepoint_session(&mut self, revision: u64) {
        trace!("token db savepoint at revision {}", revision);
        self.store.push_level(revision, true);
    }

    // Open a nested savepoint on top of the latest one
    pub fn new_nested_savepoint(&mut self) -> u64 {
        let revision = self.store.latest_level_revision().unwrap_or(0) + 1;
        self.store.push_level(revision, true);
        revision
    }

    pub fn squash(&mut self) -> Result<(), ChainError> {
        self.store.squash()
    }

    pub fn rollback_to_latest_savepoint(&mut self) -> Result<(), ChainError> {
        self.store.undo()
    }

    pub fn rollback_all(&mut self) -> Result<(), ChainError> {
        self.store.undo_all()
    }

    // Drop every savepoint tagged at or below the given revision
    pub fn pop_savepoints(&mut self, revision: u64) -> Result<(), ChainError> {
        self.store.commit(revision)
    }

    pub fn savepoint_count(&self) -> usize {
        self.store.session_count()
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.store.flush()
    }

    // Domains

    pub fn add_domain(&mut self, domain: &DomainDef) -> Result<(), ChainError> {
        let key = Self::name_key(&domain.name);
        if self.store.contains(TREE_DOMAINS, &key)? {
            return Err(ChainError::DomainExists(domain.name));
        }
        self.store.insert(TREE_DOMAINS, &key, &domain.to_bytes())
    }

    pub fn exists_domain(&self, name: &Name128) -> Result<bool, ChainError> {
        self.store.contains(TREE_DOMAINS, &Self::name_key(name))
    }

    pub fn get_domain(&self, name: &Name128) -> Result<DomainDef, ChainError> {
        let bytes = self
            .store
            .get(TREE_DOMAINS, &Self::name_key(name))?
            .ok_or(ChainError::DomainNotFound(*name))?;
        Ok(DomainDef::from_bytes(&bytes)?)
    }

    pub fn update_domain(&mut self, domain: &DomainDef) -> Result<(), ChainError> {
        let key = Self::name_key(&domain.name);
        if !self.store.contains(TREE_DOMAINS, &key)? {
            return Err(ChainError::DomainNotFound(domain.name));
        }
        self.store.insert(TREE_DOMAINS, &key, &domain.to_bytes())
    }

    // Tokens

    pub fn add_token(&mut self, token: &TokenDef) -> Result<(), ChainError> {
        let key = Self::token_key(&token.domain, &token.name);
        if self.store.contains(TREE_TOKENS, &key)? {
            return Err(ChainError::TokenExists {
                domain: token.domain,
                name: token.name,
            });
        }
        self.store.insert(TREE_TOKENS, &key, &token.to_bytes())
    }

    pub fn exists_token(&self, domain: &Name128, name: &Name128) -> Result<bool, ChainError> {
        self.store.contains(TREE_TOKENS, &Self::token_key(domain, name))
    }

    pub fn get_token(&self, domain: &Name128, name: &Name128) -> Result<TokenDef, ChainError> {
        let bytes = self
            .store
            .get(TREE_TOKENS, &Self::token_key(domain, name))?
            .ok_or(ChainError::TokenNotFound {
                domain: *domain,
                name: *name,
            })?;
        Ok(TokenDef::from_bytes(&bytes)?)
    }

    pub fn update_token(&mut self, token: &TokenDef) -> Result<(), ChainError> {
        let key = Self::token_key(&token.domain, &token.name);
        if !self.store.contains(TREE_TOKENS, &key)? {
            return Err(ChainError::TokenNotFound {
                domain: token.domain,
                name: token.name,
            });
        }
        self.store.insert(TREE_TOKENS, &key, &token.to_bytes())
    }

    // Groups

    pub fn add_group(&mut self, group: &GroupDef) -> Result<(), ChainError> {
        let key = Self::name_key(&group.name);
        if self.store.contains(TREE_GROUPS, &key)? {
            return Err(ChainError::GroupExists(group.name));
        }
        self.store.insert(TREE_GROUPS, &key, &group.to_bytes())
    }

    pub fn exists_group(&self, name: &Name128) -> Result<bool, ChainError> {
        self.store.contains(TREE_GROUPS, &Self::name_key(name))
    }

    pub fn get_group(&self, name: &Name128) -> Result<GroupDef, ChainError> {
        let bytes = self
            .store
            .get(TREE_GROUPS, &Self::name_key(name))?
            .ok_or(ChainError::GroupNotFound(*name))?;
        Ok(GroupDef::from_bytes(&bytes)?)
    }

    pub fn update_group(&mut self, group: &GroupDef) -> Result<(), ChainError> {
        let key = Self::name_key(&group.name);
        if !self.store.contains(TREE_GROUPS, &key)? {
            return Err(ChainError::GroupNotFound(group.name));
        }
        self.store.insert(TREE_GROUPS, &key, &group.to_bytes())
    }

    // Accounts

    pub fn add_account(&mut self, account: &AccountDef) -> Result<(), ChainError> {
        let key = Self::name_key(&account.name);
        if self.store.contains(TREE_ACCOUNTS, &key)? {
            return Err(ChainError::AccountExists(account.name));
        }
        self.store.insert(TREE_ACCOUNTS, &key, &account.to_bytes())
    }

    pub fn exists_account(&self, name: &Name128) -> Result<bool, ChainError> {
        self.store.contains(TREE_ACCOUNTS, &Self::name_key(name))
    }

    pub fn get_account(&self, name: &Name128) -> Result<AccountDef, ChainError> {
        let bytes = self
            .store
            .get(TREE_ACCOUNTS, &Self::name_key(name))?
            .ok_or(ChainError::AccountNotFound(*name))?;
        Ok(AccountDef::from_bytes(&bytes)?)
    }

    pub fn update_account(&mut self, account: &AccountDef) -> Result<(), ChainError> {
        let key = Self::name_key(&account.name);
        if !self.store.contains(TREE_ACCOUNTS, &key)? {
            return Err(ChainError::AccountNotFound(account.name));
        }
        self.store.insert(TREE_ACCOUNTS, &key, &account.to_bytes())
    }

    // Delays

    pub fn add_delay(&mut self, delay: &DelayDef) -> Result<(), ChainError> {
        let key = Self::name_key(&delay.name);
        if self.store.contains(TREE_DELAYS, &key)? {
            return Err(ChainError::DelayExists(delay.name));
        }
        self.store.insert(TREE_DELAYS, &key, &delay.to_bytes())
    }

    pub fn exists_delay(&self, name: &Name128) -> Result<bool, ChainError> {
        self.store.contains(TREE_DELAYS, &Self::name_key(name))
    }

    pub fn get_delay(&self, name: &Name128) -> Result<DelayDef, ChainError> {
        let bytes = self
            .store
            .get(TREE_DELAYS, &Self::name_key(name))?
            .ok_or(ChainError::DelayNotFound(*name))?;
        Ok(DelayDef::from_bytes(&bytes)?)
    }

    pub fn update_delay(&mut self, delay: &DelayDef) -> Result<(), ChainError> {
        let key = Self::name_key(&delay.name);
        if !self.store.contains(TREE_DELAYS, &key)? {
            return Err(ChainError::DelayNotFound(delay.name));
        }
        self.store.insert(TREE_DELAYS, &key, &delay.to_bytes())
    }

    fn name_key(name: &Name128) -> [u8; 16] {
        name.as_u128().to_le_bytes()
    }

    fn token_key(domain: &Name128, name: &Name128) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[0..16].copy_from_slice(&domain.as_u128().to_le_bytes());
        key[16..].copy_from_slice(&name.as_u128().to_le_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::{crypto::KeyPair, time::TimePointSec};
    use tempdir::TempDir;

    fn domain(name: &str) -> DomainDef {
        DomainDef::issued_by(
            name.parse().unwrap(),
            KeyPair::random().public_key().clone(),
            TimePointSec::new(0),
        )
    }

    #[test]
    fn test_domain_crud() {
        let dir = TempDir::new("token-db").unwrap();
        let mut db = TokenStore::open(dir.path().join("tokendb")).unwrap();

        let cards = domain("cards");
        db.add_domain(&cards).unwrap();
        assert!(db.exists_domain(&cards.name).unwrap());
        assert!(matches!(db.add_domain(&cards), Err(ChainError::DomainExists(_))));
        assert_eq!(db.get_domain(&cards.name).unwrap(), cards);
    }

    #[test]
    fn test_savepoint_rollback() {
        let dir = TempDir::new("token-db").unwrap();
        let mut db = TokenStore::open(dir.path().join("tokendb")).unwrap();

        db.add_domain(&domain("kept")).unwrap();
        db.new_savepoint_session(1);
        db.add_domain(&domain("dropped")).unwrap();
        db.rollback_to_latest_savepoint().unwrap();

        assert!(db.exists_domain(&"kept".parse().unwrap()).unwrap());
        assert!(!db.exists_domain(&"dropped".parse().unwrap()).unwrap());
    }

    #[test]
    fn test_pop_savepoints_makes_writes_permanent() {
        let dir = TempDir::new("token-db").unwrap();
        let mut db = TokenStore::open(dir.path().join("tokendb")).unwrap();

        db.new_savepoint_session(5);
        db.add_domain(&domain("five")).unwrap();
        db.new_savepoint_session(6);
        db.add_domain(&domain("six")).unwrap();

        db.pop_savepoints(5).unwrap();
        assert_eq!(db.savepoint_count(), 1);

        db.rollback_to_latest_savepoint().unwrap();
        assert!(db.exists_domain(&"five".parse().unwrap()).unwrap());
        assert!(!db.exists_domain(&"six".parse().unwrap()).unwrap());
    }

    #[test]
    fn test_nested_savepoint_squash() {
        let dir = TempDir::new("token-db").unwrap();
        let mut db = TokenStore::open(dir.path().join("tokendb")).unwrap();

        db.new_savepoint_session(1);
        db.add_domain(&domain("outer")).unwrap();
        db.new_nested_savepoint();
        db.add_domain(&domain("inner")).unwrap();
        db.squash().unwrap();

        db.rollback_to_latest_savepoint().unwrap();
        assert!(!db.exists_domain(&"outer".parse().unwrap()).unwrap());
        assert!(!db.exists_domain(&"inner".parse().unwrap()).unwrap());
    }
}
