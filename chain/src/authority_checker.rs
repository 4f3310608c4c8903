// Walks the authority graph rooted at an action's target and decides
// whether a set of candidate keys carries enough weight. Deterministic,
// order independent, and read-only against the token database.

use std::collections::BTreeSet;

use log::trace;
use sigil_common::{
    crypto::PublicKey,
    serializer::Serializer,
    token::{AuthorizerRef, GroupNode, Permission},
    transaction::Action,
};

use crate::{
    contracts::{
        ApproveDelay, CancelDelay, ExecuteDelay, NewAccount, NewDelay, NewDomain, NewGroup,
        ACTION_APPROVEDELAY, ACTION_CANCELDELAY, ACTION_EXECUTEDELAY, ACTION_ISSUETOKEN,
        ACTION_NEWACCOUNT, ACTION_NEWDELAY, ACTION_NEWDOMAIN, ACTION_NEWGROUP, ACTION_TRANSFER,
        ACTION_TRANSFEREVT, ACTION_UPDATEDOMAIN, ACTION_UPDATEGROUP, ACTION_UPDATEOWNER,
        DOMAIN_ACCOUNT, DOMAIN_DELAY, DOMAIN_DOMAIN, DOMAIN_GROUP,
    },
    error::ChainError,
    tokendb::TokenStore,
};

pub struct AuthorityChecker<'a> {
    keys: &'a BTreeSet<PublicKey>,
    token_db: &'a TokenStore,
    max_depth: u16,
    used_keys: BTreeSet<PublicKey>,
}

impl<'a> AuthorityChecker<'a> {
    pub fn new(keys: &'a BTreeSet<PublicKey>, token_db: &'a TokenStore, max_depth: u16) -> Self {
        Self {
            keys,
            token_db,
            max_depth,
            used_keys: BTreeSet::new(),
        }
    }

    // Whether the candidate keys satisfy the authority this action targets
    pub fn satisfied(&mut self, action: &Action) -> Result<bool, ChainError> {
        trace!("authority check for {} in {}:{}", action.name, action.domain, action.key);

        if action.domain == DOMAIN_DOMAIN {
            if action.name == ACTION_NEWDOMAIN {
                // The new domain does not exist yet, its creator speaks for it
                let payload = NewDomain::from_bytes(&action.data)?;
                return Ok(self.satisfied_key(&payload.creator));
            }
            if action.name == ACTION_UPDATEDOMAIN {
                let domain = self.token_db.get_domain(&action.key)?;
                return self.satisfied_permission(&domain.manage, None, 1);
            }
        } else if action.domain == DOMAIN_GROUP {
            if action.name == ACTION_NEWGROUP {
                let payload = NewGroup::from_bytes(&action.data)?;
                return Ok(self.satisfied_key(&payload.group.key));
            }
            if action.name == ACTION_UPDATEGROUP {
                let group = self.token_db.get_group(&action.key)?;
                return Ok(self.satisfied_key(&group.key));
            }
        } else if action.domain == DOMAIN_ACCOUNT {
            if action.name == ACTION_NEWACCOUNT {
                let payload = NewAccount::from_bytes(&action.data)?;
                return Ok(self.satisfied_all_keys(&payload.owner));
            }
            if action.name == ACTION_UPDATEOWNER {
                let account = self.token_db.get_account(&action.key)?;
                return Ok(self.satisfied_all_keys(&account.owner));
            }
            if action.name == ACTION_TRANSFEREVT {
                // Any single owner may spend
                let account = self.token_db.get_account(&action.key)?;
                return Ok(self.satisfied_any_key(&account.owner));
            }
        } else if action.domain == DOMAIN_DELAY {
            if action.name == ACTION_NEWDELAY {
                let payload = NewDelay::from_bytes(&action.data)?;
                return Ok(self.satisfied_key(&payload.proposer));
            }
            if action.name == ACTION_APPROVEDELAY {
                // The payload signatures prove themselves
                ApproveDelay::from_bytes(&action.data)?;
                return Ok(true);
            }
            if action.name == ACTION_CANCELDELAY {
                let payload = CancelDelay::from_bytes(&action.data)?;
                let delay = self.token_db.get_delay(&payload.name)?;
                return Ok(self.satisfied_key(&delay.proposer));
            }
            if action.name == ACTION_EXECUTEDELAY {
                let payload = ExecuteDelay::from_bytes(&action.data)?;
                return Ok(self.satisfied_key(&payload.executor));
            }
        } else {
            // Token-domain actions resolve through the domain's permissions
            if action.name == ACTION_ISSUETOKEN {
                let domain = self.token_db.get_domain(&action.domain)?;
                return self.satisfied_permission(&domain.issue, None, 1);
            }
            if action.name == ACTION_TRANSFER {
                let domain = self.token_db.get_domain(&action.domain)?;
                let token = self.token_db.get_token(&action.domain, &action.key)?;
                return self.satisfied_permission(&domain.transfer, Some(&token.owner), 1);
            }
        }

        Err(ChainError::UnknownAction(action.name))
    }

    // Keys that actually contributed weight to a successful walk
    pub fn used_keys(&self) -> &BTreeSet<PublicKey> {
        &self.used_keys
    }

    fn satisfied_key(&mut self, key: &PublicKey) -> bool {
        if self.keys.contains(key) {
            self.used_keys.insert(key.clone());
            return true;
        }
        false
    }

    fn satisfied_all_keys(&mut self, keys: &[PublicKey]) -> bool {
        if keys.is_empty() {
            return false;
        }
        if keys.iter().all(|key| self.keys.contains(key)) {
            self.used_keys.extend(keys.iter().cloned());
            return true;
        }
        false
    }

    fn satisfied_any_key(&mut self, keys: &[PublicKey]) -> bool {
        keys.iter().any(|key| {
            if self.keys.contains(key) {
                self.used_keys.insert(key.clone());
                true
            } else {
                false
            }
        })
    }

    fn satisfied_permission(
        &mut self,
        permission: &Permission,
        owner: Option<&[PublicKey]>,
        depth: u16,
    ) -> Result<bool, ChainError> {
        if depth > self.max_depth {
            return Err(ChainError::AuthorityDepthExceeded(self.max_depth));
        }

        let mut total: u64 = 0;
        for authorizer in &permission.authorizers {
            let hit = match &authorizer.authorizer {
                AuthorizerRef::Account(key) => self.satisfied_key(key),
                // An owner reference needs every owner of the target token
                AuthorizerRef::Owner => match owner {
                    Some(owner_keys) => self.satisfied_all_keys(owner_keys),
                    None => false,
                },
                AuthorizerRef::Group(name) => {
                    let group = self.token_db.get_group(name)?;
                    self.satisfied_node(&group.root, depth + 1)?
                }
            };
            if hit {
                total += authorizer.weight as u64;
                if total >= permission.threshold as u64 {
                    return Ok(true);
                }
            }
        }
        Ok(total >= permission.threshold as u64)
    }

    fn satisfied_node(&mut self, node: &GroupNode, depth: u16) -> Result<bool, ChainError> {
        if depth > self.max_depth {
            return Err(ChainError::AuthorityDepthExceeded(self.max_depth));
        }
        match node {
            GroupNode::Key { key, .. } => Ok(self.satisfied_key(key)),
            GroupNode::Node { threshold, nodes, .. } => {
                let mut total: u64 = 0;
                for child in nodes {
                    if self.satisfied_node(child, depth + 1)? {
                        total += child.weight() as u64;
                        if total >= *threshold as u64 {
                            return Ok(true);
                        }
                    }
                }
                Ok(total >= *threshold as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::{
        crypto::KeyPair,
        name::Name128,
        serializer::Serializer,
        token::{
            AuthorizerWeight, DomainDef, GroupDef, TokenDef, PERMISSION_TRANSFER, TOKEN_KEY_ISSUE,
        },
        time::TimePointSec,
    };
    use tempdir::TempDir;

    fn keys_of(pairs: &[&KeyPair]) -> BTreeSet<PublicKey> {
        pairs.iter().map(|p| p.public_key().clone()).collect()
    }

    fn issue_action(domain: Name128, issuer: &KeyPair) -> (TempDir, TokenStore, Action) {
        let dir = TempDir::new("authority").unwrap();
        let mut token_db = TokenStore::open(dir.path().join("tokendb")).unwrap();
        let def = DomainDef::issued_by(domain, issuer.public_key().clone(), TimePointSec::new(0));
        token_db.add_domain(&def).unwrap();

        let payload = crate::contracts::IssueToken {
            domain,
            names: vec!["first".parse().unwrap()],
            owner: vec![issuer.public_key().clone()],
        };
        let action = Action::new(
            ACTION_ISSUETOKEN,
            domain,
            TOKEN_KEY_ISSUE,
            payload.to_bytes(),
        );
        (dir, token_db, action)
    }

    #[test]
    fn test_issue_requires_domain_issuer() {
        let issuer = KeyPair::random();
        let stranger = KeyPair::random();
        let domain: Name128 = "cards".parse().unwrap();
        let (_dir, token_db, action) = issue_action(domain, &issuer);

        let keys = keys_of(&[&issuer]);
        let mut checker = AuthorityChecker::new(&keys, &token_db, 6);
        assert!(checker.satisfied(&action).unwrap());
        assert!(checker.used_keys().contains(issuer.public_key()));

        let keys = keys_of(&[&stranger]);
        let mut checker = AuthorityChecker::new(&keys, &token_db, 6);
        assert!(!checker.satisfied(&action).unwrap());
        assert!(checker.used_keys().is_empty());
    }

    #[test]
    fn test_transfer_resolves_token_owner() {
        let issuer = KeyPair::random();
        let owner = KeyPair::random();
        let domain: Name128 = "cards".parse().unwrap();
        let (_dir, mut token_db, _) = issue_action(domain, &issuer);

        let token = TokenDef {
            domain,
            name: "ace".parse().unwrap(),
            owner: vec![owner.public_key().clone()],
        };
        token_db.add_token(&token).unwrap();

        let payload = crate::contracts::Transfer {
            domain,
            name: token.name,
            to: vec![issuer.public_key().clone()],
            memo: String::new(),
        };
        let action = Action::new(ACTION_TRANSFER, domain, token.name, payload.to_bytes());

        let keys = keys_of(&[&owner]);
        let mut checker = AuthorityChecker::new(&keys, &token_db, 6);
        assert!(checker.satisfied(&action).unwrap());

        // The domain issuer holds no transfer authority by default
        let keys = keys_of(&[&issuer]);
        let mut checker = AuthorityChecker::new(&keys, &token_db, 6);
        assert!(!checker.satisfied(&action).unwrap());
    }

    #[test]
    fn test_group_walk_weights_and_thresholds() {
        let issuer = KeyPair::random();
        let a = KeyPair::random();
        let b = KeyPair::random();
        let c = KeyPair::random();
        let domain: Name128 = "cards".parse().unwrap();
        let (_dir, mut token_db, _) = issue_action(domain, &issuer);

        // Group satisfied by (a and b) or c
        let group = GroupDef {
            name: "council".parse().unwrap(),
            key: issuer.public_key().clone(),
            root: GroupNode::Node {
                threshold: 2,
                weight: 1,
                nodes: vec![
                    GroupNode::Node {
                        threshold: 2,
                        weight: 2,
                        nodes: vec![
                            GroupNode::Key { key: a.public_key().clone(), weight: 1 },
                            GroupNode::Key { key: b.public_key().clone(), weight: 1 },
                        ],
                    },
                    GroupNode::Key { key: c.public_key().clone(), weight: 2 },
                ],
            },
        };
        token_db.add_group(&group).unwrap();

        // Rewire the domain's issue permission to the group
        let mut def = token_db.get_domain(&domain).unwrap();
        def.issue.authorizers = vec![AuthorizerWeight {
            authorizer: AuthorizerRef::Group(group.name),
            weight: 1,
        }];
        token_db.update_domain(&def).unwrap();

        let payload = crate::contracts::IssueToken {
            domain,
            names: vec!["two".parse().unwrap()],
            owner: vec![issuer.public_key().clone()],
        };
        let action = Action::new(ACTION_ISSUETOKEN, domain, TOKEN_KEY_ISSUE, payload.to_bytes());

        for (pairs, expect) in [
            (vec![&a, &b], true),
            (vec![&c], true),
            (vec![&a], false),
            (vec![&b], false),
        ] {
            let keys = keys_of(&pairs);
            let mut checker = AuthorityChecker::new(&keys, &token_db, 6);
            assert_eq!(checker.satisfied(&action).unwrap(), expect);
        }
    }

    #[test]
    fn test_depth_bound() {
        let issuer = KeyPair::random();
        let domain: Name128 = "cards".parse().unwrap();
        let (_dir, mut token_db, _) = issue_action(domain, &issuer);

        // A chain of nested nodes deeper than the limit
        let mut node = GroupNode::Key { key: issuer.public_key().clone(), weight: 1 };
        for _ in 0..8 {
            node = GroupNode::Node { threshold: 1, weight: 1, nodes: vec![node] };
        }
        let group = GroupDef {
            name: "deep".parse().unwrap(),
            key: issuer.public_key().clone(),
            root: node,
        };
        token_db.add_group(&group).unwrap();

        let mut def = token_db.get_domain(&domain).unwrap();
        def.issue.authorizers = vec![AuthorizerWeight {
            authorizer: AuthorizerRef::Group(group.name),
            weight: 1,
        }];
        token_db.update_domain(&def).unwrap();

        let payload = crate::contracts::IssueToken {
            domain,
            names: vec!["deep".parse().unwrap()],
            owner: vec![issuer.public_key().clone()],
        };
        let action = Action::new(ACTION_ISSUETOKEN, domain, TOKEN_KEY_ISSUE, payload.to_bytes());

        let keys = keys_of(&[&issuer]);
        let mut checker = AuthorityChecker::new(&keys, &token_db, 6);
        assert!(matches!(
            checker.satisfied(&action),
            Err(ChainError::AuthorityDepthExceeded(6))
        ));
    }
}
