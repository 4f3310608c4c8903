// Definitions stored in the token database: domains with their
// permissions, the tokens issued under them, groups, accounts and
// delayed transactions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::PublicKey,
    name::{Name, Name128},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimePointSec,
    transaction::Transaction,
};

// Reserved token key that routes an action to the domain itself
pub const TOKEN_KEY_ISSUE: Name128 = Name128::constant(".issue");

pub const PERMISSION_ISSUE: Name = Name::constant("issue");
pub const PERMISSION_TRANSFER: Name = Name::constant("transfer");
pub const PERMISSION_MANAGE: Name = Name::constant("manage");

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("permission is named {0}, expected {1}")]
    WrongPermissionName(Name, Name),
    #[error("permission {0} threshold is zero")]
    ZeroThreshold(Name),
    #[error("permission {0} has no authorizers")]
    EmptyAuthorizers(Name),
    #[error("permission {0} total weight {1} cannot reach threshold {2}")]
    UnreachableThreshold(Name, u64, u32),
    #[error("group node threshold is zero")]
    ZeroGroupThreshold,
    #[error("group node weight is zero")]
    ZeroGroupWeight,
    #[error("group node total weight {0} cannot reach threshold {1}")]
    UnreachableGroupThreshold(u64, u32),
    #[error("group node has no children")]
    EmptyGroupNode,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizerRef {
    // A specific key
    Account(PublicKey),
    // The owner keys of the token the action targets
    Owner,
    // A named group, resolved recursively
    Group(Name128),
}

impl Serializer for AuthorizerRef {
    fn write(&self, writer: &mut Writer) {
        match self {
            AuthorizerRef::Account(key) => {
                writer.write_u8(0);
                key.write(writer);
            }
            AuthorizerRef::Owner => writer.write_u8(1),
            AuthorizerRef::Group(name) => {
                writer.write_u8(2);
                name.write(writer);
            }
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        match reader.read_u8()? {
            0 => Ok(AuthorizerRef::Account(PublicKey::read(reader)?)),
            1 => Ok(AuthorizerRef::Owner),
            2 => Ok(AuthorizerRef::Group(Name128::read(reader)?)),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    fn size(&self) -> usize {
        match self {
            AuthorizerRef::Account(key) => 1 + key.size(),
            AuthorizerRef::Owner => 1,
            AuthorizerRef::Group(name) => 1 + name.size(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuthorizerWeight {
    pub authorizer: AuthorizerRef,
    pub weight: u32,
}

impl Serializer for AuthorizerWeight {
    fn write(&self, writer: &mut Writer) {
        self.authorizer.write(writer);
        writer.write_u32(self.weight);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            authorizer: AuthorizerRef::read(reader)?,
            weight: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        self.authorizer.size() + 4
    }
}

// A weighted authorizer set with a threshold, attached to a domain
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Permission {
    pub name: Name,
    pub threshold: u32,
    pub authorizers: Vec<AuthorizerWeight>,
}

impl Permission {
    // A single key holding the full threshold
    pub fn sole_key(name: Name, key: PublicKey) -> Self {
        Self {
            name,
            threshold: 1,
            authorizers: vec![AuthorizerWeight {
                authorizer: AuthorizerRef::Account(key),
                weight: 1,
            }],
        }
    }

    // Token owners holding the full threshold
    pub fn owner(name: Name) -> Self {
        Self {
            name,
            threshold: 1,
            authorizers: vec![AuthorizerWeight {
                authorizer: AuthorizerRef::Owner,
                weight: 1,
            }],
        }
    }

    pub fn validate(&self, expected_name: Name) -> Result<(), AuthorityError> {
        if self.name != expected_name {
            return Err(AuthorityError::WrongPermissionName(self.name, expected_name));
        }
        if self.threshold == 0 {
            return Err(AuthorityError::ZeroThreshold(self.name));
        }
        if self.authorizers.is_empty() {
            return Err(AuthorityError::EmptyAuthorizers(self.name));
        }
        let total: u64 = self.authorizers.iter().map(|a| a.weight as u64).sum();
        if total < self.threshold as u64 {
            return Err(AuthorityError::UnreachableThreshold(self.name, total, self.threshold));
        }
        Ok(())
    }
}

impl Serializer for Permission {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        writer.write_u32(self.threshold);
        self.authorizers.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name::read(reader)?,
            threshold: reader.read_u32()?,
            authorizers: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + 4 + self.authorizers.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DomainDef {
    pub name: Name128,
    pub issuer: PublicKey,
    pub issue_time: TimePointSec,
    pub issue: Permission,
    pub transfer: Permission,
    pub manage: Permission,
}

impl DomainDef {
    // Domain controlled entirely by its issuer: the issuer issues and
    // manages, token owners transfer
    pub fn issued_by(name: Name128, issuer: PublicKey, issue_time: TimePointSec) -> Self {
        Self {
            name,
            issuer: issuer.clone(),
            issue_time,
            issue: Permission::sole_key(PERMISSION_ISSUE, issuer.clone()),
            transfer: Permission::owner(PERMISSION_TRANSFER),
            manage: Permission::sole_key(PERMISSION_MANAGE, issuer),
        }
    }

    pub fn validate(&self) -> Result<(), AuthorityError> {
        self.issue.validate(PERMISSION_ISSUE)?;
        self.transfer.validate(PERMISSION_TRANSFER)?;
        self.manage.validate(PERMISSION_MANAGE)?;
        Ok(())
    }
}

impl Serializer for DomainDef {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.issuer.write(writer);
        self.issue_time.write(writer);
        self.issue.write(writer);
        self.transfer.write(writer);
        self.manage.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            issuer: PublicKey::read(reader)?,
            issue_time: TimePointSec::read(reader)?,
            issue: Permission::read(reader)?,
            transfer: Permission::read(reader)?,
            manage: Permission::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size()
            + self.issuer.size()
            + self.issue_time.size()
            + self.issue.size()
            + self.transfer.size()
            + self.manage.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenDef {
    pub domain: Name128,
    pub name: Name128,
    pub owner: Vec<PublicKey>,
}

impl Serializer for TokenDef {
    fn write(&self, writer: &mut Writer) {
        self.domain.write(writer);
        self.name.write(writer);
        self.owner.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            domain: Name128::read(reader)?,
            name: Name128::read(reader)?,
            owner: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.domain.size() + self.name.size() + self.owner.size()
    }
}

// A weighted threshold tree; leaves are keys
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupNode {
    Key {
        key: PublicKey,
        weight: u32,
    },
    Node {
        threshold: u32,
        weight: u32,
        nodes: Vec<GroupNode>,
    },
}

impl GroupNode {
    pub fn weight(&self) -> u32 {
        match self {
            GroupNode::Key { weight, .. } => *weight,
            GroupNode::Node { weight, .. } => *weight,
        }
    }

    pub fn validate(&self) -> Result<(), AuthorityError> {
        match self {
            GroupNode::Key { weight, .. } => {
                if *weight == 0 {
                    return Err(AuthorityError::ZeroGroupWeight);
                }
                Ok(())
            }
            GroupNode::Node { threshold, nodes, .. } => {
                if *threshold == 0 {
                    return Err(AuthorityError::ZeroGroupThreshold);
                }
                if nodes.is_empty() {
                    return Err(AuthorityError::EmptyGroupNode);
                }
                let total: u64 = nodes.iter().map(|n| n.weight() as u64).sum();
                if total < *threshold as u64 {
                    return Err(AuthorityError::UnreachableGroupThreshold(total, *threshold));
                }
                for node in nodes {
                    node.validate()?;
                }
                Ok(())
            }
        }
    }
}

impl Serializer for GroupNode {
    fn write(&self, writer: &mut Writer) {
        match self {
            GroupNode::Key { key, weight } => {
                writer.write_u8(0);
                key.write(writer);
                writer.write_u32(*weight);
            }
            GroupNode::Node { threshold, weight, nodes } => {
                writer.write_u8(1);
                writer.write_u32(*threshold);
                writer.write_u32(*weight);
                nodes.write(writer);
            }
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        match reader.read_u8()? {
            0 => Ok(GroupNode::Key {
                key: PublicKey::read(reader)?,
                weight: reader.read_u32()?,
            }),
            1 => Ok(GroupNode::Node {
                threshold: reader.read_u32()?,
                weight: reader.read_u32()?,
                nodes: Vec::read(reader)?,
            }),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    fn size(&self) -> usize {
        match self {
            GroupNode::Key { key, .. } => 1 + key.size() + 4,
            GroupNode::Node { nodes, .. } => 1 + 4 + 4 + nodes.size(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupDef {
    pub name: Name128,
    // Key that may update the group definition
    pub key: PublicKey,
    pub root: GroupNode,
}

impl GroupDef {
    pub fn validate(&self) -> Result<(), AuthorityError> {
        self.root.validate()
    }
}

impl Serializer for GroupDef {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.key.write(writer);
        self.root.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            key: PublicKey::read(reader)?,
            root: GroupNode::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.key.size() + self.root.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountDef {
    pub name: Name128,
    pub creator: PublicKey,
    pub create_time: TimePointSec,
    // Fungible balance in base token units
    pub balance: u64,
    pub owner: Vec<PublicKey>,
}

impl Serializer for AccountDef {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.creator.write(writer);
        self.create_time.write(writer);
        writer.write_u64(self.balance);
        self.owner.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            creator: PublicKey::read(reader)?,
            create_time: TimePointSec::read(reader)?,
            balance: reader.read_u64()?,
            owner: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.creator.size() + self.create_time.size() + 8 + self.owner.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelayStatus {
    Proposed,
    Executed,
    Cancelled,
}

impl Serializer for DelayStatus {
    fn write(&self, writer: &mut Writer) {
        let value = match self {
            DelayStatus::Proposed => 0u8,
            DelayStatus::Executed => 1,
            DelayStatus::Cancelled => 2,
        };
        writer.write_u8(value);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        match reader.read_u8()? {
            0 => Ok(DelayStatus::Proposed),
            1 => Ok(DelayStatus::Executed),
            2 => Ok(DelayStatus::Cancelled),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    fn size(&self) -> usize {
        1
    }
}

// A transaction proposed now, gathered signatures later
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DelayDef {
    pub name: Name128,
    pub proposer: PublicKey,
    pub status: DelayStatus,
    pub trx: Transaction,
    pub signed_keys: Vec<PublicKey>,
}

impl Serializer for DelayDef {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.proposer.write(writer);
        self.status.write(writer);
        self.trx.write(writer);
        self.signed_keys.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            proposer: PublicKey::read(reader)?,
            status: DelayStatus::read(reader)?,
            trx: Transaction::read(reader)?,
            signed_keys: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size()
            + self.proposer.size()
            + self.status.size()
            + self.trx.size()
            + self.signed_keys.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_domain_def_round_trip() {
        let issuer = KeyPair::random().public_key().clone();
        let domain = DomainDef::issued_by("cards".parse().unwrap(), issuer, TimePointSec::new(10));
        assert!(domain.validate().is_ok());
        assert_eq!(DomainDef::from_bytes(&domain.to_bytes()).unwrap(), domain);
    }

    #[test]
    fn test_permission_validation() {
        let key = KeyPair::random().public_key().clone();
        let mut permission = Permission::sole_key(PERMISSION_ISSUE, key);
        assert!(permission.validate(PERMISSION_ISSUE).is_ok());
        assert!(permission.validate(PERMISSION_MANAGE).is_err());

        permission.threshold = 5;
        assert!(matches!(
            permission.validate(PERMISSION_ISSUE),
            Err(AuthorityError::UnreachableThreshold(_, 1, 5))
        ));
    }

    #[test]
    fn test_group_tree_round_trip_and_validation() {
        let a = KeyPair::random().public_key().clone();
        let b = KeyPair::random().public_key().clone();
        let group = GroupDef {
            name: "founders".parse().unwrap(),
            key: a.clone(),
            root: GroupNode::Node {
                threshold: 2,
                weight: 1,
                nodes: vec![
                    GroupNode::Key { key: a, weight: 1 },
                    GroupNode::Key { key: b, weight: 1 },
                ],
            },
        };
        assert!(group.validate().is_ok());
        assert_eq!(GroupDef::from_bytes(&group.to_bytes()).unwrap(), group);

        let mut bad = group;
        if let GroupNode::Node { threshold, .. } = &mut bad.root {
            // Two unit weights can never reach three
            *threshold = 3;
        }
        assert!(bad.validate().is_err());
    }
}
