// Action payloads. Action data on the wire is the canonical
// serialization of one of these.

use serde::{Deserialize, Serialize};
use sigil_common::{
    crypto::{PublicKey, Signature},
    name::Name128,
    serializer::{Reader, ReaderError, Serializer, Writer},
    token::{GroupDef, Permission},
    transaction::Transaction,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewDomain {
    pub name: Name128,
    pub creator: PublicKey,
    pub issue: Permission,
    pub transfer: Permission,
    pub manage: Permission,
}

impl Serializer for NewDomain {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.creator.write(writer);
        self.issue.write(writer);
        self.transfer.write(writer);
        self.manage.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            creator: PublicKey::read(reader)?,
            issue: Permission::read(reader)?,
            transfer: Permission::read(reader)?,
            manage: Permission::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size()
            + self.creator.size()
            + self.issue.size()
            + self.transfer.size()
            + self.manage.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdateDomain {
    pub name: Name128,
    pub issue: Option<Permission>,
    pub transfer: Option<Permission>,
    pub manage: Option<Permission>,
}

impl Serializer for UpdateDomain {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.issue.write(writer);
        self.transfer.write(writer);
        self.manage.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            issue: Option::read(reader)?,
            transfer: Option::read(reader)?,
            manage: Option::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.issue.size() + self.transfer.size() + self.manage.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IssueToken {
    pub domain: Name128,
    pub names: Vec<Name128>,
    pub owner: Vec<PublicKey>,
}

impl Serializer for IssueToken {
    fn write(&self, writer: &mut Writer) {
        self.domain.write(writer);
        self.names.write(writer);
        self.owner.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            domain: Name128::read(reader)?,
            names: Vec::read(reader)?,
            owner: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.domain.size() + self.names.size() + self.owner.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub domain: Name128,
    pub name: Name128,
    pub to: Vec<PublicKey>,
    pub memo: String,
}

impl Serializer for Transfer {
    fn write(&self, writer: &mut Writer) {
        self.domain.write(writer);
        self.name.write(writer);
        self.to.write(writer);
        self.memo.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            domain: Name128::read(reader)?,
            name: Name128::read(reader)?,
            to: Vec::read(reader)?,
            memo: String::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.domain.size() + self.name.size() + self.to.size() + self.memo.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewGroup {
    pub name: Name128,
    pub group: GroupDef,
}

impl Serializer for NewGroup {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.group.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            group: GroupDef::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.group.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdateGroup {
    pub name: Name128,
    pub group: GroupDef,
}

impl Serializer for UpdateGroup {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.group.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            group: GroupDef::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.group.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewAccount {
    pub name: Name128,
    pub owner: Vec<PublicKey>,
}

impl Serializer for NewAccount {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.owner.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            owner: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.owner.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdateOwner {
    pub name: Name128,
    pub owner: Vec<PublicKey>,
}

impl Serializer for UpdateOwner {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.owner.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            owner: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.owner.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferEvt {
    pub from: Name128,
    pub to: Name128,
    pub amount: u64,
    pub memo: String,
}

impl Serializer for TransferEvt {
    fn write(&self, writer: &mut Writer) {
        self.from.write(writer);
        self.to.write(writer);
        writer.write_u64(self.amount);
        self.memo.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            from: Name128::read(reader)?,
            to: Name128::read(reader)?,
            amount: reader.read_u64()?,
            memo: String::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.from.size() + self.to.size() + 8 + self.memo.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewDelay {
    pub name: Name128,
    pub proposer: PublicKey,
    pub trx: Transaction,
}

impl Serializer for NewDelay {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.proposer.write(writer);
        self.trx.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            proposer: PublicKey::read(reader)?,
            trx: Transaction::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.proposer.size() + self.trx.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ApproveDelay {
    pub name: Name128,
    pub signatures: Vec<Signature>,
}

impl Serializer for ApproveDelay {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.signatures.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            signatures: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.signatures.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CancelDelay {
    pub name: Name128,
}

impl Serializer for CancelDelay {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteDelay {
    pub name: Name128,
    pub executor: PublicKey,
}

impl Serializer for ExecuteDelay {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.executor.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name128::read(reader)?,
            executor: PublicKey::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.executor.size()
    }
}
