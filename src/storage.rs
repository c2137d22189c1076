//! Sled-backed record store for users, API keys, usage types and usages.
//!
//! Each record kind lives in its own tree, serialized as JSON. Numeric ids are
//! stored as big-endian keys so a tree scan yields ascending id order.
//!
//! Every write goes through a sled transaction. The `usage_type_refs` tree maps
//! a usage type to the ids of the usages that reference it; creating, moving
//! and deleting usages keeps it current inside the same transaction, which is
//! what lets a usage type delete cascade atomically.

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, Transactional, TransactionalTree,
};
use sled::{Db, IVec, Tree};
use std::path::Path;
use thiserror::Error;

use crate::models::{Usage, UsageType, User};

const USAGE_TYPE_SEQ: &str = "seq/usage_type";
const USAGE_SEQ: &str = "seq/usage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("usage type {0} does not exist")]
    MissingUsageType(u64),
    #[error("user {0} already exists")]
    UserExists(String),
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => StorageError::Sled(inner),
        }
    }
}

type TxResult<T> = ConflictableTransactionResult<T, StorageError>;

#[derive(Clone)] // Sled handles are cheap to clone and thread-safe
pub struct Storage {
    db: Db,
    users: Tree,
    user_tokens: Tree,
    tokens: Tree,
    usage_types: Tree,
    usages: Tree,
    type_refs: Tree,
    meta: Tree,
}

impl Storage {
    /// Open or create the Sled database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop, for tests and throwaway runs.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            users: db.open_tree("users")?,
            user_tokens: db.open_tree("user_tokens")?,
            tokens: db.open_tree("tokens")?,
            usage_types: db.open_tree("usage_types")?,
            usages: db.open_tree("usages")?,
            type_refs: db.open_tree("usage_type_refs")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    // --- Users & API keys ---

    /// Insert a new user; fails with `UserExists` if the username is taken.
    pub fn create_user(&self, user: &User) -> Result<(), StorageError> {
        let bytes = encode(user)?;
        self.users
            .compare_and_swap(user.username.as_bytes(), None::<&[u8]>, Some(bytes))?
            .map_err(|_| StorageError::UserExists(user.username.clone()))
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.users
            .get(username.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Return the user's API key, storing `candidate` as that key if the user
    /// has none yet. A user never ends up with more than one key.
    pub fn get_or_create_token(
        &self,
        username: &str,
        candidate: &str,
    ) -> Result<String, StorageError> {
        let result: TransactionResult<String, StorageError> = (&self.user_tokens, &self.tokens)
            .transaction(|(user_tokens, tokens)| {
                if let Some(existing) = user_tokens.get(username.as_bytes())? {
                    return Ok(String::from_utf8_lossy(&existing).into_owned());
                }
                user_tokens.insert(username.as_bytes(), candidate.as_bytes())?;
                tokens.insert(candidate.as_bytes(), username.as_bytes())?;
                Ok(candidate.to_string())
            });
        Ok(result?)
    }

    pub fn token_for(&self, username: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .user_tokens
            .get(username.as_bytes())?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Resolve an API key to the username it was issued to.
    pub fn user_for_token(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .tokens
            .get(key.as_bytes())?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    // --- Usage types ---

    pub fn create_usage_type(&self, name: &str, unit: &str) -> Result<UsageType, StorageError> {
        let result: TransactionResult<UsageType, StorageError> = (&self.meta, &self.usage_types)
            .transaction(|(meta, usage_types)| {
                let id = next_id(meta, USAGE_TYPE_SEQ)?;
                let usage_type = UsageType {
                    id,
                    name: name.to_string(),
                    unit: unit.to_string(),
                };
                usage_types.insert(id_key(id), tx(encode(&usage_type))?)?;
                Ok(usage_type)
            });
        Ok(result?)
    }

    pub fn get_usage_type(&self, id: u64) -> Result<Option<UsageType>, StorageError> {
        self.usage_types
            .get(id_key(id))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// All usage types in ascending id order.
    pub fn list_usage_types(&self) -> Result<Vec<UsageType>, StorageError> {
        scan(&self.usage_types)
    }

    /// Overwrite an existing usage type; `NotFound` if it was deleted meanwhile.
    pub fn update_usage_type(&self, usage_type: &UsageType) -> Result<(), StorageError> {
        let bytes = encode(usage_type)?;
        let result: TransactionResult<(), StorageError> = self.usage_types.transaction(|tree| {
            if tree.get(id_key(usage_type.id))?.is_none() {
                return abort(StorageError::NotFound("usage type"));
            }
            tree.insert(id_key(usage_type.id), bytes.as_slice())?;
            Ok(())
        });
        Ok(result?)
    }

    /// Delete a usage type together with every usage referencing it.
    /// Returns the number of usages removed by the cascade.
    pub fn delete_usage_type(&self, id: u64) -> Result<usize, StorageError> {
        let result: TransactionResult<usize, StorageError> =
            (&self.usage_types, &self.usages, &self.type_refs).transaction(
                |(usage_types, usages, type_refs)| {
                    if usage_types.remove(id_key(id))?.is_none() {
                        return abort(StorageError::NotFound("usage type"));
                    }
                    let dependents: Vec<u64> = match type_refs.remove(id_key(id))? {
                        Some(raw) => tx(decode(&raw))?,
                        None => Vec::new(),
                    };
                    for usage_id in &dependents {
                        usages.remove(id_key(*usage_id))?;
                    }
                    Ok(dependents.len())
                },
            );
        Ok(result?)
    }

    // --- Usages ---

    pub fn create_usage(
        &self,
        owner: &str,
        usage_type: u64,
        usage_at: DateTime<FixedOffset>,
    ) -> Result<Usage, StorageError> {
        let result: TransactionResult<Usage, StorageError> =
            (&self.meta, &self.usage_types, &self.usages, &self.type_refs).transaction(
                |(meta, usage_types, usages, type_refs)| {
                    if usage_types.get(id_key(usage_type))?.is_none() {
                        return abort(StorageError::MissingUsageType(usage_type));
                    }
                    let id = next_id(meta, USAGE_SEQ)?;
                    let usage = Usage {
                        id,
                        user: owner.to_string(),
                        usage_type,
                        usage_at,
                    };
                    usages.insert(id_key(id), tx(encode(&usage))?)?;
                    link(type_refs, usage_type, id)?;
                    Ok(usage)
                },
            );
        Ok(result?)
    }

    pub fn get_usage(&self, id: u64) -> Result<Option<Usage>, StorageError> {
        self.usages
            .get(id_key(id))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Usages owned by `owner`, ascending by id.
    pub fn list_usages_owned_by(&self, owner: &str) -> Result<Vec<Usage>, StorageError> {
        let mut owned: Vec<Usage> = scan(&self.usages)?;
        owned.retain(|usage| usage.user == owner);
        Ok(owned)
    }

    /// Replace the usage type and timestamp of an existing usage. The stored
    /// owner is kept whatever `usage.user` says; the stored record is returned.
    pub fn replace_usage(&self, usage: &Usage) -> Result<Usage, StorageError> {
        let result: TransactionResult<Usage, StorageError> =
            (&self.usage_types, &self.usages, &self.type_refs).transaction(
                |(usage_types, usages, type_refs)| {
                    let previous: Usage = match usages.get(id_key(usage.id))? {
                        Some(raw) => tx(decode(&raw))?,
                        None => return abort(StorageError::NotFound("usage")),
                    };
                    if usage_types.get(id_key(usage.usage_type))?.is_none() {
                        return abort(StorageError::MissingUsageType(usage.usage_type));
                    }
                    if previous.usage_type != usage.usage_type {
                        unlink(type_refs, previous.usage_type, usage.id)?;
                        link(type_refs, usage.usage_type, usage.id)?;
                    }
                    let stored = Usage {
                        user: previous.user,
                        ..usage.clone()
                    };
                    usages.insert(id_key(stored.id), tx(encode(&stored))?)?;
                    Ok(stored)
                },
            );
        Ok(result?)
    }

    pub fn delete_usage(&self, id: u64) -> Result<(), StorageError> {
        let result: TransactionResult<(), StorageError> = (&self.usages, &self.type_refs)
            .transaction(|(usages, type_refs)| {
                let removed: Usage = match usages.remove(id_key(id))? {
                    Some(raw) => tx(decode(&raw))?,
                    None => return abort(StorageError::NotFound("usage")),
                };
                unlink(type_refs, removed.usage_type, id)?;
                Ok(())
            });
        Ok(result?)
    }
}

fn id_key(id: u64) -> IVec {
    IVec::from(&id.to_be_bytes()[..])
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(raw)?)
}

fn tx<T>(result: Result<T, StorageError>) -> TxResult<T> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn scan<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>, StorageError> {
    let mut records = Vec::new();
    for item in tree.iter() {
        let (_, value) = item?;
        records.push(decode(&value)?);
    }
    Ok(records)
}

/// Bump and return the named sequence. Starts at 1, never hands out an id twice.
fn next_id(meta: &TransactionalTree, sequence: &str) -> TxResult<u64> {
    let current = match meta.get(sequence)? {
        Some(raw) => <[u8; 8]>::try_from(&raw[..])
            .map(u64::from_be_bytes)
            .unwrap_or(0),
        None => 0,
    };
    let next = current + 1;
    meta.insert(sequence, id_key(next))?;
    Ok(next)
}

fn read_refs(type_refs: &TransactionalTree, usage_type: u64) -> TxResult<Vec<u64>> {
    match type_refs.get(id_key(usage_type))? {
        Some(raw) => tx(decode(&raw)),
        None => Ok(Vec::new()),
    }
}

fn link(type_refs: &TransactionalTree, usage_type: u64, usage_id: u64) -> TxResult<()> {
    let mut refs = read_refs(type_refs, usage_type)?;
    refs.push(usage_id);
    type_refs.insert(id_key(usage_type), tx(encode(&refs))?)?;
    Ok(())
}

fn unlink(type_refs: &TransactionalTree, usage_type: u64, usage_id: u64) -> TxResult<()> {
    let mut refs = read_refs(type_refs, usage_type)?;
    refs.retain(|id| *id != usage_id);
    if refs.is_empty() {
        type_refs.remove(id_key(usage_type))?;
    } else {
        type_refs.insert(id_key(usage_type), tx(encode(&refs))?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(hour: u32) -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2021, 4, 5, hour, 0, 0)
            .unwrap()
            .fixed_offset()
    }

    #[test]
    fn test_usage_type_ids_increase_and_are_not_reused() {
        let storage = Storage::temporary().expect("temporary storage");

        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        let sailing = storage.create_usage_type("sailing", "nautical miles").unwrap();
        assert_eq!(driving.id, 1);
        assert_eq!(sailing.id, 2);

        storage.delete_usage_type(sailing.id).unwrap();
        let flying = storage.create_usage_type("flying", "kilometers").unwrap();
        assert_eq!(flying.id, 3);

        let listed = storage.list_usage_types().unwrap();
        assert_eq!(listed, vec![driving, flying]);
    }

    #[test]
    fn test_update_missing_usage_type_is_not_found() {
        let storage = Storage::temporary().unwrap();
        let ghost = UsageType {
            id: 42,
            name: "ghost".into(),
            unit: "none".into(),
        };
        assert!(matches!(
            storage.update_usage_type(&ghost),
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.get_usage_type(42).unwrap().is_none());
    }

    #[test]
    fn test_delete_usage_type_cascades_to_dependents() {
        let storage = Storage::temporary().unwrap();
        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        let flying = storage.create_usage_type("flying", "kilometers").unwrap();

        let a = storage.create_usage("alice", driving.id, at(8)).unwrap();
        let b = storage.create_usage("bob", driving.id, at(9)).unwrap();
        let c = storage.create_usage("alice", flying.id, at(10)).unwrap();

        assert_eq!(storage.delete_usage_type(driving.id).unwrap(), 2);
        assert!(storage.get_usage(a.id).unwrap().is_none());
        assert!(storage.get_usage(b.id).unwrap().is_none());
        assert_eq!(storage.get_usage(c.id).unwrap(), Some(c));
        assert!(storage.get_usage_type(driving.id).unwrap().is_none());
    }

    #[test]
    fn test_create_usage_requires_existing_type() {
        let storage = Storage::temporary().unwrap();
        let err = storage.create_usage("alice", 7, at(8)).unwrap_err();
        assert!(matches!(err, StorageError::MissingUsageType(7)));
        // The aborted transaction must not consume an id
        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        let usage = storage.create_usage("alice", driving.id, at(8)).unwrap();
        assert_eq!(usage.id, 1);
    }

    #[test]
    fn test_replace_moves_usage_between_types_and_keeps_owner() {
        let storage = Storage::temporary().unwrap();
        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        let flying = storage.create_usage_type("flying", "kilometers").unwrap();
        let usage = storage.create_usage("alice", driving.id, at(8)).unwrap();

        let stored = storage
            .replace_usage(&Usage {
                id: usage.id,
                user: "mallory".into(),
                usage_type: flying.id,
                usage_at: at(12),
            })
            .unwrap();
        assert_eq!(stored.user, "alice");
        assert_eq!(stored.usage_type, flying.id);

        // The usage now hangs off `flying`, so deleting `driving` leaves it alone
        assert_eq!(storage.delete_usage_type(driving.id).unwrap(), 0);
        assert_eq!(storage.get_usage(usage.id).unwrap(), Some(stored));
        assert_eq!(storage.delete_usage_type(flying.id).unwrap(), 1);
        assert!(storage.get_usage(usage.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_usage_unlinks_reference() {
        let storage = Storage::temporary().unwrap();
        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        let usage = storage.create_usage("alice", driving.id, at(8)).unwrap();

        storage.delete_usage(usage.id).unwrap();
        assert!(matches!(
            storage.delete_usage(usage.id),
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(storage.delete_usage_type(driving.id).unwrap(), 0);
    }

    #[test]
    fn test_list_usages_is_scoped_to_owner() {
        let storage = Storage::temporary().unwrap();
        let driving = storage.create_usage_type("driving", "kilometers").unwrap();
        storage.create_usage("alice", driving.id, at(8)).unwrap();
        storage.create_usage("bob", driving.id, at(9)).unwrap();
        storage.create_usage("alice", driving.id, at(10)).unwrap();

        let owned = storage.list_usages_owned_by("alice").unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|usage| usage.user == "alice"));
        assert!(owned[0].id < owned[1].id);
    }

    #[test]
    fn test_users_are_unique_and_keep_a_single_token() {
        let storage = Storage::temporary().unwrap();
        let user = User {
            username: "alice".into(),
            password_hash: "hash".into(),
            date_joined: Utc::now(),
        };
        storage.create_user(&user).unwrap();
        assert!(matches!(
            storage.create_user(&user),
            Err(StorageError::UserExists(_))
        ));

        let first = storage.get_or_create_token("alice", "key-one").unwrap();
        let second = storage.get_or_create_token("alice", "key-two").unwrap();
        assert_eq!(first, "key-one");
        assert_eq!(second, "key-one");
        assert_eq!(storage.user_for_token("key-one").unwrap().as_deref(), Some("alice"));
        assert!(storage.user_for_token("key-two").unwrap().is_none());
        assert_eq!(storage.token_for("alice").unwrap().as_deref(), Some("key-one"));
    }
}
