use sqlx::Statement;

use crate::db::Database;
use crate::error::{Error, Result, StorageContext, is_foreign_key_violation};
use crate::model::SshKey;

const SELECT_BY_ID: &str = "SELECT id, machine_id, key_text FROM ssh_keys WHERE id = ?";
const SELECT_BY_MACHINE: &str =
    "SELECT id, machine_id, key_text FROM ssh_keys WHERE machine_id = ? ORDER BY id";
const SELECT_ALL: &str = "SELECT id, machine_id, key_text FROM ssh_keys ORDER BY id";
const COUNT_BY_ID: &str = "SELECT COUNT(*) FROM ssh_keys WHERE id = ?";
const INSERT: &str = "INSERT INTO ssh_keys (machine_id, key_text) VALUES (?, ?)";
const UPDATE: &str = "UPDATE ssh_keys
    SET machine_id = ?, key_text = ?, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?";
const DELETE: &str = "DELETE FROM ssh_keys WHERE id = ?";

/// Persistence for [`SshKey`] records.
#[derive(Clone)]
pub struct SshKeyRepository {
    db: Database,
}

impl SshKeyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, mut key: SshKey) -> Result<SshKey> {
        if key.machine_id == 0 {
            return Err(Error::Validation("SSH key machine ID is required".to_string()));
        }
        if key.key_text.trim().is_empty() {
            return Err(Error::Validation("SSH key text is required".to_string()));
        }

        let statement = if key.id == 0 {
            self.db.statement(INSERT).await?
        } else {
            self.db.statement(UPDATE).await?
        };
        let mut query = statement.query().bind(key.machine_id).bind(&key.key_text);
        if key.id != 0 {
            query = query.bind(key.id);
        }

        let result = match query.execute(self.db.pool()).await {
            Err(error) if is_foreign_key_violation(&error) => {
                return Err(Error::Validation(format!(
                    "machine {} does not exist",
                    key.machine_id
                )));
            }
            other => other.context("failed to save SSH key")?,
        };

        if key.id == 0 {
            key.id = result.last_insert_rowid();
        } else if result.rows_affected() == 0 {
            return Err(Error::not_found("SSH key", key.id));
        }
        Ok(key)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<SshKey> {
        let statement = self.db.statement(SELECT_BY_ID).await?;
        statement
            .query_as::<SshKey>()
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find SSH key")?
            .ok_or_else(|| Error::not_found("SSH key", id))
    }

    pub async fn find_all(&self) -> Result<Vec<SshKey>> {
        let statement = self.db.statement(SELECT_ALL).await?;
        statement
            .query_as::<SshKey>()
            .fetch_all(self.db.pool())
            .await
            .context("failed to list SSH keys")
    }

    pub async fn find_by_machine_id(&self, machine_id: i64) -> Result<Vec<SshKey>> {
        let statement = self.db.statement(SELECT_BY_MACHINE).await?;
        statement
            .query_as::<SshKey>()
            .bind(machine_id)
            .fetch_all(self.db.pool())
            .await
            .context("failed to find SSH keys for machine")
    }

    pub async fn exists_by_id(&self, id: i64) -> Result<bool> {
        let statement = self.db.statement(COUNT_BY_ID).await?;
        let count: i64 = statement
            .query_scalar()
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check SSH key existence")?;
        Ok(count > 0)
    }

    /// Deleting a key that does not exist is not an error.
    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        let statement = self.db.statement(DELETE).await?;
        statement
            .query()
            .bind(id)
            .execute(self.db.pool())
            .await
            .context("failed to delete SSH key")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MachineRepository;
    use crate::testing::TestDatabase;

    fn key(machine_id: i64, text: &str) -> SshKey {
        SshKey {
            machine_id,
            key_text: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_find_update() {
        let test_db = TestDatabase::new().await;
        let machine = test_db.machine("vm1", None).await;
        let repo = SshKeyRepository::new(test_db.db.clone());

        let saved = repo.save(key(machine.id, "ssh-ed25519 AAAA one")).await.unwrap();
        assert_eq!(repo.find_by_id(saved.id).await.unwrap(), saved);

        let rotated = SshKey {
            key_text: "ssh-ed25519 BBBB two".to_string(),
            ..saved.clone()
        };
        repo.save(rotated.clone()).await.unwrap();
        assert_eq!(repo.find_by_machine_id(machine.id).await.unwrap(), vec![rotated]);
        assert_eq!(repo.find_all().await.unwrap().len(), 1);
        assert!(repo.exists_by_id(saved.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_bad_keys() {
        let test_db = TestDatabase::new().await;
        let machine = test_db.machine("vm1", None).await;
        let repo = SshKeyRepository::new(test_db.db.clone());

        assert!(matches!(repo.save(key(0, "ssh-rsa x")).await, Err(Error::Validation(_))));
        assert!(matches!(repo.save(key(machine.id, "")).await, Err(Error::Validation(_))));
        assert!(matches!(
            repo.save(key(machine.id + 50, "ssh-rsa x")).await,
            Err(Error::Validation(_))
        ));

        let ghost = SshKey {
            id: 77,
            ..key(machine.id, "ssh-rsa x")
        };
        assert!(repo.save(ghost).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_keys_follow_machine() {
        let test_db = TestDatabase::new().await;
        let machine = test_db.machine("vm1", None).await;
        let repo = SshKeyRepository::new(test_db.db.clone());
        let machines = MachineRepository::new(test_db.db.clone());

        let saved = repo.save(key(machine.id, "ssh-rsa x")).await.unwrap();
        machines.delete_by_id(machine.id).await.unwrap();

        assert!(repo.find_by_machine_id(machine.id).await.unwrap().is_empty());
        assert!(repo.find_by_id(saved.id).await.unwrap_err().is_not_found());
        repo.delete_by_id(saved.id).await.unwrap();
    }
}
