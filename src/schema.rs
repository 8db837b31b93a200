//! Versioned schema for the metadata store.
//!
//! Each migration is a list of single statements applied in one
//! transaction and recorded in `schema_migrations`. Versions already
//! recorded are skipped, so bootstrapping an existing database is a no-op.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::{Result, StorageContext};

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_machines",
        statements: &[
            "CREATE TABLE machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                hostname TEXT NOT NULL,
                ipv4 TEXT UNIQUE,
                network_id INTEGER,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            "CREATE TABLE ssh_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id INTEGER NOT NULL,
                key_text TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (machine_id) REFERENCES machines(id) ON DELETE CASCADE
            )",
        ],
    },
    Migration {
        version: 2,
        name: "create_networks",
        statements: &[
            "CREATE TABLE networks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                bridge TEXT NOT NULL,
                subnet TEXT NOT NULL,
                gateway TEXT,
                dns_servers TEXT,
                description TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            "CREATE TABLE dhcp_ranges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                network_id INTEGER NOT NULL,
                start_ip TEXT NOT NULL,
                end_ip TEXT NOT NULL,
                lease_time TEXT NOT NULL DEFAULT '24h',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (network_id) REFERENCES networks(id) ON DELETE CASCADE
            )",
        ],
    },
    Migration {
        version: 3,
        name: "create_ip_address_leases",
        statements: &[
            "CREATE TABLE ip_address_leases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id INTEGER NOT NULL,
                network_id INTEGER NOT NULL,
                ip_address TEXT NOT NULL UNIQUE,
                lease_time TEXT NOT NULL DEFAULT '24h',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (machine_id) REFERENCES machines(id) ON DELETE CASCADE,
                FOREIGN KEY (network_id) REFERENCES networks(id) ON DELETE CASCADE,
                UNIQUE (machine_id, network_id)
            )",
        ],
    },
    Migration {
        version: 4,
        name: "add_lookup_indices",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_ssh_keys_machine_id ON ssh_keys(machine_id)",
            "CREATE INDEX IF NOT EXISTS idx_machines_network_id ON machines(network_id)",
            "CREATE INDEX IF NOT EXISTS idx_networks_bridge ON networks(bridge)",
            "CREATE INDEX IF NOT EXISTS idx_dhcp_ranges_network_id ON dhcp_ranges(network_id)",
            "CREATE INDEX IF NOT EXISTS idx_ip_leases_machine_id ON ip_address_leases(machine_id)",
            "CREATE INDEX IF NOT EXISTS idx_ip_leases_network_id ON ip_address_leases(network_id)",
        ],
    },
];

/// Applies every migration newer than the recorded version.
///
/// Returns the number of migrations applied.
pub async fn migrate(pool: &SqlitePool) -> Result<usize> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .context("failed to create schema_migrations")?;

    let current = current_version(pool).await?;
    let mut applied = 0;

    for migration in MIGRATIONS.iter().filter(|migration| migration.version > current) {
        let mut tx = pool
            .begin()
            .await
            .context("failed to begin migration")?;

        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .context(&format!(
                    "failed to run migration {} ({})",
                    migration.version, migration.name
                ))?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await
            .context("failed to record migration")?;

        tx.commit().await.context("failed to commit migration")?;

        info!(
            "Applied migration {} ({})",
            migration.version, migration.name
        );
        applied += 1;
    }

    Ok(applied)
}

pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await
        .context("failed to read schema version")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_ascending() {
        assert!(
            MIGRATIONS
                .windows(2)
                .all(|pair| pair[0].version < pair[1].version)
        );
    }
}
