#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use async_trait::async_trait;
use bridge_store::{
    BridgeAccount, BridgeKind, BridgeStore, ExternalReply, Follow, FollowPage, KeyPair, KeyType, MonitoredPost,
    NewBridgeAccount, NewExternalReply, NewFollow, NewKeyPair, PostMapping,
};
use libsql::Connection;
use time::OffsetDateTime;

pub use libsql;

// Typically, migrations should not be modified once released, and we should only be appending to this list.
const MIGRATIONS: &[&str] = &[
    // Migration 0 - Initial schema
    "CREATE TABLE follows (
        user_did TEXT NOT NULL,
        activity_id TEXT NOT NULL UNIQUE,
        actor_uri TEXT NOT NULL,
        actor_inbox TEXT NOT NULL,
        created_at INT NOT NULL,
        UNIQUE (user_did, actor_uri)
    ) STRICT;

    CREATE INDEX idx_follows_user_created ON follows(user_did, created_at DESC);

    CREATE TABLE key_pairs (
        user_did TEXT NOT NULL,
        key_type TEXT NOT NULL,
        public_jwk TEXT NOT NULL,
        private_jwk TEXT NOT NULL,
        created_at INT NOT NULL,
        PRIMARY KEY (user_did, key_type)
    ) STRICT;

    CREATE TABLE bridge_accounts (
        kind TEXT NOT NULL PRIMARY KEY,
        did TEXT NOT NULL,
        handle TEXT NOT NULL,
        password TEXT NOT NULL,
        access_jwt TEXT NOT NULL,
        refresh_jwt TEXT NOT NULL,
        created_at INT NOT NULL,
        updated_at INT NOT NULL
    ) STRICT;

    CREATE TABLE post_mappings (
        at_uri TEXT NOT NULL PRIMARY KEY,
        ap_note_id TEXT NOT NULL UNIQUE,
        created_at INT NOT NULL
    ) STRICT;

    CREATE TABLE monitored_posts (
        at_uri TEXT NOT NULL PRIMARY KEY,
        author_did TEXT NOT NULL,
        last_checked INT,
        created_at INT NOT NULL
    ) STRICT;

    CREATE INDEX idx_monitored_posts_last_checked ON monitored_posts(last_checked ASC);

    CREATE TABLE external_replies (
        at_uri TEXT NOT NULL PRIMARY KEY,
        parent_at_uri TEXT NOT NULL,
        author_did TEXT NOT NULL,
        ap_note_id TEXT NOT NULL,
        created_at INT NOT NULL
    ) STRICT;",
];

/// Implementation of [`BridgeStore`] using libSQL as the backend.
///
/// A single relational file in WAL mode holds every table of the bridge;
/// readers never block writers.
pub struct LibSqlBridgeStore {
    conn: Connection,
}

impl LibSqlBridgeStore {
    /// Opens a new libSQL connection and creates a store instance.
    ///
    /// The path can be a file path for local SQLite (e.g., "/var/lib/skybridge/bridge.db")
    /// or ":memory:" for an in-memory database.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let conn = libsql::Builder::new_local(path)
            .build()
            .await
            .context("failed to open libSQL connection")?
            .connect()
            .context("failed to connect to libSQL")?;

        Ok(Self { conn })
    }

    async fn apply_pragmas(&self) -> anyhow::Result<()> {
        const PRAGMAS: &str = "
            -- https://www.sqlite.org/pragma.html#pragma_journal_mode
            -- Use a write-ahead log instead of a rollback journal to implement transactions.
            PRAGMA journal_mode = WAL;

            -- https://www.sqlite.org/pragma.html#pragma_synchronous
            -- WAL mode is safe from corruption with synchronous=NORMAL.
            PRAGMA synchronous = NORMAL;

            -- https://www.sqlite.org/pragma.html#pragma_busy_timeout
            -- Wait for a locked resource instead of returning SQLITE_BUSY immediately.
            PRAGMA busy_timeout = 15000;

            -- https://www.sqlite.org/pragma.html#pragma_temp_store
            -- Store temporary tables and data in memory for better performance.
            PRAGMA temp_store = MEMORY;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = self
            .conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to batch execute SQL query")?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    self.conn
                        .execute_batch(sql_query)
                        .await
                        .with_context(|| format!("failed to execute migration {migration_id}"))?;

                    self.update_user_version(migration_id + 1)
                        .await
                        .context("failed to update user version")?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> anyhow::Result<usize> {
        let row = self
            .conn
            .query("PRAGMA user_version", ())
            .await
            .context("failed to execute SQL query")?
            .next()
            .await
            .context("failed to read the row")?
            .context("no row returned")?;

        let value = row.get::<u64>(0).context("failed to read user_version value")?;

        usize::try_from(value).context("user_version out of range")
    }

    async fn update_user_version(&self, value: usize) -> anyhow::Result<()> {
        let value = u64::try_from(value).context("user_version out of range")?;

        self.conn
            .execute(&format!("PRAGMA user_version = {value}"), ())
            .await
            .context("failed to execute SQL query")?;

        Ok(())
    }
}

#[async_trait]
impl BridgeStore for LibSqlBridgeStore {
    async fn setup(&self) -> anyhow::Result<()> {
        self.apply_pragmas().await?;
        self.migrate().await?;
        Ok(())
    }

    async fn create_follow(&self, follow: NewFollow) -> anyhow::Result<()> {
        let sql_query = "INSERT OR IGNORE INTO follows (user_did, activity_id, actor_uri, actor_inbox, created_at)
            VALUES (?, ?, ?, ?, ?)";

        trace!(%follow.user_did, %follow.actor_uri, "Creating follow");

        self.conn
            .execute(
                sql_query,
                (
                    follow.user_did,
                    follow.activity_id,
                    follow.actor_uri,
                    follow.actor_inbox,
                    now_ms(),
                ),
            )
            .await
            .context("failed to insert follow")?;

        Ok(())
    }

    async fn delete_follow(&self, user_did: &str, actor_uri: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "DELETE FROM follows WHERE user_did = ? AND actor_uri = ?",
                (user_did, actor_uri),
            )
            .await
            .context("failed to delete follow")?;

        Ok(())
    }

    async fn get_follows(&self, user_did: &str, cursor: Option<i64>, limit: usize) -> anyhow::Result<FollowPage> {
        // Request one row past the page to know whether a next cursor exists.
        let over_fetch = i64::try_from(limit).unwrap_or(i64::MAX).saturating_add(1);

        let mut rows = match cursor {
            Some(cursor) => {
                let sql_query = "SELECT user_did, activity_id, actor_uri, actor_inbox, created_at FROM follows
                    WHERE user_did = ? AND created_at < ?
                    ORDER BY created_at DESC
                    LIMIT ?";
                self.conn.query(sql_query, (user_did, cursor, over_fetch)).await
            }
            None => {
                let sql_query = "SELECT user_did, activity_id, actor_uri, actor_inbox, created_at FROM follows
                    WHERE user_did = ?
                    ORDER BY created_at DESC
                    LIMIT ?";
                self.conn.query(sql_query, (user_did, over_fetch)).await
            }
        }
        .context("failed to query follows")?;

        let mut follows = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read follow row")? {
            follows.push(Follow {
                user_did: row.get(0).context("failed to get user_did")?,
                activity_id: row.get(1).context("failed to get activity_id")?,
                actor_uri: row.get(2).context("failed to get actor_uri")?,
                actor_inbox: row.get(3).context("failed to get actor_inbox")?,
                created_at: ms_to_datetime(row.get(4).context("failed to get created_at")?)?,
            });
        }

        let next_cursor = if follows.len() > limit {
            follows.truncate(limit);
            follows.last().map(|follow| datetime_to_ms(follow.created_at))
        } else {
            None
        };

        Ok(FollowPage { follows, next_cursor })
    }

    async fn get_follows_count(&self, user_did: &str) -> anyhow::Result<u64> {
        let row = self
            .conn
            .query("SELECT COUNT(*) FROM follows WHERE user_did = ?", [user_did])
            .await
            .context("failed to count follows")?
            .next()
            .await
            .context("failed to read count row")?
            .context("no row returned")?;

        row.get::<u64>(0).context("failed to get count")
    }

    async fn create_key_pair(&self, key_pair: NewKeyPair) -> anyhow::Result<KeyPair> {
        let sql_query = "INSERT OR IGNORE INTO key_pairs (user_did, key_type, public_jwk, private_jwk, created_at)
            VALUES (?, ?, ?, ?, ?)";

        trace!(%key_pair.user_did, key_type = %key_pair.key_type, "Creating key pair");

        self.conn
            .execute(
                sql_query,
                (
                    key_pair.user_did.clone(),
                    key_pair.key_type.as_str(),
                    key_pair.public_jwk,
                    key_pair.private_jwk,
                    now_ms(),
                ),
            )
            .await
            .context("failed to insert key pair")?;

        // On race, the losing insert is a no-op and the winner's row is returned.
        self.get_key_pair(&key_pair.user_did, key_pair.key_type)
            .await?
            .context("key pair missing after insert")
    }

    async fn get_key_pair(&self, user_did: &str, key_type: KeyType) -> anyhow::Result<Option<KeyPair>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_did, key_type, public_jwk, private_jwk, created_at FROM key_pairs
                    WHERE user_did = ? AND key_type = ?",
                (user_did, key_type.as_str()),
            )
            .await
            .context("failed to query key pair")?;

        match rows.next().await.context("failed to read key pair row")? {
            Some(row) => Ok(Some(read_key_pair(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_key_pairs(&self, user_did: &str) -> anyhow::Result<Vec<KeyPair>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_did, key_type, public_jwk, private_jwk, created_at FROM key_pairs
                    WHERE user_did = ? ORDER BY key_type",
                [user_did],
            )
            .await
            .context("failed to query key pairs")?;

        let mut key_pairs = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read key pair row")? {
            key_pairs.push(read_key_pair(&row)?);
        }

        Ok(key_pairs)
    }

    async fn get_bridge_account(&self, kind: BridgeKind) -> anyhow::Result<Option<BridgeAccount>> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, did, handle, password, access_jwt, refresh_jwt, created_at, updated_at
                    FROM bridge_accounts WHERE kind = ?",
                [kind.as_str()],
            )
            .await
            .context("failed to query bridge account")?;

        let Some(row) = rows.next().await.context("failed to read bridge account row")? else {
            return Ok(None);
        };

        let kind_db: String = row.get(0).context("failed to get kind")?;

        Ok(Some(BridgeAccount {
            kind: BridgeKind::parse(&kind_db).with_context(|| format!("unknown bridge kind: {kind_db}"))?,
            did: row.get(1).context("failed to get did")?,
            handle: row.get(2).context("failed to get handle")?,
            password: row.get(3).context("failed to get password")?,
            access_jwt: row.get(4).context("failed to get access_jwt")?,
            refresh_jwt: row.get(5).context("failed to get refresh_jwt")?,
            created_at: ms_to_datetime(row.get(6).context("failed to get created_at")?)?,
            updated_at: ms_to_datetime(row.get(7).context("failed to get updated_at")?)?,
        }))
    }

    async fn create_bridge_account(&self, account: NewBridgeAccount) -> anyhow::Result<()> {
        let now = now_ms();

        self.conn
            .execute(
                "INSERT INTO bridge_accounts (kind, did, handle, password, access_jwt, refresh_jwt, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    account.kind.as_str(),
                    account.did,
                    account.handle,
                    account.password,
                    account.access_jwt,
                    account.refresh_jwt,
                    now,
                    now,
                ),
            )
            .await
            .context("failed to insert bridge account")?;

        Ok(())
    }

    async fn update_bridge_tokens(
        &self,
        kind: BridgeKind,
        access_jwt: &str,
        refresh_jwt: &str,
    ) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE bridge_accounts SET access_jwt = ?, refresh_jwt = ?, updated_at = ? WHERE kind = ?",
                (access_jwt, refresh_jwt, now_ms(), kind.as_str()),
            )
            .await
            .context("failed to update bridge tokens")?;

        Ok(())
    }

    async fn delete_bridge_account(&self, kind: BridgeKind) -> anyhow::Result<()> {
        self.conn
            .execute("DELETE FROM bridge_accounts WHERE kind = ?", [kind.as_str()])
            .await
            .context("failed to delete bridge account")?;

        Ok(())
    }

    async fn create_post_mapping(&self, at_uri: &str, ap_note_id: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO post_mappings (at_uri, ap_note_id, created_at) VALUES (?, ?, ?)",
                (at_uri, ap_note_id, now_ms()),
            )
            .await
            .context("failed to insert post mapping")?;

        Ok(())
    }

    async fn get_post_mapping_by_at_uri(&self, at_uri: &str) -> anyhow::Result<Option<PostMapping>> {
        self.query_post_mapping("SELECT at_uri, ap_note_id, created_at FROM post_mappings WHERE at_uri = ?", at_uri)
            .await
    }

    async fn get_post_mapping_by_ap_note_id(&self, ap_note_id: &str) -> anyhow::Result<Option<PostMapping>> {
        self.query_post_mapping(
            "SELECT at_uri, ap_note_id, created_at FROM post_mappings WHERE ap_note_id = ?",
            ap_note_id,
        )
        .await
    }

    async fn create_monitored_post(&self, at_uri: &str, author_did: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO monitored_posts (at_uri, author_did, last_checked, created_at)
                    VALUES (?, ?, NULL, ?)",
                (at_uri, author_did, now_ms()),
            )
            .await
            .context("failed to insert monitored post")?;

        Ok(())
    }

    async fn get_monitored_posts_batch(&self, limit: usize) -> anyhow::Result<Vec<MonitoredPost>> {
        let mut rows = self
            .conn
            .query(
                "SELECT at_uri, author_did, last_checked, created_at FROM monitored_posts
                    ORDER BY last_checked ASC NULLS FIRST
                    LIMIT ?",
                [i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .context("failed to query monitored posts")?;

        let mut posts = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read monitored post row")? {
            let last_checked = match row.get_value(2).context("failed to get last_checked")? {
                libsql::Value::Null => None,
                libsql::Value::Integer(ms) => Some(ms_to_datetime(ms)?),
                value => anyhow::bail!("unexpected last_checked value: {value:?}"),
            };

            posts.push(MonitoredPost {
                at_uri: row.get(0).context("failed to get at_uri")?,
                author_did: row.get(1).context("failed to get author_did")?,
                last_checked,
                created_at: ms_to_datetime(row.get(3).context("failed to get created_at")?)?,
            });
        }

        Ok(posts)
    }

    async fn update_monitored_post_last_checked(&self, at_uri: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE monitored_posts SET last_checked = ? WHERE at_uri = ?",
                (now_ms(), at_uri),
            )
            .await
            .context("failed to update monitored post")?;

        Ok(())
    }

    async fn get_external_reply(&self, at_uri: &str) -> anyhow::Result<Option<ExternalReply>> {
        let mut rows = self
            .conn
            .query(
                "SELECT at_uri, parent_at_uri, author_did, ap_note_id, created_at FROM external_replies
                    WHERE at_uri = ?",
                [at_uri],
            )
            .await
            .context("failed to query external reply")?;

        let Some(row) = rows.next().await.context("failed to read external reply row")? else {
            return Ok(None);
        };

        Ok(Some(ExternalReply {
            at_uri: row.get(0).context("failed to get at_uri")?,
            parent_at_uri: row.get(1).context("failed to get parent_at_uri")?,
            author_did: row.get(2).context("failed to get author_did")?,
            ap_note_id: row.get(3).context("failed to get ap_note_id")?,
            created_at: ms_to_datetime(row.get(4).context("failed to get created_at")?)?,
        }))
    }

    async fn create_external_reply(&self, reply: NewExternalReply) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO external_replies (at_uri, parent_at_uri, author_did, ap_note_id, created_at)
                    VALUES (?, ?, ?, ?, ?)",
                (reply.at_uri, reply.parent_at_uri, reply.author_did, reply.ap_note_id, now_ms()),
            )
            .await
            .context("failed to insert external reply")?;

        Ok(())
    }
}

impl LibSqlBridgeStore {
    async fn query_post_mapping(&self, sql_query: &str, key: &str) -> anyhow::Result<Option<PostMapping>> {
        let mut rows = self
            .conn
            .query(sql_query, [key])
            .await
            .context("failed to query post mapping")?;

        let Some(row) = rows.next().await.context("failed to read post mapping row")? else {
            return Ok(None);
        };

        Ok(Some(PostMapping {
            at_uri: row.get(0).context("failed to get at_uri")?,
            ap_note_id: row.get(1).context("failed to get ap_note_id")?,
            created_at: ms_to_datetime(row.get(2).context("failed to get created_at")?)?,
        }))
    }
}

fn read_key_pair(row: &libsql::Row) -> anyhow::Result<KeyPair> {
    let key_type_db: String = row.get(1).context("failed to get key_type")?;

    Ok(KeyPair {
        user_did: row.get(0).context("failed to get user_did")?,
        key_type: KeyType::parse(&key_type_db).with_context(|| format!("unknown key type: {key_type_db}"))?,
        public_jwk: row.get(2).context("failed to get public_jwk")?,
        private_jwk: row.get(3).context("failed to get private_jwk")?,
        created_at: ms_to_datetime(row.get(4).context("failed to get created_at")?)?,
    })
}

fn now_ms() -> i64 {
    datetime_to_ms(OffsetDateTime::now_utc())
}

fn datetime_to_ms(datetime: OffsetDateTime) -> i64 {
    i64::try_from(datetime.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn ms_to_datetime(ms: i64) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).context("timestamp out of range")
}
