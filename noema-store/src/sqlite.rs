//! SQLite-backed `Store`. Hot-path aggregates (users, deposits, generations) get real
//! columns and the indexes named in §6; the lower-traffic aggregates (cooks, spells, LoRAs,
//! API keys) are stored as JSON blobs keyed by id, following the teacher's key/value table
//! idiom. Every call wraps a synchronous `rusqlite` section in `block_in_place` so the
//! connection mutex is only ever held on a blocking thread.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::str::FromStr;

use noema_model::{
    ApiKey, Cook, CookId, CookStatus, Deposit, DepositId, DepositOrigin, DepositOwner,
    DepositStatus, GenerationId, GenerationRecord, LoraModel, LoraPermission, MasterAccountId,
    Platform, PlatformIdentity, RunId, Spell, SpellCast, SpellCastId, Tool, ToolId, User,
    UserStatus, Wallet,
};

use crate::error::StoreError;
use crate::filter::{GenerationFilter, GenerationPatch, WorkerControl};
use crate::traits::{NewUserHints, Store};

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_core (
                master_account_id TEXT PRIMARY KEY,
                display_name TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_identities (
                master_account_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                platform_id TEXT NOT NULL,
                PRIMARY KEY (platform, platform_id)
            );
            CREATE TABLE IF NOT EXISTS user_wallets (
                master_account_id TEXT NOT NULL,
                address TEXT NOT NULL,
                is_primary INTEGER NOT NULL,
                linked_at INTEGER NOT NULL,
                PRIMARY KEY (master_account_id, address)
            );
            CREATE TABLE IF NOT EXISTS credit_ledger (
                id TEXT PRIMARY KEY,
                master_account_id TEXT,
                depositor_address TEXT,
                origin_json TEXT NOT NULL,
                deposit_tx_hash TEXT UNIQUE,
                token_address TEXT NOT NULL,
                usd_value TEXT NOT NULL,
                points_credited INTEGER NOT NULL,
                points_remaining INTEGER NOT NULL,
                funding_rate_applied TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_tx_hash ON credit_ledger(deposit_tx_hash);
            CREATE INDEX IF NOT EXISTS idx_ledger_user ON credit_ledger(master_account_id, status, points_remaining);
            CREATE INDEX IF NOT EXISTS idx_ledger_depositor ON credit_ledger(depositor_address, status, points_remaining);
            CREATE TABLE IF NOT EXISTS ledger_deficits (
                master_account_id TEXT NOT NULL,
                generation_id TEXT NOT NULL,
                points INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS generation_outputs (
                id TEXT PRIMARY KEY,
                master_account_id TEXT NOT NULL,
                run_id TEXT,
                status TEXT NOT NULL,
                cook_execution_id TEXT,
                spell_cast_id TEXT,
                request_timestamp INTEGER NOT NULL,
                payload_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_generation_run_id ON generation_outputs(run_id);
            CREATE INDEX IF NOT EXISTS idx_generation_user ON generation_outputs(master_account_id, status);
            CREATE TABLE IF NOT EXISTS tools (id TEXT PRIMARY KEY, payload_json TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS cooks (
                id TEXT PRIMARY KEY,
                master_account_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cooks_user_status ON cooks(master_account_id, status);
            CREATE TABLE IF NOT EXISTS spells (slug TEXT PRIMARY KEY, visibility TEXT NOT NULL, payload_json TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS spell_casts (id TEXT PRIMARY KEY, payload_json TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS lora_models (slug TEXT PRIMARY KEY, payload_json TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS lora_permissions (
                lora_slug TEXT NOT NULL,
                master_account_id TEXT NOT NULL,
                PRIMARY KEY (lora_slug, master_account_id)
            );
            CREATE TABLE IF NOT EXISTS api_keys (
                key_prefix TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS worker_controls (
                name TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError> + Send) -> Result<T, StoreError>
    where
        T: Send,
    {
        let db = self.db.clone();
        tokio::task::block_in_place(|| {
            let conn = db.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
    }

    fn load_user(conn: &Connection, id: &MasterAccountId) -> Result<User, StoreError> {
        let (display_name, status, created_at): (Option<String>, String, i64) = conn
            .query_row(
                "SELECT display_name, status, created_at FROM user_core WHERE master_account_id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;

        let mut stmt = conn.prepare(
            "SELECT platform, platform_id FROM user_identities WHERE master_account_id = ?1",
        )?;
        let identities = stmt
            .query_map(params![id.as_str()], |row| {
                let platform: String = row.get(0)?;
                let platform_id: String = row.get(1)?;
                Ok((platform, platform_id))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(p, platform_id)| PlatformIdentity {
                platform: parse_platform(&p),
                platform_id,
            })
            .collect();

        let mut stmt = conn.prepare(
            "SELECT address, is_primary, linked_at FROM user_wallets WHERE master_account_id = ?1",
        )?;
        let wallets = stmt
            .query_map(params![id.as_str()], |row| {
                let address: String = row.get(0)?;
                let is_primary: i64 = row.get(1)?;
                let linked_at: i64 = row.get(2)?;
                Ok(Wallet {
                    address,
                    is_primary: is_primary != 0,
                    linked_at: from_millis(linked_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(User {
            master_account_id: id.clone(),
            display_name,
            identities,
            wallets,
            status: if status == "suspended" { UserStatus::Suspended } else { UserStatus::Active },
            created_at: from_millis(created_at),
        })
    }

    fn load_deposit(row: &rusqlite::Row) -> rusqlite::Result<Deposit> {
        let id: String = row.get("id")?;
        let master_account_id: Option<String> = row.get("master_account_id")?;
        let depositor_address: Option<String> = row.get("depositor_address")?;
        let origin_json: String = row.get("origin_json")?;
        let token_address: String = row.get("token_address")?;
        let usd_value: String = row.get("usd_value")?;
        let points_credited: i64 = row.get("points_credited")?;
        let points_remaining: i64 = row.get("points_remaining")?;
        let funding_rate_applied: String = row.get("funding_rate_applied")?;
        let status: String = row.get("status")?;
        let created_at: i64 = row.get("created_at")?;

        let owner = match master_account_id {
            Some(id) => DepositOwner::Account(MasterAccountId::parse(id).unwrap_or_else(|_| {
                MasterAccountId::parse("0".repeat(24)).unwrap()
            })),
            None => DepositOwner::DepositorAddress(depositor_address.unwrap_or_default()),
        };
        let origin: DepositOrigin = serde_json::from_str(&origin_json).unwrap_or(DepositOrigin::Reward {
            reward_type: "unknown".into(),
            description: String::new(),
        });

        Ok(Deposit {
            id: DepositId::new(id),
            owner,
            origin,
            token_address,
            usd_value: Decimal::from_str(&usd_value).unwrap_or(Decimal::ZERO),
            points_credited,
            points_remaining,
            funding_rate_applied: Decimal::from_str(&funding_rate_applied).unwrap_or(Decimal::ZERO),
            status: parse_deposit_status(&status),
            created_at: from_millis(created_at),
        })
    }

    fn load_generation(row: &rusqlite::Row) -> rusqlite::Result<GenerationRecord> {
        let payload_json: String = row.get("payload_json")?;
        Ok(serde_json::from_str(&payload_json).expect("generation payload is always valid json"))
    }
}

fn parse_platform(s: &str) -> Platform {
    match s {
        "discord" => Platform::Discord,
        "web" => Platform::Web,
        _ => Platform::Telegram,
    }
}

fn platform_str(p: Platform) -> &'static str {
    match p {
        Platform::Telegram => "telegram",
        Platform::Discord => "discord",
        Platform::Web => "web",
    }
}

fn parse_deposit_status(s: &str) -> DepositStatus {
    match s {
        "PENDING" => DepositStatus::Pending,
        "EXHAUSTED" => DepositStatus::Exhausted,
        "REFUNDED" => DepositStatus::Refunded,
        _ => DepositStatus::Confirmed,
    }
}

fn deposit_status_str(s: DepositStatus) -> &'static str {
    match s {
        DepositStatus::Pending => "PENDING",
        DepositStatus::Confirmed => "CONFIRMED",
        DepositStatus::Exhausted => "EXHAUSTED",
        DepositStatus::Refunded => "REFUNDED",
    }
}

fn insert_deposit(conn: &Connection, deposit: &Deposit) -> Result<(), StoreError> {
    let (master_account_id, depositor_address) = match &deposit.owner {
        DepositOwner::Account(id) => (Some(id.as_str().to_string()), None),
        DepositOwner::DepositorAddress(addr) => (None, Some(addr.clone())),
    };
    conn.execute(
        "INSERT INTO credit_ledger (id, master_account_id, depositor_address, origin_json, deposit_tx_hash,
            token_address, usd_value, points_credited, points_remaining, funding_rate_applied, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            deposit.id.as_str(),
            master_account_id,
            depositor_address,
            serde_json::to_string(&deposit.origin).unwrap(),
            deposit.deposit_tx_hash(),
            deposit.token_address,
            deposit.usd_value.to_string(),
            deposit.points_credited,
            deposit.points_remaining,
            deposit.funding_rate_applied.to_string(),
            deposit_status_str(deposit.status),
            millis(deposit.created_at),
        ],
    )?;
    Ok(())
}

fn store_generation(conn: &Connection, record: &GenerationRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO generation_outputs
            (id, master_account_id, run_id, status, cook_execution_id, spell_cast_id, request_timestamp, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id.as_str(),
            record.master_account_id.as_str(),
            record.metadata.run_id.as_ref().map(|r| r.as_str()),
            format!("{:?}", record.status),
            record.metadata.cook_execution_id.as_ref().map(|c| c.as_str()),
            record.metadata.spell_cast_id.as_ref().map(|c| c.as_str()),
            millis(record.request_timestamp),
            serde_json::to_string(record).unwrap(),
        ],
    )?;
    Ok(())
}

fn apply_patch(record: &mut GenerationRecord, patch: GenerationPatch) {
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(ds) = patch.delivery_status {
        record.delivery_status = ds;
    }
    if let Some(np) = patch.notification_platform {
        record.notification_platform = np;
    }
    if patch.run_id_set {
        record.metadata.run_id = patch.run_id;
    }
    if let Some(progress) = patch.progress {
        record.progress = Some(progress);
    }
    if let Some(live_status) = patch.live_status {
        record.live_status = Some(live_status);
    }
    if let Some(ts) = patch.response_timestamp {
        record.response_timestamp = Some(ts);
    }
    if let Some(d) = patch.duration_ms {
        record.duration_ms = Some(d);
    }
    if let Some(cost) = patch.cost_usd {
        record.cost_usd = Some(cost);
    }
    if let Some(points) = patch.points_spent {
        record.points_spent = Some(points);
    }
    if let Some(result) = patch.result_payload {
        record.result_payload = Some(result);
    }
    if let Some(error) = patch.error {
        record.error = Some(error);
    }
    if let Some(x402) = patch.x402 {
        record.metadata.x402 = Some(x402);
    }
    if let Some(runtime_data) = patch.runtime_data {
        record.metadata.runtime_data = Some(runtime_data);
    }
}

macro_rules! json_blob_crud {
    ($get_fn:ident, $table:literal, $key_col:literal) => {
        fn $get_fn<T: serde::de::DeserializeOwned>(conn: &Connection, key: &str) -> Result<T, StoreError> {
            let payload: String = conn
                .query_row(
                    concat!("SELECT payload_json FROM ", $table, " WHERE ", $key_col, " = ?1"),
                    params![key],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("{} {}", $table, key)))?;
            Ok(serde_json::from_str(&payload).expect("stored payload is always valid json"))
        }
    };
}

json_blob_crud!(load_tool_blob, "tools", "id");
json_blob_crud!(load_cook_blob, "cooks", "id");
json_blob_crud!(load_spell_blob, "spells", "slug");
json_blob_crud!(load_cast_blob, "spell_casts", "id");
json_blob_crud!(load_lora_blob, "lora_models", "slug");
json_blob_crud!(load_key_blob, "api_keys", "key_prefix");

#[async_trait]
impl Store for SqliteStore {
    async fn find_or_create_by_platform(
        &self,
        platform: Platform,
        platform_id: &str,
        hints: NewUserHints,
    ) -> Result<(User, bool), StoreError> {
        let platform_id = platform_id.to_string();
        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT master_account_id FROM user_identities WHERE platform = ?1 AND platform_id = ?2",
                    params![platform_str(platform), platform_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                let id = MasterAccountId::parse(id).map_err(|e| StoreError::Unavailable(e.to_string()))?;
                return Ok((Self::load_user(conn, &id)?, false));
            }

            let id = loop {
                let raw = uuid::Uuid::new_v4().simple().to_string();
                let candidate = MasterAccountId::parse(&raw[..24]).expect("uuid hex prefix is valid");
                let taken: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM user_core WHERE master_account_id = ?1",
                    params![candidate.as_str()],
                    |row| row.get(0),
                )?;
                if taken == 0 {
                    break candidate;
                }
            };
            let now = Utc::now();
            conn.execute(
                "INSERT INTO user_core (master_account_id, display_name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), hints.display_name, "active", millis(now)],
            )?;
            conn.execute(
                "INSERT INTO user_identities (master_account_id, platform, platform_id) VALUES (?1, ?2, ?3)",
                params![id.as_str(), platform_str(platform), platform_id],
            )?;
            Ok((Self::load_user(conn, &id)?, true))
        })
    }

    async fn find_user_by_id(&self, id: &MasterAccountId) -> Result<User, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| Self::load_user(conn, &id))
    }

    async fn find_user_by_platform(&self, platform: Platform, platform_id: &str) -> Result<User, StoreError> {
        let platform_id = platform_id.to_string();
        self.with_conn(move |conn| {
            let id: String = conn
                .query_row(
                    "SELECT master_account_id FROM user_identities WHERE platform = ?1 AND platform_id = ?2",
                    params![platform_str(platform), platform_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("user for platform id {platform_id}")))?;
            let id = MasterAccountId::parse(id).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Self::load_user(conn, &id)
        })
    }

    async fn list_wallets(&self, user_id: &MasterAccountId) -> Result<Vec<Wallet>, StoreError> {
        Ok(self.find_user_by_id(user_id).await?.wallets)
    }

    async fn add_wallet(&self, user_id: &MasterAccountId, wallet: Wallet) -> Result<(), StoreError> {
        let user_id = user_id.clone();
        self.with_conn(move |conn| {
            if wallet.is_primary {
                conn.execute(
                    "UPDATE user_wallets SET is_primary = 0 WHERE master_account_id = ?1",
                    params![user_id.as_str()],
                )?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO user_wallets (master_account_id, address, is_primary, linked_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id.as_str(), wallet.address, wallet.is_primary as i64, millis(wallet.linked_at)],
            )?;
            Ok(())
        })
    }

    async fn update_wallet(&self, user_id: &MasterAccountId, wallet: Wallet) -> Result<(), StoreError> {
        self.add_wallet(user_id, wallet).await
    }

    async fn delete_wallet(&self, user_id: &MasterAccountId, address: &str) -> Result<(), StoreError> {
        let user_id = user_id.clone();
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM user_wallets WHERE master_account_id = ?1 AND address = ?2",
                params![user_id.as_str(), address],
            )?;
            Ok(())
        })
    }

    async fn record_deposit_if_new(&self, deposit: Deposit) -> Result<Deposit, StoreError> {
        self.with_conn(move |conn| {
            if let Some(hash) = deposit.deposit_tx_hash() {
                let existing_id: Option<String> = conn
                    .query_row(
                        "SELECT id FROM credit_ledger WHERE deposit_tx_hash = ?1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing_id {
                    return conn
                        .query_row(
                            "SELECT * FROM credit_ledger WHERE id = ?1",
                            params![id],
                            Self::load_deposit,
                        )
                        .map_err(StoreError::from);
                }
            }
            insert_deposit(conn, &deposit)?;
            Ok(deposit)
        })
    }

    async fn confirm_deposit(&self, deposit_id: &DepositId) -> Result<Deposit, StoreError> {
        let deposit_id = deposit_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE credit_ledger SET status = 'CONFIRMED' WHERE id = ?1",
                params![deposit_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("deposit {deposit_id}")));
            }
            conn.query_row(
                "SELECT * FROM credit_ledger WHERE id = ?1",
                params![deposit_id.as_str()],
                Self::load_deposit,
            )
            .map_err(StoreError::from)
        })
    }

    async fn find_active_deposits_for_user(&self, id: &MasterAccountId) -> Result<Vec<Deposit>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM credit_ledger WHERE master_account_id = ?1 AND status = 'CONFIRMED' AND points_remaining > 0
                 ORDER BY funding_rate_applied ASC, created_at ASC",
            )?;
            let rows = stmt.query_map(params![id.as_str()], Self::load_deposit)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    async fn find_active_deposits_for_wallet(&self, address: &str) -> Result<Vec<Deposit>, StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM credit_ledger WHERE depositor_address = ?1 COLLATE NOCASE AND status = 'CONFIRMED' AND points_remaining > 0
                 ORDER BY funding_rate_applied ASC, created_at ASC",
            )?;
            let rows = stmt.query_map(params![address], Self::load_deposit)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    async fn deduct_points_from_deposit(&self, deposit_id: &DepositId, amount: i64) -> Result<bool, StoreError> {
        let deposit_id = deposit_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE credit_ledger SET points_remaining = points_remaining - ?1,
                    status = CASE WHEN points_remaining - ?1 = 0 THEN 'EXHAUSTED' ELSE status END
                 WHERE id = ?2 AND points_remaining >= ?1",
                params![amount, deposit_id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    async fn sum_points_remaining(&self, id: &MasterAccountId) -> Result<i64, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let sum: Option<i64> = conn.query_row(
                "SELECT SUM(points_remaining) FROM credit_ledger WHERE master_account_id = ?1 AND status = 'CONFIRMED'",
                params![id.as_str()],
                |row| row.get(0),
            )?;
            Ok(sum.unwrap_or(0))
        })
    }

    async fn has_confirmed_deposit_with_token(
        &self,
        id: &MasterAccountId,
        token_address: &str,
    ) -> Result<bool, StoreError> {
        let id = id.clone();
        let token_address = token_address.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM credit_ledger WHERE master_account_id = ?1 AND status = 'CONFIRMED' AND token_address = ?2 COLLATE NOCASE",
                params![id.as_str(), token_address],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    async fn credit_reward(
        &self,
        user_id: &MasterAccountId,
        points: i64,
        description: &str,
        reward_type: &str,
    ) -> Result<Deposit, StoreError> {
        let deposit = Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(user_id.clone()),
            origin: DepositOrigin::Reward {
                reward_type: reward_type.to_string(),
                description: description.to_string(),
            },
            token_address: String::new(),
            usd_value: Decimal::ZERO,
            points_credited: points,
            points_remaining: points,
            funding_rate_applied: Decimal::ZERO,
            status: DepositStatus::Confirmed,
            created_at: Utc::now(),
        };
        self.with_conn(move |conn| {
            insert_deposit(conn, &deposit)?;
            Ok(deposit)
        })
    }

    async fn record_ledger_deficit(
        &self,
        user_id: &MasterAccountId,
        generation_id: &GenerationId,
        points: i64,
    ) -> Result<(), StoreError> {
        let user_id = user_id.clone();
        let generation_id = generation_id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ledger_deficits (master_account_id, generation_id, points, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id.as_str(), generation_id.as_str(), points, millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    async fn create_generation(&self, generation: GenerationRecord) -> Result<GenerationRecord, StoreError> {
        self.with_conn(move |conn| {
            store_generation(conn, &generation)?;
            Ok(generation)
        })
    }

    async fn update_generation(
        &self,
        id: &GenerationId,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut record: GenerationRecord = conn
                .query_row(
                    "SELECT payload_json FROM generation_outputs WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(|json| serde_json::from_str(&json).expect("stored generation is valid json"))
                .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))?;
            apply_patch(&mut record, patch);
            store_generation(conn, &record)?;
            Ok(record)
        })
    }

    async fn find_generation_by_id(&self, id: &GenerationId) -> Result<GenerationRecord, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM generation_outputs WHERE id = ?1",
                params![id.as_str()],
                Self::load_generation,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))
        })
    }

    async fn find_generation_by_run_id(&self, run_id: &RunId) -> Result<GenerationRecord, StoreError> {
        let run_id = run_id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM generation_outputs WHERE run_id = ?1",
                params![run_id.as_str()],
                Self::load_generation,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run_id {run_id}")))
        })
    }

    async fn find_generations(&self, filter: GenerationFilter) -> Result<Vec<GenerationRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = "SELECT * FROM generation_outputs WHERE 1=1".to_string();
            if filter.master_account_id.is_some() {
                sql.push_str(" AND master_account_id = :mid");
            }
            if filter.status.is_some() {
                sql.push_str(" AND status = :status");
            }
            if filter.cook_execution_id.is_some() {
                sql.push_str(" AND cook_execution_id = :cook");
            }
            if filter.spell_cast_id.is_some() {
                sql.push_str(" AND spell_cast_id = :cast");
            }
            sql.push_str(" ORDER BY request_timestamp ASC");
            let mut stmt = conn.prepare(&sql)?;
            let mid = filter.master_account_id.as_ref().map(|id| id.as_str().to_string());
            let status = filter.status.map(|s| format!("{:?}", s));
            let cook = filter.cook_execution_id.as_ref().map(|c| c.as_str().to_string());
            let cast = filter.spell_cast_id.as_ref().map(|c| c.as_str().to_string());
            let mut named = Vec::new();
            if let Some(v) = &mid {
                named.push((":mid", v as &dyn rusqlite::ToSql));
            }
            if let Some(v) = &status {
                named.push((":status", v as &dyn rusqlite::ToSql));
            }
            if let Some(v) = &cook {
                named.push((":cook", v as &dyn rusqlite::ToSql));
            }
            if let Some(v) = &cast {
                named.push((":cast", v as &dyn rusqlite::ToSql));
            }
            let rows = stmt.query_map(named.as_slice(), Self::load_generation)?;
            let mut out = rows.collect::<Result<Vec<_>, _>>()?;
            if let Some(limit) = filter.limit {
                out.truncate(limit);
            }
            Ok(out)
        })
    }

    async fn settle_generation(
        &self,
        id: &GenerationId,
        deductions: Vec<(DepositId, i64)>,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<GenerationRecord, StoreError> {
                for (deposit_id, amount) in &deductions {
                    let changed = conn.execute(
                        "UPDATE credit_ledger SET points_remaining = points_remaining - ?1,
                            status = CASE WHEN points_remaining - ?1 = 0 THEN 'EXHAUSTED' ELSE status END
                         WHERE id = ?2 AND points_remaining >= ?1",
                        params![amount, deposit_id.as_str()],
                    )?;
                    if changed == 0 {
                        return Err(StoreError::Conflict(format!(
                            "deposit {deposit_id} can no longer cover {amount} points"
                        )));
                    }
                }
                let mut record: GenerationRecord = conn
                    .query_row(
                        "SELECT payload_json FROM generation_outputs WHERE id = ?1",
                        params![id.as_str()],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?
                    .map(|json| serde_json::from_str(&json).expect("stored generation is valid json"))
                    .ok_or_else(|| StoreError::NotFound(format!("generation {id}")))?;
                apply_patch(&mut record, patch);
                store_generation(conn, &record)?;
                Ok(record)
            })();
            match &result {
                Ok(_) => conn.execute_batch("COMMIT")?,
                Err(_) => conn.execute_batch("ROLLBACK")?,
            }
            result
        })
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload_json FROM tools")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|j| serde_json::from_str(&j).map_err(|e| StoreError::Unavailable(e.to_string())))
                .collect()
        })
    }

    async fn upsert_tool(&self, tool: Tool) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tools (id, payload_json) VALUES (?1, ?2)",
                params![tool.tool_id.as_str(), serde_json::to_string(&tool).unwrap()],
            )?;
            Ok(())
        })
    }

    async fn create_cook(&self, cook: Cook) -> Result<Cook, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cooks (id, master_account_id, status, payload_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    cook.id.as_str(),
                    cook.master_account_id.as_str(),
                    format!("{:?}", cook.status),
                    serde_json::to_string(&cook).unwrap()
                ],
            )?;
            Ok(cook)
        })
    }

    async fn find_cook_by_id(&self, id: &CookId) -> Result<Cook, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| load_cook_blob(conn, id.as_str()))
    }

    async fn update_cook_status(&self, id: &CookId, status: CookStatus) -> Result<Cook, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut cook: Cook = load_cook_blob(conn, id.as_str())?;
            cook.status = status;
            if status.is_terminal() {
                cook.completed_at = Some(Utc::now());
            }
            conn.execute(
                "UPDATE cooks SET status = ?1, payload_json = ?2 WHERE id = ?3",
                params![format!("{:?}", status), serde_json::to_string(&cook).unwrap(), id.as_str()],
            )?;
            Ok(cook)
        })
    }

    async fn list_cooks_running(&self) -> Result<Vec<Cook>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload_json FROM cooks WHERE status = 'Running'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|j| serde_json::from_str(&j).map_err(|e| StoreError::Unavailable(e.to_string())))
                .collect()
        })
    }

    async fn list_cooks_for_user(
        &self,
        user_id: &MasterAccountId,
        status: Option<CookStatus>,
    ) -> Result<Vec<Cook>, StoreError> {
        let user_id = user_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT payload_json FROM cooks WHERE master_account_id = ?1")?;
            let rows = stmt.query_map(params![user_id.as_str()], |row| row.get::<_, String>(0))?;
            let cooks: Vec<Cook> = rows
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|j| serde_json::from_str::<Cook>(&j).expect("stored cook is valid json"))
                .filter(|c| status.map_or(true, |s| c.status == s))
                .collect();
            Ok(cooks)
        })
    }

    async fn record_cook_piece(
        &self,
        id: &CookId,
        generation_id: GenerationId,
        cost: Decimal,
        accepted: Option<bool>,
    ) -> Result<Cook, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut cook: Cook = load_cook_blob(conn, id.as_str())?;
            cook.record_piece(generation_id, cost, accepted);
            conn.execute(
                "UPDATE cooks SET status = ?1, payload_json = ?2 WHERE id = ?3",
                params![format!("{:?}", cook.status), serde_json::to_string(&cook).unwrap(), id.as_str()],
            )?;
            Ok(cook)
        })
    }

    async fn review_cook_piece(&self, id: &CookId, generation_id: &GenerationId, accept: bool) -> Result<Cook, StoreError> {
        let id = id.clone();
        let generation_id = generation_id.clone();
        self.with_conn(move |conn| {
            let mut cook: Cook = load_cook_blob(conn, id.as_str())?;
            cook.review(&generation_id, accept);
            conn.execute(
                "UPDATE cooks SET payload_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&cook).unwrap(), id.as_str()],
            )?;
            Ok(cook)
        })
    }

    async fn create_spell(&self, spell: Spell) -> Result<Spell, StoreError> {
        self.with_conn(move |conn| {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM spells WHERE slug = ?1",
                params![spell.slug],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Err(StoreError::Conflict(format!("spell slug {} exists", spell.slug)));
            }
            conn.execute(
                "INSERT INTO spells (slug, visibility, payload_json) VALUES (?1, ?2, ?3)",
                params![spell.slug, format!("{:?}", spell.visibility), serde_json::to_string(&spell).unwrap()],
            )?;
            Ok(spell)
        })
    }

    async fn find_spell_by_slug(&self, slug: &str) -> Result<Spell, StoreError> {
        let slug = slug.to_string();
        self.with_conn(move |conn| load_spell_blob(conn, &slug))
    }

    async fn list_spells_public(&self) -> Result<Vec<Spell>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload_json FROM spells WHERE visibility = 'Public'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|j| serde_json::from_str(&j).map_err(|e| StoreError::Unavailable(e.to_string())))
                .collect()
        })
    }

    async fn create_spell_cast(&self, cast: SpellCast) -> Result<SpellCast, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO spell_casts (id, payload_json) VALUES (?1, ?2)",
                params![cast.cast_id.as_str(), serde_json::to_string(&cast).unwrap()],
            )?;
            Ok(cast)
        })
    }

    async fn update_spell_cast(&self, cast: SpellCast) -> Result<SpellCast, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE spell_casts SET payload_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&cast).unwrap(), cast.cast_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("spell cast {}", cast.cast_id)));
            }
            Ok(cast)
        })
    }

    async fn find_spell_cast(&self, id: &SpellCastId) -> Result<SpellCast, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| load_cast_blob(conn, id.as_str()))
    }

    async fn list_loras(&self) -> Result<Vec<LoraModel>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload_json FROM lora_models")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|j| serde_json::from_str(&j).map_err(|e| StoreError::Unavailable(e.to_string())))
                .collect()
        })
    }

    async fn find_lora_by_slug(&self, slug: &str) -> Result<LoraModel, StoreError> {
        let slug = slug.to_string();
        self.with_conn(move |conn| load_lora_blob(conn, &slug))
    }

    async fn upsert_lora(&self, lora: LoraModel) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO lora_models (slug, payload_json) VALUES (?1, ?2)",
                params![lora.slug, serde_json::to_string(&lora).unwrap()],
            )?;
            Ok(())
        })
    }

    async fn grant_lora_permission(&self, permission: LoraPermission) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO lora_permissions (lora_slug, master_account_id) VALUES (?1, ?2)",
                params![permission.lora_slug, permission.master_account_id.as_str()],
            )?;
            Ok(())
        })
    }

    async fn has_lora_permission(&self, slug: &str, user_id: &MasterAccountId) -> Result<bool, StoreError> {
        let slug = slug.to_string();
        let user_id = user_id.clone();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM lora_permissions WHERE lora_slug = ?1 AND master_account_id = ?2",
                params![slug, user_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StoreError> {
        self.with_conn(move |conn| {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM api_keys WHERE key_prefix = ?1",
                params![key.key_prefix],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Err(StoreError::Conflict(format!("api key prefix {} exists", key.key_prefix)));
            }
            conn.execute(
                "INSERT INTO api_keys (key_prefix, payload_json) VALUES (?1, ?2)",
                params![key.key_prefix, serde_json::to_string(&key).unwrap()],
            )?;
            Ok(key)
        })
    }

    async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<ApiKey, StoreError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| load_key_blob(conn, &prefix))
    }

    async fn revoke_api_key(&self, prefix: &str) -> Result<(), StoreError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut key: ApiKey = load_key_blob(conn, &prefix)?;
            key.status = noema_model::ApiKeyStatus::Revoked;
            conn.execute(
                "UPDATE api_keys SET payload_json = ?1 WHERE key_prefix = ?2",
                params![serde_json::to_string(&key).unwrap(), prefix],
            )?;
            Ok(())
        })
    }

    async fn get_worker_control(&self, worker: &str) -> Result<WorkerControl, StoreError> {
        let worker = worker.to_string();
        self.with_conn(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload_json FROM worker_controls WHERE name = ?1",
                    params![worker],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match payload {
                Some(p) => serde_json::from_str(&p).expect("worker control payload is always valid json"),
                None => WorkerControl::default(),
            })
        })
    }

    async fn set_worker_control(&self, worker: &str, control: WorkerControl) -> Result<WorkerControl, StoreError> {
        let worker = worker.to_string();
        let payload = serde_json::to_string(&control).unwrap();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO worker_controls (name, payload_json) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET payload_json = excluded.payload_json",
                params![worker, payload],
            )?;
            Ok(())
        })?;
        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("noema.db")).unwrap();
        (store, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn find_or_create_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noema.db");
        let store1 = SqliteStore::new(&path).unwrap();
        let (user, created) = store1
            .find_or_create_by_platform(Platform::Telegram, "tg-42", NewUserHints::default())
            .await
            .unwrap();
        assert!(created);
        drop(store1);

        let store2 = SqliteStore::new(&path).unwrap();
        let (user2, created2) = store2
            .find_or_create_by_platform(Platform::Telegram, "tg-42", NewUserHints::default())
            .await
            .unwrap();
        assert!(!created2);
        assert_eq!(user.master_account_id, user2.master_account_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deposit_tx_hash_is_idempotent() {
        let (store, _dir) = temp_store();
        let make = || Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(MasterAccountId::parse("c".repeat(24)).unwrap()),
            origin: DepositOrigin::OnChainDeposit { deposit_tx_hash: "0xsame".into() },
            token_address: "0xusdc".into(),
            usd_value: Decimal::new(1000, 2),
            points_credited: 1000,
            points_remaining: 1000,
            funding_rate_applied: Decimal::ZERO,
            status: DepositStatus::Confirmed,
            created_at: Utc::now(),
        };
        let first = store.record_deposit_if_new(make()).await.unwrap();
        let second = store.record_deposit_if_new(make()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn active_deposits_sorted_by_funding_rate_then_age() {
        let (store, _dir) = temp_store();
        let owner = MasterAccountId::parse("d".repeat(24)).unwrap();
        let mk = |rate: i64, hash: &str| Deposit {
            id: DepositId::generate(),
            owner: DepositOwner::Account(owner.clone()),
            origin: DepositOrigin::OnChainDeposit { deposit_tx_hash: hash.to_string() },
            token_address: "0xusdc".into(),
            usd_value: Decimal::new(100, 2),
            points_credited: 100,
            points_remaining: 100,
            funding_rate_applied: Decimal::new(rate, 2),
            status: DepositStatus::Confirmed,
            created_at: Utc::now(),
        };
        store.record_deposit_if_new(mk(10, "0x1")).await.unwrap();
        store.record_deposit_if_new(mk(5, "0x2")).await.unwrap();
        let deposits = store.find_active_deposits_for_user(&owner).await.unwrap();
        assert_eq!(deposits[0].funding_rate_applied, Decimal::new(5, 2));
        assert_eq!(deposits[1].funding_rate_applied, Decimal::new(10, 2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn settle_generation_rolls_back_when_a_deduction_is_short() {
        let (store, _dir) = temp_store();
        let owner = MasterAccountId::parse("e".repeat(24)).unwrap();
        let deposit = store
            .record_deposit_if_new(Deposit {
                id: DepositId::generate(),
                owner: DepositOwner::Account(owner.clone()),
                origin: DepositOrigin::OnChainDeposit { deposit_tx_hash: "0xe".into() },
                token_address: "0xusdc".into(),
                usd_value: Decimal::new(100, 2),
                points_credited: 50,
                points_remaining: 50,
                funding_rate_applied: Decimal::ZERO,
                status: DepositStatus::Confirmed,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let generation = noema_model::GenerationRecord::new(
            GenerationId::generate(),
            owner,
            "comfyui",
            ToolId::new("tool-1"),
            "Flux",
            serde_json::json!({}),
            noema_model::NotificationPlatform::None,
        );
        let gen_id = generation.id.clone();
        store.create_generation(generation).await.unwrap();

        let result = store
            .settle_generation(&gen_id, vec![(deposit.id.clone(), 999)], GenerationPatch::default())
            .await;
        assert!(result.is_err());
        let after = store.find_active_deposits_for_user(&match &deposit.owner {
            DepositOwner::Account(id) => id.clone(),
            _ => unreachable!(),
        }).await.unwrap();
        assert_eq!(after[0].points_remaining, 50);
    }
}
