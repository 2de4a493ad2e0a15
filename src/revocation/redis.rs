use std::str::FromStr;
use std::sync::LazyLock;

use ::redis::{AsyncCommands, Script, aio::ConnectionManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{CrlDelta, MergeOutcome, RevocationStore, StoreError, StoreResult};
use crate::model::{
    AuthorityStatus, CertificateAuthority, CrlNumber, IssuerHashes, RevokedCertificate,
    SerialNumber,
};

const KEY_PREFIX: &str = "ts";
const ROW_SEPARATOR: char = '|';

// KEYS: ca, revoked. ARGV: padded crl, this_update, next_update, then serial/date pairs.
// Returns {status, inserted, pruned, highest stored crl}.
static MERGE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('HEXISTS', KEYS[1], 'record') == 0 then
  return {-2, 0, 0, ''}
end
local current = redis.call('HGET', KEYS[1], 'max_crl')
if current and current >= ARGV[1] then
  return {-1, 0, 0, current}
end
local inserted = 0
for i = 4, #ARGV, 2 do
  inserted = inserted + redis.call('HSET', KEYS[2], ARGV[i], ARGV[1] .. '|' .. ARGV[i + 1])
end
local pruned = 0
local rows = redis.call('HGETALL', KEYS[2])
for i = 1, #rows, 2 do
  if string.sub(rows[i + 1], 1, #ARGV[1]) < ARGV[1] then
    pruned = pruned + redis.call('HDEL', KEYS[2], rows[i])
  end
end
redis.call('HSET', KEYS[1], 'crl_number', ARGV[1], 'max_crl', ARGV[1], 'status', 'active',
  'this_update', ARGV[2], 'next_update', ARGV[3])
return {0, inserted, pruned, ARGV[1]}
"#,
    )
});

// KEYS: revoked. ARGV: padded crl.
static PRUNE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local pruned = 0
local rows = redis.call('HGETALL', KEYS[1])
for i = 1, #rows, 2 do
  if string.sub(rows[i + 1], 1, #ARGV[1]) < ARGV[1] then
    pruned = pruned + redis.call('HDEL', KEYS[1], rows[i])
  end
end
return pruned
"#,
    )
});

// KEYS: ca, revoked. ARGV: serial, padded crl, date.
// Returns {reason, blocking value} when the row is refused.
static ADD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], 'max_crl')
if current and current > ARGV[2] then
  return {'stale', current}
end
local existing = redis.call('HGET', KEYS[2], ARGV[1])
if existing and string.sub(existing, 1, #ARGV[2]) >= ARGV[2] then
  return {'duplicate', existing}
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2] .. '|' .. ARGV[3])
if not current or current < ARGV[2] then
  redis.call('HSET', KEYS[1], 'max_crl', ARGV[2])
end
return false
"#,
    )
});

// KEYS: ca. ARGV: status. Returns 0 for unknown authorities.
static STATUS_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('HEXISTS', KEYS[1], 'record') == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
return 1
"#,
    )
});

fn authority_key(issuer: &str) -> String {
    format!("{KEY_PREFIX}:ca:{issuer}")
}

fn revoked_key(issuer: &str) -> String {
    format!("{KEY_PREFIX}:revoked:{issuer}")
}

fn index_key() -> String {
    format!("{KEY_PREFIX}:ca-index")
}

fn names_key() -> String {
    format!("{KEY_PREFIX}:ca-names")
}

fn status_field(status: AuthorityStatus) -> StoreResult<String> {
    match serde_json::to_value(status)? {
        serde_json::Value::String(value) => Ok(value),
        other => Err(StoreError::Corrupted(format!("unexpected status encoding {other}"))),
    }
}

fn parse_status(value: &str) -> StoreResult<AuthorityStatus> {
    Ok(serde_json::from_value(serde_json::Value::String(
        value.to_string(),
    ))?)
}

fn parse_time(value: Option<&String>) -> StoreResult<Option<DateTime<Utc>>> {
    match value.map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|time| Some(time.with_timezone(&Utc)))
            .map_err(|e| StoreError::Corrupted(format!("invalid timestamp {raw:?}: {e}"))),
    }
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value.map(|time| time.to_rfc3339()).unwrap_or_default()
}

/// Splits a stored `"{padded crl}|{rfc3339}"` row.
fn parse_row(value: &str) -> StoreResult<(CrlNumber, DateTime<Utc>)> {
    let (crl_number, date) = value
        .split_once(ROW_SEPARATOR)
        .ok_or_else(|| StoreError::Corrupted(format!("malformed revocation row {value:?}")))?;
    let crl_number = CrlNumber::from_str(crl_number).map_err(StoreError::Corrupted)?;
    let date = DateTime::parse_from_rfc3339(date)
        .map_err(|e| StoreError::Corrupted(format!("invalid revocation date {date:?}: {e}")))?
        .with_timezone(&Utc);
    Ok((crl_number, date))
}

/// A Redis revocation store.
///
/// Per issuer it keeps the authority hash `ts:ca:{issuer}` and the revoked
/// rows hash `ts:revoked:{issuer}`, mapping serial to CRL number and date.
/// The authority hash also tracks `max_crl`, the highest CRL number stored
/// by a merge or a manual insert.
/// CRL numbers are stored zero padded so the scripts can compare them as
/// strings.
#[derive(Clone)]
pub struct RedisRevocationStore {
    conn: ConnectionManager,
}

impl RedisRevocationStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connects to `url` and wraps the connection in a manager.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn register_authority(&self, authority: CertificateAuthority) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = authority_key(&authority.name);
        let record = serde_json::to_string(&authority)?;

        let previous: Option<String> = conn.hget(&key, "record").await?;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        if let Some(previous) = previous {
            let previous: CertificateAuthority = serde_json::from_str(&previous)?;
            if previous.hashes != authority.hashes {
                pipe.hdel(index_key(), previous.hashes.to_hex()).ignore();
            }
        }
        pipe.hset(&key, "record", record)
            .ignore()
            .hset_nx(&key, "status", status_field(authority.status)?)
            .ignore()
            .sadd(names_key(), &authority.name)
            .ignore()
            .hset(index_key(), authority.hashes.to_hex(), &authority.name)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(issuer = %authority.name, hashes = %authority.hashes, "registered authority");
        Ok(())
    }

    async fn authority(&self, issuer: &str) -> StoreResult<Option<CertificateAuthority>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(authority_key(issuer)).await?;
        let Some(record) = fields.get("record") else {
            return Ok(None);
        };

        let mut authority: CertificateAuthority = serde_json::from_str(record)?;
        if let Some(status) = fields.get("status") {
            authority.status = parse_status(status)?;
        }
        if let Some(crl_number) = fields.get("crl_number") {
            authority.last_crl_number =
                Some(CrlNumber::from_str(crl_number).map_err(StoreError::Corrupted)?);
        }
        authority.this_update = parse_time(fields.get("this_update"))?;
        authority.next_update = parse_time(fields.get("next_update"))?;
        Ok(Some(authority))
    }

    async fn authorities(&self) -> StoreResult<Vec<CertificateAuthority>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(names_key()).await?;
        names.sort();

        let mut authorities = Vec::with_capacity(names.len());
        for name in names {
            if let Some(authority) = self.authority(&name).await? {
                authorities.push(authority);
            }
        }
        Ok(authorities)
    }

    async fn set_status(&self, issuer: &str, status: AuthorityStatus) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let updated: i64 = STATUS_SCRIPT
            .prepare_invoke()
            .key(authority_key(issuer))
            .arg(status_field(status)?)
            .invoke_async(&mut conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::UnknownIssuer(issuer.to_string()));
        }
        Ok(())
    }

    async fn resolve_issuer(&self, hashes: &IssuerHashes) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(index_key(), hashes.to_hex()).await?)
    }

    async fn remove_authority(&self, issuer: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let key = authority_key(issuer);

        let record: Option<String> = conn.hget(&key, "record").await?;
        let mut pipe = ::redis::pipe();
        pipe.atomic().hlen(revoked_key(issuer));
        if let Some(record) = record {
            let authority: CertificateAuthority = serde_json::from_str(&record)?;
            pipe.hdel(index_key(), authority.hashes.to_hex()).ignore();
        }
        pipe.del(revoked_key(issuer))
            .ignore()
            .del(&key)
            .ignore()
            .srem(names_key(), issuer)
            .ignore();

        let (purged,): (usize,) = pipe.query_async(&mut conn).await?;
        debug!(issuer, purged, "removed authority");
        Ok(purged)
    }

    async fn add_revoked(&self, revoked: RevokedCertificate) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let refused: Option<(String, String)> = ADD_SCRIPT
            .prepare_invoke()
            .key(authority_key(&revoked.issuer))
            .key(revoked_key(&revoked.issuer))
            .arg(revoked.serial_number.to_string())
            .arg(revoked.crl_number.to_padded())
            .arg(revoked.revocation_date.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        match refused {
            None => Ok(()),
            Some((reason, current)) if reason == "stale" => Err(StoreError::StaleEntry {
                issuer: revoked.issuer,
                serial: revoked.serial_number,
                current: CrlNumber::from_str(&current).map_err(StoreError::Corrupted)?,
            }),
            Some((_, row)) => {
                let (crl_number, _) = parse_row(&row)?;
                Err(StoreError::DuplicateEntry {
                    issuer: revoked.issuer,
                    serial: revoked.serial_number,
                    crl_number,
                })
            }
        }
    }

    async fn merge_delta(&self, delta: CrlDelta) -> StoreResult<MergeOutcome> {
        let mut conn = self.conn.clone();
        let mut invocation = MERGE_SCRIPT.prepare_invoke();
        invocation
            .key(authority_key(&delta.issuer))
            .key(revoked_key(&delta.issuer))
            .arg(delta.crl_number.to_padded())
            .arg(format_time(delta.this_update))
            .arg(format_time(delta.next_update));
        for entry in &delta.entries {
            invocation
                .arg(entry.serial_number.to_string())
                .arg(entry.revocation_date.to_rfc3339());
        }

        let (status, inserted, pruned, current): (i64, usize, usize, String) =
            invocation.invoke_async(&mut conn).await?;
        match status {
            -2 => Err(StoreError::UnknownIssuer(delta.issuer)),
            -1 => Ok(MergeOutcome::Stale {
                current: CrlNumber::from_str(&current).map_err(StoreError::Corrupted)?,
            }),
            _ => Ok(MergeOutcome::Applied { inserted, pruned }),
        }
    }

    async fn count_revoked(&self, issuer: &str, crl_number: &CrlNumber) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let rows: Vec<String> = conn.hvals(revoked_key(issuer)).await?;
        let padded = crl_number.to_padded();
        Ok(rows
            .iter()
            .filter(|row| {
                row.split_once(ROW_SEPARATOR)
                    .is_some_and(|(crl, _)| crl == padded)
            })
            .count())
    }

    async fn find_revoked(
        &self,
        issuer: &str,
        serial: &SerialNumber,
    ) -> StoreResult<Option<RevokedCertificate>> {
        let mut conn = self.conn.clone();
        let row: Option<String> = conn.hget(revoked_key(issuer), serial.to_string()).await?;
        row.map(|row| {
            let (crl_number, revocation_date) = parse_row(&row)?;
            Ok(RevokedCertificate {
                issuer: issuer.to_string(),
                serial_number: serial.clone(),
                revocation_date,
                crl_number,
            })
        })
        .transpose()
    }

    async fn prune_older_than(&self, issuer: &str, crl_number: &CrlNumber) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let pruned = PRUNE_SCRIPT
            .prepare_invoke()
            .key(revoked_key(issuer))
            .arg(crl_number.to_padded())
            .invoke_async(&mut conn)
            .await?;
        Ok(pruned)
    }
}
