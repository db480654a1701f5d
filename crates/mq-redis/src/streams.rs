//! Redis Streams consumer-group support

use crate::{RedisClient, Result};
use redis::Value;
use std::collections::HashMap;

/// Entry in a Redis Stream (binary values)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntryBinary {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamEntryBinary {
    /// Field value decoded as UTF-8 (lossy)
    pub fn field_str(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    }
}

impl RedisClient {
    // ============================================================================
    // Stream Operations
    // ============================================================================

    /// XADD key MAXLEN ~ max_len * field value ...
    ///
    /// Returns the generated entry ID
    pub async fn xadd_binary(
        &mut self,
        stream_key: &str,
        max_len: usize,
        fields: &[(&str, &[u8])],
    ) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key)
            .arg("MAXLEN")
            .arg("~") // Approximate trimming
            .arg(max_len)
            .arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(*value);
        }
        cmd.query_async(self.connection_mut()).await
    }

    /// XGROUP CREATE key group start MKSTREAM
    ///
    /// Returns `false` when the group already existed (BUSYGROUP).
    pub async fn xgroup_create_mkstream(
        &mut self,
        stream_key: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool> {
        let result: Result<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(self.connection_mut())
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// XREADGROUP GROUP group consumer COUNT n [BLOCK ms] STREAMS key >
    ///
    /// Reads entries never delivered to any consumer of the group.
    pub async fn xreadgroup(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> Result<Vec<StreamEntryBinary>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block_ms) = block_ms {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(stream_key).arg(">");

        let reply: Value = cmd.query_async(self.connection_mut()).await?;
        Ok(parse_read_reply(&reply))
    }

    /// XAUTOCLAIM key group consumer min-idle start COUNT n
    ///
    /// Transfers pending entries idle for at least `min_idle_ms` to `consumer`.
    /// Returns the cursor for the next call and the claimed entries.
    pub async fn xautoclaim(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start_id: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntryBinary>)> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream_key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start_id)
            .arg("COUNT")
            .arg(count)
            .query_async(self.connection_mut())
            .await?;

        let Value::Array(parts) = reply else {
            return Ok(("0-0".to_string(), Vec::new()));
        };

        let cursor = parts
            .first()
            .and_then(value_to_string)
            .unwrap_or_else(|| "0-0".to_string());
        let entries = parts.get(1).map(parse_entries).unwrap_or_default();

        Ok((cursor, entries))
    }

    /// XPENDING key group id id 1
    ///
    /// Number of times the entry has been delivered, `None` if it is not pending.
    pub async fn xpending_times_delivered(
        &mut self,
        stream_key: &str,
        group: &str,
        id: &str,
    ) -> Result<Option<u64>> {
        let reply: Value = redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(self.connection_mut())
            .await?;

        // [[id, consumer, idle-ms, times-delivered]]
        let Value::Array(rows) = reply else {
            return Ok(None);
        };
        let times = rows.first().and_then(|row| match row {
            Value::Array(fields) => fields.get(3).and_then(value_to_u64),
            _ => None,
        });
        Ok(times)
    }

    /// XACK - Acknowledge stream entries
    pub async fn xack(&mut self, stream_key: &str, group: &str, ids: &[&str]) -> Result<i64> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream_key).arg(group);
        for id in ids {
            cmd.arg(*id);
        }
        cmd.query_async(self.connection_mut()).await
    }

    /// XLEN - Get stream length
    pub async fn xlen(&mut self, stream_key: &str) -> Result<i64> {
        redis::cmd("XLEN")
            .arg(stream_key)
            .query_async(self.connection_mut())
            .await
    }
}

// ============================================================================
// Reply parsing
// ============================================================================
//
// Replies are parsed from raw `Value`s so both RESP2 (arrays) and RESP3
// (maps) connections work.

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    value_to_bytes(value).map(|bytes| String::from_utf8_lossy(&bytes).to_string())
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Int(i) => u64::try_from(*i).ok(),
        other => value_to_string(other).and_then(|s| s.parse().ok()),
    }
}

/// [id, [field, value, field, value, ...]]
fn parse_entry(value: &Value) -> Option<StreamEntryBinary> {
    let Value::Array(parts) = value else {
        return None;
    };
    let id = parts.first().and_then(value_to_string)?;

    let mut fields = HashMap::new();
    match parts.get(1) {
        Some(Value::Array(flat)) => {
            for pair in flat.chunks(2) {
                if let [name, value] = pair {
                    if let (Some(name), Some(value)) = (value_to_string(name), value_to_bytes(value))
                    {
                        fields.insert(name, value);
                    }
                }
            }
        }
        Some(Value::Map(pairs)) => {
            for (name, value) in pairs {
                if let (Some(name), Some(value)) = (value_to_string(name), value_to_bytes(value)) {
                    fields.insert(name, value);
                }
            }
        }
        // Entry deleted while pending (XAUTOCLAIM on Redis 6.2 reports nil fields)
        _ => return None,
    }

    Some(StreamEntryBinary { id, fields })
}

fn parse_entries(value: &Value) -> Vec<StreamEntryBinary> {
    match value {
        Value::Array(items) => items.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// XREADGROUP reply: [[key, entries], ...] (RESP2) or {key: entries} (RESP3)
fn parse_read_reply(value: &Value) -> Vec<StreamEntryBinary> {
    match value {
        Value::Array(streams) => streams
            .iter()
            .flat_map(|stream| match stream {
                Value::Array(parts) => parts.get(1).map(parse_entries).unwrap_or_default(),
                _ => Vec::new(),
            })
            .collect(),
        Value::Map(streams) => streams
            .iter()
            .flat_map(|(_, entries)| parse_entries(entries))
            .collect(),
        _ => Vec::new(),
    }
}
