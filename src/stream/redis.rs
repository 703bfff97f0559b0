//! Redis Streams backend.
//!
//! One Redis stream per room. Appends go through a shared multiplexed
//! connection; blocking reads would stall every other command on it, so
//! each stream's consumer gets a dedicated connection.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;

use super::{EntryId, StreamError, StreamLog, StreamRecord};

/// Stream log over Redis Streams.
pub struct RedisStreamLog {
    client: redis::Client,
    shared: ConnectionManager,
    read_conns: DashMap<String, ConnectionManager>,
}

impl RedisStreamLog {
    /// Connect to the stream backend.
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url).map_err(to_unavailable)?;
        let shared = ConnectionManager::new(client.clone())
            .await
            .map_err(to_unavailable)?;
        Ok(Self {
            client,
            shared,
            read_conns: DashMap::new(),
        })
    }

    async fn read_conn(&self, stream: &str) -> Result<ConnectionManager, StreamError> {
        if let Some(conn) = self.read_conns.get(stream) {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(to_unavailable)?;
        self.read_conns.insert(stream.to_string(), conn.clone());
        Ok(conn)
    }

    fn convert_reply(reply: StreamRangeReply) -> Result<Vec<(EntryId, StreamRecord)>, StreamError> {
        reply
            .ids
            .into_iter()
            .map(|entry| {
                let id: EntryId = entry.id.parse()?;
                let fields = entry
                    .map
                    .into_iter()
                    .map(|(k, v)| (k, value_bytes(v)))
                    .collect::<Vec<_>>();
                Ok((id, StreamRecord::from_fields(&fields)?))
            })
            .collect()
    }
}

fn to_unavailable(err: redis::RedisError) -> StreamError {
    StreamError::Unavailable(err.to_string())
}

fn value_bytes(value: redis::Value) -> Vec<u8> {
    match value {
        redis::Value::Data(bytes) => bytes,
        redis::Value::Status(s) => s.into_bytes(),
        redis::Value::Int(i) => i.to_string().into_bytes(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn append(
        &self,
        stream: &str,
        record: &StreamRecord,
        max_len: usize,
    ) -> Result<EntryId, StreamError> {
        let mut conn = self.shared.clone();
        let fields = record.to_fields();
        let id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", &fields)
            .await
            .map_err(to_unavailable)?;
        id.parse()
    }

    async fn read_blocking(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<(EntryId, StreamRecord)>, StreamError> {
        let mut conn = self.read_conn(stream).await?;
        let opts = StreamReadOptions::default()
            .count(max_count)
            .block(timeout.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[from.to_string()], &opts)
            .await
            .map_err(to_unavailable)?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let id: EntryId = entry.id.parse()?;
                let fields = entry
                    .map
                    .into_iter()
                    .map(|(k, v)| (k, value_bytes(v)))
                    .collect::<Vec<_>>();
                out.push((id, StreamRecord::from_fields(&fields)?));
            }
        }
        Ok(out)
    }

    async fn range(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
    ) -> Result<Vec<(EntryId, StreamRecord)>, StreamError> {
        let mut conn = self.shared.clone();
        // "(" makes the lower bound exclusive.
        let reply: StreamRangeReply = conn
            .xrange_count(stream, format!("({from}"), "+", max_count)
            .await
            .map_err(to_unavailable)?;
        Self::convert_reply(reply)
    }

    async fn head_id(&self, stream: &str) -> Result<EntryId, StreamError> {
        let mut conn = self.shared.clone();
        let reply: StreamRangeReply = conn
            .xrevrange_count(stream, "+", "-", 1)
            .await
            .map_err(to_unavailable)?;
        match reply.ids.first() {
            Some(entry) => entry.id.parse(),
            None => Ok(EntryId::ZERO),
        }
    }

    async fn oldest_id(&self, stream: &str) -> Result<Option<EntryId>, StreamError> {
        let mut conn = self.shared.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, "-", "+", 1)
            .await
            .map_err(to_unavailable)?;
        reply.ids.first().map(|entry| entry.id.parse()).transpose()
    }

    async fn trim_before(&self, stream: &str, min: EntryId) -> Result<(), StreamError> {
        let mut conn = self.shared.clone();
        redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg("~")
            .arg(min.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(to_unavailable)
    }

    async fn ping(&self) -> Result<(), StreamError> {
        let mut conn = self.shared.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(to_unavailable)
    }
}
