// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio_postgres::Transaction;
use tracing::info;

use super::channel::ChannelRecord;

/// One terminated attacker connection: endpoints, lifespan, the script(1)
/// dump pulled from the backend container, and every channel the attacker
/// opened. The owning connection task is the only writer; channels are
/// value-owned children and never point back at the session.
#[derive(Debug, Clone)]
pub struct Session {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    version: String,
    src_ip: String,
    src_port: i32,
    dst_ip: String,
    dst_port: i32,
    stdout: String,
    timing: String,
    channels: Vec<Arc<ChannelRecord>>,
}

impl Session {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Session {
            start: Utc::now(),
            end: None,
            version: String::new(),
            src_ip: src.ip().to_string(),
            src_port: src.port() as i32,
            dst_ip: dst.ip().to_string(),
            dst_port: dst.port() as i32,
            stdout: String::new(),
            timing: String::new(),
            channels: Vec::new(),
        }
    }

    pub fn set_version(&mut self, version: String) {
        self.version = version;
    }

    pub fn add_channel(&mut self, channel: Arc<ChannelRecord>) {
        self.channels.push(channel);
    }

    pub fn channels(&self) -> Vec<Arc<ChannelRecord>> {
        self.channels.clone()
    }

    pub fn add_script_output(&mut self, stdout: String, timing: String) {
        self.stdout = stdout;
        self.timing = timing;
    }

    /// Mark the session over: stamp its end and the end of any channel
    /// that was still open when the attacker went away.
    pub fn stop(&mut self) {
        info!(src = %self.src_ip, "disconnected");
        if self.end.is_none() {
            self.end = Some(Utc::now());
        }
        for channel in &self.channels {
            channel.finish();
        }
    }

    /// Write the whole session inside the caller's transaction: the
    /// source IP upsert, the session row, then every channel (and its
    /// requests) in the order the attacker opened them. The fresh
    /// session id is threaded through the chain explicitly.
    pub async fn insert(&self, tx: &Transaction<'_>) -> anyhow::Result<()> {
        tx.execute(
            "INSERT INTO IP(ip_address) VALUES ($1) ON CONFLICT (ip_address) DO NOTHING",
            &[&self.src_ip],
        )
        .await
        .context("upserting source ip")?;

        let end = self.end.unwrap_or(self.start);
        let row = tx
            .query_one(
                "INSERT INTO Session(version, src_ip, src_port, dst_ip, dst_port, start_ts, end_ts, stdout, timing) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 RETURNING id",
                &[
                    &self.version,
                    &self.src_ip,
                    &self.src_port,
                    &self.dst_ip,
                    &self.dst_port,
                    &self.start,
                    &end,
                    &self.stdout,
                    &self.timing,
                ],
            )
            .await
            .context("inserting session")?;
        let session_id: i32 = row.get(0);

        for channel in &self.channels {
            channel.insert(tx, session_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn endpoints_are_split() {
        let session = Session::new(addr("203.0.113.7:54321"), addr("10.0.0.1:2222"));
        assert_eq!(session.src_ip, "203.0.113.7");
        assert_eq!(session.src_port, 54321);
        assert_eq!(session.dst_ip, "10.0.0.1");
        assert_eq!(session.dst_port, 2222);
    }

    #[test]
    fn stop_stamps_session_and_channels() {
        let mut session = Session::new(addr("203.0.113.7:54321"), addr("10.0.0.1:2222"));
        let channel = Arc::new(ChannelRecord::new(1, "session"));
        session.add_channel(Arc::clone(&channel));

        session.stop();
        let end = session.end.expect("end set");
        assert!(end >= session.start);

        // the still-open channel was finished along with the session
        let channel_end = channel.end().expect("channel end set");
        assert!(channel_end >= end);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut session = Session::new(addr("198.51.100.2:1022"), addr("10.0.0.1:2222"));
        session.stop();
        let first = session.end;
        session.stop();
        assert_eq!(first, session.end);
    }
}
