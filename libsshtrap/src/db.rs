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

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::{error, info};

use crate::ssh::Session;

/// The captured-session store. Every finished session is written in a
/// single transaction; a failed transaction loses that session (there is
/// no retry queue).
pub struct Db {
    client: Mutex<tokio_postgres::Client>,
}

impl Db {
    /// Connect at startup. Failure here is fatal for the process: a
    /// honeypot that cannot record anything has no reason to accept
    /// connections.
    pub async fn connect(dsn: &str) -> anyhow::Result<Db> {
        info!("connecting to database");
        let (client, connection) =
            tokio_postgres::connect(dsn, NoTls).await.context("connecting to postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("database connection error: {err:#}");
            }
        });
        Ok(Db { client: Mutex::new(client) })
    }

    /// Persist one finished session atomically: the source IP upsert, the
    /// session row, then every channel and request in capture order.
    pub async fn record_session(&self, session: &Session) -> anyhow::Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.context("beginning transaction")?;
        session.insert(&tx).await?;
        tx.commit().await.context("committing session")
    }
}
