// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The caching TCP server in front of the storage engine.
//!
//! One handler task per connection, a background task that flushes
//! modified records every sync interval, and one async mutex per loaded
//! database covering its cache maps and every engine call made on its
//! behalf. Requests on a connection are answered in order; errors are
//! reported in the response envelope and leave the connection open.

pub mod protocol;
mod state;

pub use state::LoadMode;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::db::Record;
use crate::value::json::to_json;
use crate::{Error, MarDb};
use protocol::{Request, Response};
use state::ActiveDb;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sync_interval: Duration,
    pub load_mode: LoadMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            sync_interval: Duration::from_secs(30),
            load_mode: LoadMode::Fast,
        }
    }
}

type DbHandle = Arc<Mutex<ActiveDb>>;

struct ServerState {
    cfg: ServerConfig,
    dbs: RwLock<HashMap<String, DbHandle>>,
}

/// A bound, not-yet-running server.
pub struct DbServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl DbServer {
    pub async fn bind(cfg: ServerConfig) -> Result<Self, Error> {
        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                cfg,
                dbs: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Loads databases named on the command line before serving.
    pub async fn preload(&self, db_names: &[String]) {
        for name in db_names {
            if let Err(e) = self.state.load_db(name, self.state.cfg.load_mode).await {
                warn!("failed to preload database {name}: {e}");
            }
        }
    }

    /// Serves until `ctrl_c`, then flushes everything once more.
    pub async fn run(self) -> Result<(), Error> {
        let state = Arc::clone(&self.state);
        let flusher = tokio::spawn(flush_loop(Arc::clone(&state)));
        info!(
            "serving on {} (sync interval {:?}, load mode {:?})",
            self.listener.local_addr()?,
            state.cfg.sync_interval,
            state.cfg.load_mode
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("connection from {peer}");
                    tokio::spawn(handle_client(Arc::clone(&state), stream, peer));
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        flusher.abort();
        state.flush_all().await;
        Ok(())
    }
}

async fn flush_loop(state: Arc<ServerState>) {
    let mut tick = tokio::time::interval(state.cfg.sync_interval);
    tick.tick().await; // the first tick is immediate
    loop {
        tick.tick().await;
        state.flush_all().await;
    }
}

async fn handle_client(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("bad frame from {peer}: {e}");
                break;
            }
        };
        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => {
                debug!("{peer} -> {}", request.command);
                state.process(request).await
            }
            Err(e) => Response::error(Error::Protocol(format!("invalid request: {e}"))),
        };
        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialize response: {e}");
                break;
            }
        };
        if let Err(e) = protocol::write_frame(&mut writer, &body).await {
            warn!("failed to reply to {peer}: {e}");
            break;
        }
    }
    debug!("connection closed: {peer}");
}

impl ServerState {
    async fn process(&self, request: Request) -> Response {
        match self.dispatch(&request).await {
            Ok(data) => Response::success(data),
            Err(e) => {
                error!("command {} failed: {e}", request.command);
                Response::error(e)
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<Option<JsonValue>, Error> {
        let args = &request.args;
        let db_name = protocol::str_arg(args, "db_name")?;
        match request.command.as_str() {
            "create_database" => {
                MarDb::create(db_name)?;
                // replace any stale state from a previous incarnation
                self.dbs.write().await.remove(db_name);
                self.load_db(db_name, self.cfg.load_mode).await?;
                info!("created database {db_name}");
                Ok(None)
            }
            "create_table" => {
                let table = protocol::str_arg(args, "table_name")?;
                let axes = protocol::axes_arg(args)?;
                let handle = self.db(db_name).await?;
                let mut db = handle.lock().await;
                db.engine.create_table(table, &axes)?;
                db.refresh_metadata()?;
                info!("created table {table} in {db_name}");
                Ok(None)
            }
            "get_tables" => {
                let handle = self.db(db_name).await?;
                let db = handle.lock().await;
                let tables: serde_json::Map<String, JsonValue> = db
                    .tables
                    .values()
                    .map(|t| {
                        (
                            t.id.to_string(),
                            json!({ "name": t.name, "axes": t.axes }),
                        )
                    })
                    .collect();
                Ok(Some(JsonValue::Object(tables)))
            }
            "get_table_files" => {
                let handle = self.db(db_name).await?;
                let db = handle.lock().await;
                let files = match protocol::opt_str_arg(args, "table_name") {
                    Some(table) => db.engine.table_files(Some(table))?,
                    None => db.files.clone(),
                };
                let files: serde_json::Map<String, JsonValue> = files
                    .into_iter()
                    .map(|(id, names)| (id.to_string(), json!(names)))
                    .collect();
                Ok(Some(JsonValue::Object(files)))
            }
            "find_in_table" => {
                let table = protocol::str_arg(args, "table_name")?;
                let cords = protocol::cords_arg(args)?;
                let handle = self.db(db_name).await?;
                let mut db = handle.lock().await;
                db.check_arity(table, &cords)?;
                Ok(Some(match db.find(table, &cords)? {
                    Some(record) => record_json(&record),
                    None => JsonValue::Null,
                }))
            }
            "insert_into_table" => {
                let table = protocol::str_arg(args, "table_name")?;
                let cords = protocol::cords_arg(args)?;
                let value = protocol::value_arg(args)?;
                let handle = self.db(db_name).await?;
                let mut db = handle.lock().await;
                db.check_arity(table, &cords)?;
                db.insert(table, cords, value);
                Ok(Some(JsonValue::Bool(true)))
            }
            "select_from_table" => {
                let table = protocol::str_arg(args, "table_name")?;
                let handle = self.db(db_name).await?;
                let mut db = handle.lock().await;
                let records = db.select(table)?;
                Ok(Some(JsonValue::Array(
                    records.iter().map(record_json).collect(),
                )))
            }
            "defragment_database" => {
                let handle = self.db(db_name).await?;
                let db = handle.lock().await;
                db.engine.defragment()?;
                info!("defragmented {db_name}");
                Ok(None)
            }
            "load_database" => {
                let mode = match protocol::opt_str_arg(args, "mode") {
                    Some(mode) => mode.parse()?,
                    None => self.cfg.load_mode,
                };
                if let Some(handle) = self.dbs.read().await.get(db_name).cloned() {
                    let mut db = handle.lock().await;
                    db.mode = mode;
                    db.refresh_metadata()?;
                    db.preload()?;
                } else {
                    self.load_db(db_name, mode).await?;
                }
                Ok(None)
            }
            "unload_database" => {
                let Some(handle) = self.dbs.write().await.remove(db_name) else {
                    return Err(Error::NotFound(format!("database not loaded: {db_name}")));
                };
                flush_db(db_name, &handle).await;
                let loaded_at = handle.lock().await.loaded_at;
                info!("unloaded database {db_name} (loaded at {loaded_at})");
                Ok(None)
            }
            other => Err(Error::Protocol(format!("unknown command: {other}"))),
        }
    }

    /// Returns the loaded database, loading it on first touch the way
    /// the console clients expect.
    async fn db(&self, db_name: &str) -> Result<DbHandle, Error> {
        if let Some(handle) = self.dbs.read().await.get(db_name) {
            return Ok(Arc::clone(handle));
        }
        self.load_db(db_name, self.cfg.load_mode).await
    }

    async fn load_db(&self, db_name: &str, mode: LoadMode) -> Result<DbHandle, Error> {
        let mut dbs = self.dbs.write().await;
        if let Some(handle) = dbs.get(db_name) {
            return Ok(Arc::clone(handle));
        }
        let db = ActiveDb::load(db_name, mode)?;
        let handle = Arc::new(Mutex::new(db));
        dbs.insert(db_name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    async fn flush_all(&self) {
        let handles: Vec<(String, DbHandle)> = {
            let dbs = self.dbs.read().await;
            dbs.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };
        for (name, handle) in handles {
            flush_db(&name, &handle).await;
        }
    }
}

/// Flushes one database: snapshot under the lock, write outside it,
/// then un-mark exactly what reached disk. Records that fail stay
/// modified for the next cycle.
async fn flush_db(db_name: &str, handle: &DbHandle) {
    let (engine, dirty) = {
        let db = handle.lock().await;
        if !db.has_dirty() {
            return;
        }
        (db.engine.clone(), db.take_dirty())
    };
    debug!("flushing {} records to {db_name}", dirty.len());
    let mut flushed = Vec::with_capacity(dirty.len());
    for (table, cords, value) in dirty {
        match engine.insert(&table, &cords, &value) {
            Ok(true) => flushed.push((table, cords)),
            Ok(false) => warn!("no data file accepted {cords:?} in {db_name}/{table}"),
            Err(e) => error!("failed to flush {cords:?} to {db_name}/{table}: {e}"),
        }
    }
    let count = flushed.len();
    handle.lock().await.clear_flushed(&flushed);
    if count > 0 {
        debug!("flushed {count} records to {db_name}");
    }
}

fn record_json(record: &Record) -> JsonValue {
    json!({
        "cords": record.cords,
        "type": record.value.type_name(),
        "value": to_json(&record.value),
    })
}
