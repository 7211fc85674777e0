//! The datastore task: owns serialized access to zone data for the query
//! path, and soaks up query-log rows without ever back-pressuring the
//! pipeline (the channel is the bounded queue; writers drop on overflow).

use crate::authority;
use crate::db;
use crate::db::querylog::QueryLogRow;
use crate::error::HoldfastError;
use crate::reply::Reply;
use crate::zones::FileZone;
use crate::Question;
use log::{debug, error};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};

type Responder<T> = oneshot::Sender<T>;

/// Queued query-log rows before writers start dropping.
pub const LOG_QUEUE_DEPTH: usize = 4096;

#[derive(Debug)]
pub enum Command {
    /// Which zone, if any, covers this name?
    FindZone {
        name: String,
        resp: Responder<Option<FileZone>>,
    },
    /// Build the authoritative answer for a question we cover.
    Answer {
        zone: FileZone,
        question: Question,
        query_id: u16,
        recursion_available: bool,
        now: i64,
        resp: Responder<Result<Reply, HoldfastError>>,
    },
    /// AXFR/IXFR frames for a zone transfer.
    Transfer {
        zone: FileZone,
        question: Question,
        query_id: u16,
        client_serial: Option<u32>,
        resp: Responder<Result<Vec<Reply>, HoldfastError>>,
    },
    /// Fire-and-forget query logging.
    LogQuery(Box<QueryLogRow>),
    /// A full zone with records, for export tooling.
    ExportZone {
        name: String,
        resp: Responder<Option<FileZone>>,
    },
    Shutdown,
}

/// Manages the datastore, waits for commands from the server instances and
/// responds with data.
pub async fn manager(
    mut rx: mpsc::Receiver<Command>,
    pool: SqlitePool,
) -> Result<(), HoldfastError> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::FindZone { name, resp } => {
                let result = db::zone::find_zone_for_domain(&pool, &name)
                    .await
                    .unwrap_or_else(|err| {
                        error!("zone lookup for {name} failed: {err}");
                        None
                    });
                if resp.send(result).is_err() {
                    debug!("findzone requester went away");
                }
            }
            Command::Answer {
                zone,
                question,
                query_id,
                recursion_available,
                now,
                resp,
            } => {
                let result = authority::answer_query(
                    &pool,
                    &zone,
                    &question,
                    query_id,
                    recursion_available,
                    now,
                )
                .await;
                if resp.send(result).is_err() {
                    debug!("answer requester went away");
                }
            }
            Command::Transfer {
                zone,
                question,
                query_id,
                client_serial,
                resp,
            } => {
                let result = match question.qtype {
                    crate::enums::RecordType::IXFR => {
                        authority::ixfr_stream(&pool, &zone, &question, query_id, client_serial)
                            .await
                    }
                    _ => authority::axfr_stream(&pool, &zone, &question, query_id).await,
                };
                if resp.send(result).is_err() {
                    debug!("transfer requester went away");
                }
            }
            Command::LogQuery(row) => {
                if let Err(err) = db::querylog::insert(&pool, &row).await {
                    error!("failed to write query log row: {err}");
                }
            }
            Command::ExportZone { name, resp } => {
                let result = match db::zone::get_zone_by_name(&pool, &name).await {
                    Ok(Some(mut zone)) => {
                        if let Some(id) = zone.id {
                            zone.records = db::zone::get_records_by_zone(&pool, id)
                                .await
                                .unwrap_or_default();
                        }
                        Some(zone)
                    }
                    Ok(None) => None,
                    Err(err) => {
                        error!("zone export lookup for {name} failed: {err}");
                        None
                    }
                };
                if resp.send(result).is_err() {
                    debug!("export requester went away");
                }
            }
            Command::Shutdown => {
                debug!("datastore shutting down");
                break;
            }
        }
    }
    Ok(())
}
