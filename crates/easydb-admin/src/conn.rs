//! Per-connection request loop: read a newline-terminated line, dispatch it,
//! write back a newline-terminated response, repeat until `"exit"` or EOF.
//!
//! Every request line is one of a handful of administrative commands the
//! engine actually exposes (`begin`, `commit`, `abort`, `.tables`,
//! `.schema <table>`) plus the two test hooks (`exit`, `crash`). Anything
//! else is reported back as an unimplemented statement rather than silently
//! accepted, since interpreting arbitrary SQL text is not this crate's job.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use common::TransactionId;
use engine::Engine;
use serde_json::json;

enum Response {
    Ok(String),
    Rows(Vec<String>, Vec<Vec<String>>),
    Err(String),
}

impl Response {
    fn into_line(self, web: bool) -> String {
        if web {
            let value = match self {
                Response::Ok(msg) => json!({"status": "ok", "message": msg}),
                Response::Err(msg) => json!({"status": "error", "message": msg}),
                Response::Rows(header, rows) => json!({"status": "ok", "columns": header, "rows": rows}),
            };
            value.to_string()
        } else {
            match self {
                Response::Ok(msg) => format!("OK: {msg}"),
                Response::Err(msg) => format!("ERROR: {msg}"),
                Response::Rows(header, rows) => {
                    let mut line = header.join("|");
                    for row in rows {
                        line.push(';');
                        line.push_str(&row.join("|"));
                    }
                    line
                }
            }
        }
    }
}

/// State kept for one client connection: at most one open transaction at a
/// time, matching the wire protocol's one-statement-at-a-time model.
struct Session {
    engine: Arc<Engine>,
    txn: Option<TransactionId>,
}

impl Session {
    fn dispatch(&mut self, statement: &str) -> Response {
        let mut parts = statement.split_whitespace();
        match parts.next() {
            None => Response::Ok(String::new()),
            Some("begin") => match self.engine.begin() {
                Ok(txn) => {
                    self.txn = Some(txn);
                    Response::Ok(format!("txn {txn} started"))
                }
                Err(e) => Response::Err(e.to_string()),
            },
            Some("commit") => match self.txn.take() {
                None => Response::Err("no active transaction".to_string()),
                Some(txn) => match self.engine.commit(txn) {
                    Ok(()) => Response::Ok(format!("txn {txn} committed")),
                    Err(e) => Response::Err(e.to_string()),
                },
            },
            Some("abort") => match self.txn.take() {
                None => Response::Err("no active transaction".to_string()),
                Some(txn) => match self.engine.abort(txn) {
                    Ok(()) => Response::Ok(format!("txn {txn} aborted")),
                    Err(e) => Response::Err(e.to_string()),
                },
            },
            Some(".tables") => {
                let names: Vec<String> = self
                    .engine
                    .with_catalog(|catalog| catalog.tables().map(|t| t.name.clone()).collect());
                Response::Rows(vec!["table".to_string()], names.into_iter().map(|n| vec![n]).collect())
            }
            Some(".schema") => match parts.next() {
                None => Response::Err("usage: .schema <table>".to_string()),
                Some(table) => self.engine.with_catalog(|catalog| match catalog.table(table) {
                    Ok(meta) => {
                        let rows = meta
                            .schema
                            .columns()
                            .iter()
                            .map(|c| vec![c.name.clone(), format!("{:?}", c.ty)])
                            .collect();
                        Response::Rows(vec!["column".to_string(), "type".to_string()], rows)
                    }
                    Err(e) => Response::Err(e.to_string()),
                }),
            },
            Some(_) => Response::Err(format!(
                "statement execution is not implemented in this build: {statement:?}"
            )),
        }
    }
}

pub fn handle_client(engine: Arc<Engine>, stream: TcpStream, web: bool) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            log::warn!("easydb-admin: failed to clone stream for {peer}: {e}");
            return;
        }
    };
    let reader = BufReader::new(stream);
    let mut session = Session { engine, txn: None };

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::warn!("easydb-admin: read error from {peer}: {e}");
                break;
            }
        };
        let statement = line.trim();
        if statement == "exit" {
            break;
        }
        if statement == "crash" {
            log::warn!("easydb-admin: crash hook invoked by {peer}, exiting without cleanup");
            std::process::exit(1);
        }

        let response = session.dispatch(statement);
        if writeln!(writer, "{}", response.into_line(web)).is_err() {
            log::warn!("easydb-admin: failed to write response to {peer}");
            break;
        }
    }

    if let Some(txn) = session.txn.take() {
        let _ = session.engine.abort(txn);
    }
    log::info!("easydb-admin: connection from {peer} closed");
}
