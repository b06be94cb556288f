//! Named file actions
//!
//! Directories and file names live on the meta server picked from the meta
//! table; file contents are fragments stored in data server files the same
//! way raw segments are.

use bytes::{Bytes, BytesMut};
use serde_json::{Value, json};
use tfsproxy_common::{ActionKind, AppId, Error, Result, StatusCode};
use tfsproxy_proto::meta::{self, FileType, FragInfo, FragMeta, LsEntry, LsRequest, MetaAction, MetaTarget};
use tfsproxy_proto::{Frame, SegmentInfo};
use tracing::{debug, info, warn};

use crate::action::{ActionOutcome, ActionRequest};
use crate::engine::Engine;
use crate::operation::{Operation, RollbackLedger, State};
use crate::peer::PeerRole;
use crate::planner::{plan_frags, plan_write};
use crate::routing::Intent;

/// Fragments one fragment lookup may return
const MAX_READ_FRAGS: u64 = 1024;

/// The meta table is stale or the meta server is gone
fn needs_table_refresh(err: &Error) -> bool {
    err.is_transport()
        || matches!(
            err.status_code(),
            Some(StatusCode::TABLE_VERSION | StatusCode::LEASE_EXPIRED)
        )
}

fn entry_json(entry: &LsEntry) -> Value {
    json!({
        "NAME": entry.name,
        "PID": entry.info.pid,
        "ID": entry.info.id,
        "SIZE": entry.info.size,
        "IS_FILE": entry.info.file_type() != FileType::Dir,
        "CREATE_TIME": entry.info.create_time,
        "MODIFY_TIME": entry.info.modify_time,
        "VER_NO": entry.info.ver_no,
    })
}

/// `/a/b/c` -> `/a`, `/a/b`
fn ancestors(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    (1..parts.len())
        .map(|n| format!("/{}", parts[..n].join("/")))
        .collect()
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl Engine {
    pub(crate) async fn custom_action(
        &self,
        req: &ActionRequest,
        op: &mut Operation,
        ledger: &RollbackLedger,
    ) -> Result<ActionOutcome> {
        let path = req
            .path
            .as_deref()
            .ok_or_else(|| Error::invalid_argument("file path missing"))?;
        match req.kind {
            ActionKind::CreateDir
            | ActionKind::CreateFile
            | ActionKind::RemoveDir
            | ActionKind::MoveDir
            | ActionKind::MoveFile => self.meta_action(req, op, path).await,
            ActionKind::ListDir | ActionKind::ListFile | ActionKind::StatFile => {
                self.list(req, op, path).await
            }
            ActionKind::ReadFile => self.custom_read(req, op, path).await,
            ActionKind::WriteFile => self.custom_write(req, op, path, ledger).await,
            ActionKind::RemoveFile => self.custom_remove(req, op, path).await,
            other => Err(Error::invalid_argument(format!(
                "{other} is not a named file action"
            ))),
        }
    }

    /// One meta server round trip for `user_id`. `encode` builds the
    /// request from the app id and the table version; a stale table or a
    /// lost meta server refreshes the table at the cost of one retry.
    async fn meta_call<T>(
        &self,
        op: &mut Operation,
        user_id: u64,
        state: State,
        encode: impl Fn(AppId, u64) -> Bytes,
        parse: impl Fn(&Frame) -> Result<T>,
    ) -> Result<T> {
        let app_id = self.routing.app_id().await?;
        let mut refresh = false;
        loop {
            op.enter(State::GetMetaTable);
            let table = self.routing.meta_table(refresh).await?;
            let addr = table.select(app_id, user_id);
            op.enter(state);
            let reply = self
                .transport
                .call(PeerRole::MetaServer, addr, encode(app_id, table.version))
                .await
                .and_then(|frame| parse(&frame));
            match reply {
                Ok(value) => return Ok(value),
                Err(e) if needs_table_refresh(&e) => {
                    warn!(
                        "op {}: meta server {} (table version {}) failed: {}",
                        op.id(),
                        addr,
                        table.version,
                        e
                    );
                    op.retry(e)?;
                    refresh = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_action(
        &self,
        op: &mut Operation,
        user_id: u64,
        path: &str,
        new_path: Option<&str>,
        action: MetaAction,
        state: State,
    ) -> Result<()> {
        self.meta_call(
            op,
            user_id,
            state,
            |app_id, table_version| {
                let target = MetaTarget {
                    app_id,
                    user_id,
                    path,
                    table_version,
                };
                meta::encode_action(&target, new_path, action)
            },
            meta::parse_action,
        )
        .await
    }

    async fn meta_action(&self, req: &ActionRequest, op: &mut Operation, path: &str) -> Result<ActionOutcome> {
        let action = match req.kind {
            ActionKind::CreateDir => MetaAction::CreateDir,
            ActionKind::CreateFile => MetaAction::CreateFile,
            ActionKind::RemoveDir => MetaAction::RemoveDir,
            ActionKind::MoveDir => MetaAction::MoveDir,
            ActionKind::MoveFile => MetaAction::MoveFile,
            other => {
                return Err(Error::invalid_argument(format!(
                    "{other} is not a directory tree action"
                )));
            }
        };
        let creates = matches!(action, MetaAction::CreateDir | MetaAction::CreateFile);
        let new_path = req.new_path.as_deref();
        if matches!(action, MetaAction::MoveDir | MetaAction::MoveFile) && new_path.is_none() {
            return Err(Error::invalid_argument("move needs a destination path"));
        }

        let user_id = req.user_id;
        match self
            .send_action(op, user_id, path, new_path, action, State::MetaProcess)
            .await
        {
            Err(e) if creates && req.recursive && e.status_code() == Some(StatusCode::PARENT_EXIST) => {
                self.create_parents(op, user_id, path).await?;
                self.send_action(op, user_id, path, new_path, action, State::MetaProcess)
                    .await?;
            }
            other => other?,
        }
        info!("op {}: {:?} {}", op.id(), action, path);
        Ok(ActionOutcome::with_status(if creates { 201 } else { 200 }))
    }

    /// Create every missing ancestor of `path`
    async fn create_parents(&self, op: &mut Operation, user_id: u64, path: &str) -> Result<()> {
        for dir in ancestors(path) {
            match self
                .send_action(op, user_id, &dir, None, MetaAction::CreateDir, State::MetaProcess)
                .await
            {
                Err(e) if e.status_code() == Some(StatusCode::TARGET_EXIST) => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// List a directory (all pages) or a single file
    async fn list(&self, req: &ActionRequest, op: &mut Operation, path: &str) -> Result<ActionOutcome> {
        let listing = if req.kind == ActionKind::ListDir {
            FileType::Dir
        } else {
            FileType::File
        };
        let user_id = req.user_id;
        let mut entries: Vec<LsEntry> = Vec::new();
        let mut pid = -1;
        let mut cursor = path.to_string();
        let mut file_type = listing;
        loop {
            let reply = self
                .meta_call(
                    op,
                    user_id,
                    State::MetaProcess,
                    |app_id, table_version| {
                        meta::encode_ls(&LsRequest {
                            app_id,
                            user_id,
                            pid,
                            path: &cursor,
                            file_type,
                            table_version,
                        })
                    },
                    |frame: &Frame| meta::parse_ls(frame, listing),
                )
                .await?;
            let next = reply
                .next_cursor()
                .map(|(name, pid, file_type)| (name.to_string(), pid, file_type));
            entries.extend(reply.entries);
            match next {
                Some((name, next_pid, next_type)) => {
                    debug!("op {}: listing {} continues after {}", op.id(), path, name);
                    cursor = name;
                    pid = next_pid;
                    file_type = next_type;
                }
                None => break,
            }
        }

        let mut outcome = if listing == FileType::Dir {
            let body: Vec<Value> = entries.iter().map(entry_json).collect();
            ActionOutcome::json(200, &body)
        } else {
            let entry = entries
                .first()
                .ok_or_else(|| Error::status(StatusCode::TARGET_EXIST, format!("{path} not found")))?;
            ActionOutcome::json(200, &entry_json(entry))
        };
        outcome.entries = entries;
        Ok(outcome)
    }

    /// Fragments of `path` overlapping `[offset, end)` and the cluster
    /// holding them
    async fn frag_list(
        &self,
        op: &mut Operation,
        user_id: u64,
        path: &str,
        offset: u64,
        end: u64,
    ) -> Result<(u32, Vec<FragMeta>)> {
        let fragment_size = self.config.batch.max_fragment_size;
        let mut cluster_id = 0;
        let mut frags = Vec::new();
        let mut pos = offset;
        while pos < end {
            let (size, _) = meta::frag_read_size(end - pos, fragment_size, MAX_READ_FRAGS);
            let at = pos;
            let reply = self
                .meta_call(
                    op,
                    user_id,
                    State::GetFragInfo,
                    |app_id, table_version| {
                        let target = MetaTarget {
                            app_id,
                            user_id,
                            path,
                            table_version,
                        };
                        meta::encode_read_frags(&target, to_i64(at), size)
                    },
                    meta::parse_read_frags,
                )
                .await?;
            if reply.info.cluster_id != 0 {
                cluster_id = reply.info.cluster_id;
            }
            let last_end = reply.info.frags.iter().map(FragMeta::end).max();
            frags.extend(reply.info.frags);
            if !reply.still_have {
                break;
            }
            match last_end.and_then(|e| u64::try_from(e).ok()) {
                Some(next) if next > pos => pos = next,
                _ => break,
            }
        }
        Ok((cluster_id, frags))
    }

    async fn custom_read(&self, req: &ActionRequest, op: &mut Operation, path: &str) -> Result<ActionOutcome> {
        let wanted_end = req
            .length
            .map_or(u64::MAX, |len| req.offset.saturating_add(len));
        let (cluster_id, frags) = self
            .frag_list(op, req.user_id, path, req.offset, wanted_end)
            .await?;
        let file_end = frags
            .iter()
            .filter_map(|f| u64::try_from(f.end()).ok())
            .max()
            .unwrap_or(0);
        if req.offset > file_end && !frags.is_empty() {
            return Err(Error::status(
                StatusCode::READ_OFFSET,
                format!("read offset {} beyond end of {path} ({file_end})", req.offset),
            ));
        }
        let end = wanted_end.min(file_end);
        let plan = plan_frags(&frags, req.offset, end);
        if plan.segments.is_empty() {
            return Ok(ActionOutcome::data(Bytes::new()));
        }

        let route = self.route_resolve(op, Intent::Read, cluster_id).await?;
        let segments = plan.segments;
        let starts: Vec<u64> = segments.iter().map(|s| s.file_offset()).collect();
        let parts = self
            .read_segments(op, route.ns_addr, segments, req.force)
            .await?;

        let mut body = BytesMut::with_capacity(usize::try_from(end - req.offset).unwrap_or_default());
        let mut at = req.offset;
        for (start, part) in starts.into_iter().zip(&parts) {
            if start > at {
                let gap = usize::try_from(start - at).unwrap_or_default();
                body.resize(body.len() + gap, 0);
                at = start;
            }
            let skip = usize::try_from(at - start).unwrap_or_default().min(part.len());
            body.extend_from_slice(&part[skip..]);
            at = at.max(start + part.len() as u64);
        }
        let mut outcome = ActionOutcome::data(body.freeze());
        outcome.holes = plan.holes;
        Ok(outcome)
    }

    async fn custom_write(
        &self,
        req: &ActionRequest,
        op: &mut Operation,
        path: &str,
        ledger: &RollbackLedger,
    ) -> Result<ActionOutcome> {
        if req.body.is_empty() {
            return Err(Error::invalid_argument("nothing to write"));
        }
        let user_id = req.user_id;
        let known = self
            .meta_call(
                op,
                user_id,
                State::ClusterIdFromMeta,
                |app_id, table_version| {
                    let target = MetaTarget {
                        app_id,
                        user_id,
                        path,
                        table_version,
                    };
                    meta::encode_read_frags(&target, 0, 0)
                },
                meta::parse_read_frags,
            )
            .await?
            .info
            .cluster_id;

        let route = self.route_resolve(op, Intent::Write, known).await?;
        op.pin_cluster();
        let cluster_id = match (known, route.cluster_id) {
            (0, 0) => self.routing.cluster_id_from_name(op, route.ns_addr).await?,
            (0, routed) => routed,
            (known, _) => known,
        };

        let plan = plan_write(&req.body, req.offset, self.config.batch.max_fragment_size);
        let stored = self
            .write_segments(op, route.ns_addr, plan.segments, ledger)
            .await?;
        let info = FragInfo {
            cluster_id,
            split: false,
            frags: stored
                .iter()
                .map(|s| FragMeta {
                    block_id: s.block_id,
                    file_id: s.file_id,
                    offset: s.offset,
                    size: s.size,
                })
                .collect(),
        };
        self.meta_call(
            op,
            user_id,
            State::WriteMeta,
            |app_id, table_version| {
                let target = MetaTarget {
                    app_id,
                    user_id,
                    path,
                    table_version,
                };
                meta::encode_write_frags(&target, &info)
            },
            meta::parse_write_frags,
        )
        .await?;
        info!(
            "op {}: wrote {} bytes at {} of {} in {} fragments",
            op.id(),
            req.body.len(),
            req.offset,
            path,
            info.frags.len()
        );
        Ok(ActionOutcome::with_status(200))
    }

    /// Delete the data of a named file, then its name
    async fn custom_remove(&self, req: &ActionRequest, op: &mut Operation, path: &str) -> Result<ActionOutcome> {
        let (cluster_id, frags) = self
            .frag_list(op, req.user_id, path, 0, u64::MAX)
            .await?;
        if !frags.is_empty() {
            let route = self.route_resolve(op, Intent::Remove, cluster_id).await?;
            let segments: Vec<SegmentInfo> = frags
                .iter()
                .map(|f| SegmentInfo {
                    block_id: f.block_id,
                    file_id: f.file_id,
                    offset: f.offset,
                    size: f.size,
                    crc: 0,
                })
                .collect();
            self.remove_segments(op, route.ns_addr, &segments).await;
        }
        self.send_action(op, req.user_id, path, None, MetaAction::RemoveFile, State::NotifyMeta)
            .await?;
        info!("op {}: removed {} ({} fragments)", op.id(), path, frags.len());
        Ok(ActionOutcome::with_status(200))
    }
}
