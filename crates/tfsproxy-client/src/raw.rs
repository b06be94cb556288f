//! Raw file actions
//!
//! A small raw file is one data server file named `T...`. A large raw file
//! is split into segments stored as separate files, followed by a directory
//! file listing them; its `L...` name points at the directory.

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tfsproxy_common::{ActionKind, BlockId, Error, FileId, ProtocolCrc, Result, ServerAddr, StatusCode, UnlinkType, tfs_crc};
use tfsproxy_proto::data::{self, CloseRequest, RawFileInfo, ReadRequest, WriteRequest};
use tfsproxy_proto::fsname::suffix_hash;
use tfsproxy_proto::{BlockInfo, OpenMode, RawFileKind, RawFsName, SegmentDirectory, SegmentInfo};
use tracing::{debug, info, warn};

use crate::action::{ActionOutcome, ActionRequest};
use crate::batch::run_ordered;
use crate::dedup::DedupKey;
use crate::engine::{BlockTarget, Engine};
use crate::operation::{Operation, ReplicaOrder, RollbackLedger, State, WrittenFile};
use crate::planner::{Segment, plan_read, plan_write};
use crate::routing::{ClusterRoute, Intent};

/// Seed of the content CRC data servers keep per file
pub(crate) const FILE_CRC_SEED: u32 = 0;

const WRITE_MODE: OpenMode = OpenMode::WRITE.union(OpenMode::CREATE);
const UNLINK_MODE: OpenMode = OpenMode::WRITE.union(OpenMode::NOLEASE);

/// A byte range of one data server file
#[derive(Debug, Clone, Copy)]
pub(crate) struct RangeRead {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub offset: u64,
    /// `None` reads to the end of the file
    pub length: Option<u64>,
    /// Ask for the file info trailer on the first request
    pub v2: bool,
    pub force: bool,
}

fn raw_name(req: &ActionRequest) -> Result<RawFsName> {
    let name = req
        .file_name
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("raw file name missing"))?;
    RawFsName::parse(name, req.suffix.as_deref())
}

fn written(name: String) -> ActionOutcome {
    let mut outcome = ActionOutcome::json(200, &json!({ "TFS_FILE_NAME": name }));
    outcome.file_name = Some(name);
    outcome
}

/// Reject data that does not match its segment
fn check_segment(info: &SegmentInfo, whole: bool, expected: u32, data: &[u8]) -> Result<()> {
    if data.len() != expected as usize {
        return Err(Error::Corrupted(format!(
            "block {} file {}: read {} of {} bytes",
            info.block_id,
            info.file_id,
            data.len(),
            expected
        )));
    }
    if whole && info.crc != 0 {
        let crc = tfs_crc(FILE_CRC_SEED, data);
        if crc != info.crc {
            return Err(Error::Corrupted(format!(
                "block {} file {}: crc {:#x}, directory says {:#x}",
                info.block_id, info.file_id, crc, info.crc
            )));
        }
    }
    Ok(())
}

impl Engine {
    pub(crate) async fn raw_action(
        &self,
        req: &ActionRequest,
        op: &mut Operation,
        ledger: &RollbackLedger,
    ) -> Result<ActionOutcome> {
        match req.kind {
            ActionKind::WriteFile => self.raw_write(req, op, ledger).await,
            ActionKind::ReadFile => self.raw_read(req, op).await,
            ActionKind::StatFile => self.raw_stat(req, op).await,
            ActionKind::RemoveFile => self.raw_remove(req, op).await,
            other => Err(Error::invalid_argument(format!(
                "{other} is not a raw file action"
            ))),
        }
    }

    async fn raw_write(
        &self,
        req: &ActionRequest,
        op: &mut Operation,
        ledger: &RollbackLedger,
    ) -> Result<ActionOutcome> {
        if req.body.is_empty() {
            return Err(Error::invalid_argument("nothing to write"));
        }
        let route = self.route_resolve(op, Intent::Write, 0).await?;

        let large = req.large_file || req.body.len() as u64 > self.config.batch.large_file_threshold;
        let dedup_key = (!large && route.need_duplicate && self.dedup.is_some())
            .then(|| DedupKey::of(&req.body));
        if let Some(key) = &dedup_key {
            if let Some(name) = self.find_duplicate(op, &route, key).await {
                debug!("op {}: {} already stored as {}", op.id(), key, name);
                return Ok(written(name));
            }
        }

        let suffix_bits = req
            .suffix
            .as_deref()
            .map_or(0, |s| u64::from(suffix_hash(s.as_bytes())) << 32);
        let (kind, stored) = if large {
            let stored = self
                .write_large(op, route.ns_addr, &req.body, suffix_bits, ledger)
                .await?;
            (RawFileKind::Large, stored)
        } else {
            let mut segment = plan_write(&req.body, 0, req.body.len() as u64)
                .segments
                .into_iter()
                .next()
                .ok_or_else(|| Error::internal("empty write plan"))?;
            let stored = self
                .write_segment(op, route.ns_addr, &mut segment, suffix_bits, ledger)
                .await?;
            (RawFileKind::Small, stored)
        };

        // the name carries the cluster the data ended up in
        let landed = op.route().map_or(route, |r| r.current);
        let cluster_id = if landed.cluster_id == 0 {
            self.routing.cluster_id_from_name(op, landed.ns_addr).await?
        } else {
            landed.cluster_id
        };
        let name = RawFsName::new(kind, cluster_id, stored.block_id, stored.file_id).name(req.simple_name);
        info!(
            "op {}: wrote {} ({} bytes, block {})",
            op.id(),
            name,
            req.body.len(),
            stored.block_id
        );
        if let (Some(key), Some(store)) = (&dedup_key, &self.dedup) {
            if let Err(e) = store.set(key, &name).await {
                warn!("dedup store rejected {}: {}", key, e);
            }
        }
        Ok(written(name))
    }

    /// Name of a stored copy of the same content that is still normal
    async fn find_duplicate(&self, op: &mut Operation, route: &ClusterRoute, key: &DedupKey) -> Option<String> {
        let store = self.dedup.as_ref()?;
        let name = match store.get(key).await {
            Ok(found) => found?,
            Err(e) => {
                warn!("dedup lookup of {} failed: {}", key, e);
                return None;
            }
        };
        let parsed = match RawFsName::parse(&name, None) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dedup store returned bad name {}: {}", name, e);
                return None;
            }
        };
        match self
            .stat_file(op, route.ns_addr, &parsed, false, State::StatDupFile)
            .await
        {
            Ok(info) if info.flag.is_normal() => Some(name),
            Ok(info) => {
                debug!("duplicate {} has status {}, writing again", name, info.flag.0);
                None
            }
            Err(e) => {
                debug!("duplicate {} unusable: {}", name, e);
                None
            }
        }
    }

    /// Segments, then the directory describing them
    async fn write_large(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        body: &Bytes,
        suffix_bits: FileId,
        ledger: &RollbackLedger,
    ) -> Result<SegmentInfo> {
        op.pin_cluster();
        let plan = plan_write(body, 0, self.config.batch.max_fragment_size);
        let stored = self
            .write_segments(op, ns_addr, plan.segments.clone(), ledger)
            .await?;
        let mut directory = plan.directory(&stored);
        self.write_segment(op, ns_addr, &mut directory, suffix_bits, ledger)
            .await
    }

    /// Write `segments` in rounds of at most `max_batch_count`, each in a
    /// new file. Returns what was stored, in segment order.
    pub(crate) async fn write_segments(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        mut segments: Vec<Segment>,
        ledger: &RollbackLedger,
    ) -> Result<Vec<SegmentInfo>> {
        let limit = self.config.batch.max_batch_count.max(1);
        let mut stored = Vec::with_capacity(segments.len());
        while !segments.is_empty() {
            let rest = segments.split_off(limit.min(segments.len()));
            let mut round = std::mem::replace(&mut segments, rest);
            self.resolve_round(op, ns_addr, WRITE_MODE, &mut round).await?;

            op.enter(State::WriteData);
            let tasks: Vec<_> = round
                .into_iter()
                .map(|mut segment| {
                    let mut child = op.child();
                    async move {
                        self.write_segment(&mut child, ns_addr, &mut segment, 0, ledger)
                            .await
                    }
                })
                .collect();
            let results = run_ordered(tasks, limit, |_, info: &SegmentInfo| stored.push(*info)).await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                return Err(err);
            }
        }
        Ok(stored)
    }

    /// Store one segment as a new file, moving on to the next replica (and
    /// eventually a new block) when a data server fails
    pub(crate) async fn write_segment(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        segment: &mut Segment,
        file_id_hint: FileId,
        ledger: &RollbackLedger,
    ) -> Result<SegmentInfo> {
        let mut target = self
            .segment_target(op, ns_addr, WRITE_MODE, segment, ReplicaOrder::InOrder)
            .await?;
        loop {
            let addr = self.replica(op, &mut target).await?;
            match self
                .write_file(op, addr, &target.block, file_id_hint, &segment.data)
                .await
            {
                Ok((file_id, crc)) => {
                    ledger.record(WrittenFile {
                        block: target.block.clone(),
                        file_id,
                    });
                    let mut info = segment.info;
                    info.block_id = target.block.block_id;
                    info.file_id = file_id;
                    info.crc = crc;
                    return Ok(info);
                }
                Err(e) => self.replica_failed(&mut target, addr, e).await?,
            }
        }
    }

    /// Create, fill and close one file on `addr`. Returns its id and CRC.
    async fn write_file(
        &self,
        op: &mut Operation,
        addr: ServerAddr,
        block: &BlockInfo,
        file_id_hint: FileId,
        payload: &Bytes,
    ) -> Result<(FileId, u32)> {
        op.enter(State::CreateFile);
        let frame = self
            .data_call(addr, data::encode_create_file(block.block_id, file_id_hint))
            .await?;
        let created = data::parse_create_file(&frame)?;

        let chunk = usize::try_from(self.config.batch.max_read_size)
            .unwrap_or(usize::MAX)
            .max(1);
        let mut crc = ProtocolCrc::with_seed(FILE_CRC_SEED);
        for (index, part) in payload.chunks(chunk).enumerate() {
            let pos = index * chunk;
            let offset = i32::try_from(pos)
                .map_err(|_| Error::invalid_argument(format!("write offset {pos} out of range")))?;
            op.enter(State::WriteData);
            let frame = self
                .data_call(
                    addr,
                    data::encode_write(&WriteRequest {
                        block_id: block.block_id,
                        file_id: created.file_id,
                        file_number: created.file_number,
                        offset,
                        payload: part,
                        block,
                    }),
                )
                .await?;
            data::parse_write(&frame)?;
            crc.update(part);
        }

        op.enter(State::CloseFile);
        let crc = crc.value();
        let frame = self
            .data_call(
                addr,
                data::encode_close(&CloseRequest {
                    block_id: block.block_id,
                    file_id: created.file_id,
                    file_number: created.file_number,
                    crc,
                    block,
                }),
            )
            .await?;
        data::parse_close(&frame)?;
        debug!(
            "op {}: closed block {} file {} on {} ({} bytes)",
            op.id(),
            block.block_id,
            created.file_id,
            addr,
            payload.len()
        );
        Ok((created.file_id, crc))
    }

    async fn raw_read(&self, req: &ActionRequest, op: &mut Operation) -> Result<ActionOutcome> {
        let name = raw_name(req)?;
        let route = self.route_resolve(op, Intent::Read, name.cluster_id).await?;
        if name.is_large() {
            return self.read_large(op, route.ns_addr, &name, req).await;
        }

        let mut target = self
            .resolve_block(op, route.ns_addr, OpenMode::READ, name.block_id, ReplicaOrder::Random)
            .await?;
        let range = RangeRead {
            block_id: name.block_id,
            file_id: name.file_id(),
            offset: req.offset,
            length: req.length,
            v2: req.offset == 0,
            force: req.force,
        };
        let (body, file_info) = self
            .on_replicas(op, &mut target, State::ReadData, move |addr, _| {
                Box::pin(async move { self.read_range(addr, range).await })
            })
            .await?;
        let mut outcome = ActionOutcome::data(body);
        outcome.file_info = file_info;
        Ok(outcome)
    }

    /// Read the directory of a large file, then the segments the range
    /// touches
    async fn read_large(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        name: &RawFsName,
        req: &ActionRequest,
    ) -> Result<ActionOutcome> {
        let dir = self.read_directory(op, ns_addr, name, req.force).await?;
        let segments = plan_read(&dir, req.offset, req.length)?;
        let parts = self.read_segments(op, ns_addr, segments, req.force).await?;

        let mut body = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in &parts {
            body.extend_from_slice(part);
        }
        Ok(ActionOutcome::data(body.freeze()))
    }

    async fn read_directory(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        name: &RawFsName,
        force: bool,
    ) -> Result<SegmentDirectory> {
        let mut target = self
            .resolve_block(op, ns_addr, OpenMode::READ, name.block_id, ReplicaOrder::Random)
            .await?;
        self.directory_on(op, &mut target, name, force).await
    }

    async fn directory_on(
        &self,
        op: &mut Operation,
        target: &mut BlockTarget,
        name: &RawFsName,
        force: bool,
    ) -> Result<SegmentDirectory> {
        let range = RangeRead {
            block_id: name.block_id,
            file_id: name.file_id(),
            offset: 0,
            length: None,
            v2: false,
            force,
        };
        let (raw, _) = self
            .on_replicas(op, target, State::ReadMetaSegment, move |addr, _| {
                Box::pin(async move { self.read_range(addr, range).await })
            })
            .await?;
        SegmentDirectory::parse(&raw)
    }

    /// Read planned segments in rounds; parts come back in segment order
    pub(crate) async fn read_segments(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        mut segments: Vec<Segment>,
        force: bool,
    ) -> Result<Vec<Bytes>> {
        let limit = self.config.batch.max_batch_count.max(1);
        let mut parts = Vec::with_capacity(segments.len());
        while !segments.is_empty() {
            let rest = segments.split_off(limit.min(segments.len()));
            let mut round = std::mem::replace(&mut segments, rest);
            self.resolve_round(op, ns_addr, OpenMode::READ, &mut round).await?;

            op.enter(State::ReadData);
            let tasks: Vec<_> = round
                .into_iter()
                .map(|segment| {
                    let mut child = op.child();
                    async move { self.read_segment(&mut child, ns_addr, segment, force).await }
                })
                .collect();
            let results = run_ordered(tasks, limit, |_, part: &Bytes| parts.push(part.clone())).await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                return Err(err);
            }
        }
        Ok(parts)
    }

    async fn read_segment(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        mut segment: Segment,
        force: bool,
    ) -> Result<Bytes> {
        let mut target = self
            .segment_target(op, ns_addr, OpenMode::READ, &mut segment, ReplicaOrder::Random)
            .await?;
        let info = segment.info;
        let expected = segment.oper_size;
        let whole = segment.oper_offset == 0 && expected == info.size;
        let range = RangeRead {
            block_id: info.block_id,
            file_id: info.file_id,
            offset: u64::from(segment.oper_offset),
            length: Some(u64::from(expected)),
            v2: false,
            force,
        };
        self.on_replicas(op, &mut target, State::ReadData, move |addr, _| {
            Box::pin(async move {
                let (part, _) = self.read_range(addr, range).await?;
                check_segment(&info, whole, expected, &part)?;
                Ok(part)
            })
        })
        .await
    }

    /// Read a range from one replica in `max_read_size` pieces. A short
    /// piece marks the end of the file.
    pub(crate) async fn read_range(
        &self,
        addr: ServerAddr,
        range: RangeRead,
    ) -> Result<(Bytes, Option<RawFileInfo>)> {
        let chunk = u64::from(self.config.batch.max_read_size.max(1));
        let flag = if range.force {
            data::READ_STAT_FORCE
        } else {
            data::READ_STAT_NORMAL
        };
        let mut out = BytesMut::new();
        let mut file_info = None;
        let mut done = 0u64;
        loop {
            let want = range
                .length
                .map_or(chunk, |len| len.saturating_sub(done).min(chunk));
            if want == 0 {
                break;
            }
            let pos = range.offset + done;
            let v2 = range.v2 && done == 0;
            let req = ReadRequest {
                block_id: range.block_id,
                file_id: range.file_id,
                offset: i32::try_from(pos).map_err(|_| {
                    Error::status(StatusCode::READ_OFFSET, format!("read offset {pos} out of range"))
                })?,
                length: u32::try_from(want).unwrap_or(u32::MAX),
                flag,
                v2,
            };
            let frame = self.data_call(addr, data::encode_read(&req)).await?;
            let reply = data::parse_read(&frame, v2)?;
            if reply.file_info.is_some() {
                file_info = reply.file_info;
            }
            let got = reply.data.len() as u64;
            out.extend_from_slice(&reply.data);
            done += got;
            if got < want {
                break;
            }
        }
        Ok((out.freeze(), file_info))
    }

    async fn raw_stat(&self, req: &ActionRequest, op: &mut Operation) -> Result<ActionOutcome> {
        let name = raw_name(req)?;
        let route = self.route_resolve(op, Intent::Read, name.cluster_id).await?;
        let info = self
            .stat_file(op, route.ns_addr, &name, req.force, State::StatFile)
            .await?;
        let size = if name.is_large() {
            self.read_directory(op, route.ns_addr, &name, req.force)
                .await?
                .size
        } else {
            u64::try_from(info.size).unwrap_or_default()
        };

        let body = json!({
            "FILE_NAME": req.file_name.as_deref().unwrap_or_default(),
            "BLOCK_ID": name.block_id,
            "FILE_ID": info.id,
            "OFFSET": info.offset,
            "SIZE": size,
            "OCCUPY_SIZE": info.u_size,
            "MODIFY_TIME": info.modify_time,
            "CREATE_TIME": info.create_time,
            "STATUS": info.flag.0,
            "CRC": info.crc,
        });
        let mut outcome = ActionOutcome::json(200, &body);
        outcome.file_info = Some(info);
        Ok(outcome)
    }

    /// Stat a raw file on any replica of its block
    pub(crate) async fn stat_file(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        name: &RawFsName,
        force: bool,
        state: State,
    ) -> Result<RawFileInfo> {
        let mut target = self
            .resolve_block(op, ns_addr, OpenMode::STAT, name.block_id, ReplicaOrder::Random)
            .await?;
        let (block_id, file_id) = (name.block_id, name.file_id());
        let mode = if force {
            data::STAT_FORCE
        } else {
            data::STAT_NORMAL
        };
        self.on_replicas(op, &mut target, state, move |addr, _| {
            Box::pin(async move {
                let frame = self
                    .data_call(addr, data::encode_stat(block_id, file_id, mode))
                    .await?;
                data::parse_stat(&frame)
            })
        })
        .await
    }

    async fn raw_remove(&self, req: &ActionRequest, op: &mut Operation) -> Result<ActionOutcome> {
        let name = raw_name(req)?;
        op.enter(State::RouteResolve);
        let route = self
            .routing
            .route_unlink(op, name.cluster_id, name.block_id)
            .await?;
        let mut target = self
            .resolve_block(op, route.ns_addr, UNLINK_MODE, name.block_id, ReplicaOrder::MasterOnly)
            .await?;
        let file_id = name.file_id();
        let unlink_type = req.unlink_type;

        if unlink_type == UnlinkType::Delete {
            let stat = self
                .on_replicas(op, &mut target, State::StatFile, move |addr, block| {
                    Box::pin(async move {
                        let frame = self
                            .data_call(addr, data::encode_stat(block.block_id, file_id, data::STAT_FORCE))
                            .await?;
                        data::parse_stat(&frame)
                    })
                })
                .await?;
            if !stat.flag.is_live() {
                return Err(Error::status(
                    StatusCode::FILE_STATUS,
                    format!("{} has status {}", name, stat.flag.0),
                ));
            }
            if name.is_large() {
                let dir = self.directory_on(op, &mut target, &name, true).await?;
                self.remove_segments(op, route.ns_addr, &dir.segments).await;
            }
        }

        let size = self
            .on_replicas(op, &mut target, State::DeleteData, move |_, block| {
                Box::pin(async move { self.unlink_on_master(&block, file_id, unlink_type).await })
            })
            .await?;
        info!(
            "op {}: {:?} {} ({} bytes)",
            op.id(),
            unlink_type,
            name,
            size
        );
        Ok(ActionOutcome::with_status(200))
    }

    /// Delete the data segments of a large file. Failures are only logged;
    /// the directory delete decides the outcome.
    pub(crate) async fn remove_segments(&self, op: &mut Operation, ns_addr: ServerAddr, segments: &[SegmentInfo]) {
        let limit = self.config.batch.max_batch_count.max(1);
        let tasks: Vec<_> = segments
            .iter()
            .map(|info| {
                let mut child = op.child();
                let info = *info;
                async move {
                    let mut target = self
                        .resolve_block(&mut child, ns_addr, UNLINK_MODE, info.block_id, ReplicaOrder::MasterOnly)
                        .await?;
                    self.on_replicas(&mut child, &mut target, State::DeleteData, move |_, block| {
                        Box::pin(async move {
                            self.unlink_on_master(&block, info.file_id, UnlinkType::Delete)
                                .await
                        })
                    })
                    .await
                }
            })
            .collect();
        op.enter(State::DeleteData);
        let results = run_ordered(tasks, limit, |_, _: &u64| {}).await;
        for (info, result) in segments.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "op {}: segment block {} file {} not deleted: {}",
                    op.id(),
                    info.block_id,
                    info.file_id,
                    e
                );
            }
        }
    }
}
