//! 测试替身
//!
//! - [`ScriptedEngine`]：按脚本逐次返回状态，用于监督器测试
//! - [`FakeSwarm`]：在临时目录中真实写入分片数据并报告位图，用于端到端场景
//! - [`MemoryStore`]：内存网盘，强制分段严格连续
//! - [`FixedFreeSpace`]：可调的剩余空间

use crate::backpressure::FreeSpaceProbe;
use crate::engine::{DownloadEngine, EngineState, EngineStatus, Gid, MetadataProbe, StartRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::storage::{HttpFailure, ObjectStorage, RangeOutcome, RemoteItem, UploadSession};
use crate::task::FileEntry;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// 模拟的元数据（.torrent 信息字典）大小
const METADATA_LENGTH: u64 = 16_384;

fn blank_status(state: EngineState) -> EngineStatus {
    EngineStatus {
        state,
        total_length: 0,
        completed_length: 0,
        download_speed: 0,
        connections: 0,
        bitfield: None,
        piece_length: 0,
        files: vec![],
        error_code: None,
        error_message: None,
        followed_by: vec![],
        name: None,
        metadata_phase: false,
        estimated: false,
    }
}

/// 已完成的状态
pub fn status_complete(total: u64) -> EngineStatus {
    EngineStatus {
        total_length: total,
        completed_length: total,
        error_code: Some("0".to_string()),
        ..blank_status(EngineState::Complete)
    }
}

// =====================================================
// 脚本化引擎
// =====================================================

/// 脚本中的一步
#[derive(Debug, Clone)]
pub struct Step(EngineStatus);

impl Step {
    pub fn progress(completed: u64, total: u64, connections: u32) -> Self {
        Step(EngineStatus {
            total_length: total,
            completed_length: completed,
            connections,
            download_speed: 1024,
            ..blank_status(EngineState::Active)
        })
    }

    pub fn complete(total: u64) -> Self {
        Step(status_complete(total))
    }

    pub fn failed(code: &str, message: &str) -> Self {
        Step(EngineStatus {
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            ..blank_status(EngineState::Error)
        })
    }

    /// 元数据任务完成并衍生出 `next`
    pub fn metadata_done(next: &str) -> Self {
        Step(EngineStatus {
            followed_by: vec![next.to_string()],
            metadata_phase: true,
            ..status_complete(0)
        })
    }

    pub fn into_status(self) -> EngineStatus {
        self.0
    }
}

/// 按脚本返回状态的引擎；脚本走完后重复最后一步
pub struct ScriptedEngine {
    steps: Vec<Step>,
    cursor: AtomicUsize,
    /// 非零时每次查询已完成字节数加一（永不完成）
    endless_total: u64,
    queried: Mutex<Vec<String>>,
    removed: AtomicUsize,
    pauses: AtomicUsize,
    unpauses: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            cursor: AtomicUsize::new(0),
            endless_total: 0,
            queried: Mutex::new(Vec::new()),
            removed: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            unpauses: AtomicUsize::new(0),
        }
    }

    pub fn endless_progress(total: u64) -> Self {
        Self {
            endless_total: total,
            ..Self::new(vec![])
        }
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn unpauses(&self) -> usize {
        self.unpauses.load(Ordering::SeqCst)
    }

    pub fn queried_gids(&self) -> Vec<String> {
        self.queried.lock().clone()
    }
}

#[async_trait]
impl DownloadEngine for ScriptedEngine {
    async fn start(&self, _request: StartRequest) -> Result<Gid> {
        Ok("g1".to_string())
    }

    async fn status(&self, gid: &str) -> Result<EngineStatus> {
        self.queried.lock().push(gid.to_string());
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        if self.endless_total > 0 {
            return Ok(Step::progress(n as u64 + 1, self.endless_total, 1).0);
        }
        let step = self
            .steps
            .get(n)
            .or_else(|| self.steps.last())
            .ok_or_else(|| anyhow::anyhow!("empty script"))?;
        Ok(step.0.clone())
    }

    async fn pause(&self, _gid: &str) -> Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unpause(&self, _gid: &str) -> Result<()> {
        self.unpauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _gid: &str) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe_metadata(
        &self,
        _source: &str,
        _trackers: &[String],
        _timeout: Duration,
    ) -> Result<MetadataProbe> {
        anyhow::bail!("scripted engine has no metadata")
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =====================================================
// 模拟种子下载
// =====================================================

/// 模拟种子中的文件
#[derive(Debug, Clone)]
pub struct SwarmFile {
    pub relative_path: String,
    pub size: u64,
}

/// 分片完成顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOrder {
    /// 从前往后
    InOrder,
    /// 每两片交换顺序（1,0,3,2,...），前缀之后总会出现零散完成的分片
    PairSwapped,
}

/// 文件内容：全局偏移决定的非零字节
pub fn content_byte(offset: u64) -> u8 {
    (offset % 251) as u8 + 1
}

struct SwarmDownload {
    dir: PathBuf,
    /// 选中的文件（0 起始）
    selected: Vec<usize>,
    /// 待完成分片（按完成顺序）
    plan: Vec<usize>,
    next: usize,
    done: Vec<bool>,
    paused: bool,
    removed: bool,
}

/// 元数据任务：轮询若干次后完成并衍生出真实下载
struct MetadataDownload {
    polls: usize,
    follow: Gid,
}

#[derive(Default)]
struct SwarmState {
    next_gid: u32,
    downloads: HashMap<Gid, SwarmDownload>,
    metadata: HashMap<Gid, MetadataDownload>,
    /// 状态查询总次数
    queries: usize,
    estimated: usize,
    starts: Vec<Option<Vec<usize>>>,
    removes: usize,
    pauses: usize,
    peak_local_files: usize,
}

/// 模拟 BT 引擎：每次状态查询推进若干分片并把数据写入磁盘
pub struct FakeSwarm {
    name: String,
    files: Vec<SwarmFile>,
    piece_length: u64,
    pieces_per_poll: usize,
    order: PieceOrder,
    /// 完成该数量的分片后不再前进
    stall_after: Option<usize>,
    /// 元数据探测是否失败
    probe_fails: bool,
    /// 每次启动先经过的元数据阶段轮询次数（0 表示直接进入下载）
    metadata_polls: usize,
    /// 每隔多少次状态查询返回一次控制台估算值
    estimated_every: Option<usize>,
    state: Mutex<SwarmState>,
}

impl FakeSwarm {
    pub fn new(name: &str, files: Vec<SwarmFile>, piece_length: u64, pieces_per_poll: usize) -> Self {
        Self {
            name: name.to_string(),
            files,
            piece_length,
            pieces_per_poll,
            order: PieceOrder::InOrder,
            stall_after: None,
            probe_fails: false,
            metadata_polls: 0,
            estimated_every: None,
            state: Mutex::new(SwarmState::default()),
        }
    }

    /// 单文件种子
    pub fn single(name: &str, size: u64, piece_length: u64, pieces_per_poll: usize) -> Self {
        Self::new(
            name,
            vec![SwarmFile {
                relative_path: name.to_string(),
                size,
            }],
            piece_length,
            pieces_per_poll,
        )
    }

    /// 多文件种子，文件位于 `name/` 目录下
    pub fn multi(name: &str, sizes: &[u64], piece_length: u64, pieces_per_poll: usize) -> Self {
        let files = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| SwarmFile {
                relative_path: format!("{}/part{:02}.bin", name, i + 1),
                size: *size,
            })
            .collect();
        Self::new(name, files, piece_length, pieces_per_poll)
    }

    pub fn with_order(mut self, order: PieceOrder) -> Self {
        self.order = order;
        self
    }

    pub fn stall_after(mut self, pieces: usize) -> Self {
        self.stall_after = Some(pieces);
        self
    }

    pub fn failing_probe(mut self) -> Self {
        self.probe_fails = true;
        self
    }

    /// 像 aria2 处理磁力链接一样，先返回一个元数据任务
    pub fn with_metadata_phase(mut self, polls: usize) -> Self {
        self.metadata_polls = polls;
        self
    }

    /// 模拟 RPC 偶发失败后的控制台兜底状态
    pub fn with_estimated_every(mut self, queries: usize) -> Self {
        self.estimated_every = Some(queries.max(1));
        self
    }

    fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    fn piece_count(&self) -> usize {
        self.total_size().div_ceil(self.piece_length) as usize
    }

    /// 文件在种子中的全局字节范围
    fn file_span(&self, index: usize) -> Range<u64> {
        let start: u64 = self.files[..index].iter().map(|f| f.size).sum();
        start..start + self.files[index].size
    }

    fn piece_span(&self, piece: usize) -> Range<u64> {
        let start = piece as u64 * self.piece_length;
        start..(start + self.piece_length).min(self.total_size())
    }

    fn intersect(a: &Range<u64>, b: &Range<u64>) -> Option<Range<u64>> {
        let start = a.start.max(b.start);
        let end = a.end.min(b.end);
        (start < end).then_some(start..end)
    }

    /// 某个文件的完整期望内容
    pub fn expected_content(&self, index: usize) -> Vec<u8> {
        self.file_span(index).map(content_byte).collect()
    }

    pub fn files(&self) -> &[SwarmFile] {
        &self.files
    }

    /// 每次启动时的文件选择
    pub fn starts(&self) -> Vec<Option<Vec<usize>>> {
        self.state.lock().starts.clone()
    }

    pub fn removes(&self) -> usize {
        self.state.lock().removes
    }

    pub fn pauses(&self) -> usize {
        self.state.lock().pauses
    }

    /// 已返回的估算状态数
    pub fn estimated_served(&self) -> usize {
        self.state.lock().estimated
    }

    /// 观察到的本地同时存在的最大文件数
    pub fn peak_local_files(&self) -> usize {
        self.state.lock().peak_local_files
    }

    fn write_piece(&self, download: &SwarmDownload, piece: usize) -> Result<()> {
        let span = self.piece_span(piece);
        for &index in &download.selected {
            let file_span = self.file_span(index);
            let Some(part) = Self::intersect(&span, &file_span) else {
                continue;
            };
            let path = download.dir.join(&self.files[index].relative_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.seek(SeekFrom::Start(part.start - file_span.start))?;
            let data: Vec<u8> = part.clone().map(content_byte).collect();
            file.write_all(&data)?;
        }
        Ok(())
    }

    fn count_local_files(dir: &Path) -> usize {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    fn bitfield(done: &[bool]) -> String {
        let mut bytes = vec![0u8; done.len().div_ceil(8)];
        for (i, d) in done.iter().enumerate() {
            if *d {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        hex::encode(bytes)
    }

    fn metadata_status(polls: usize, limit: usize, follow: &Gid) -> EngineStatus {
        if polls > limit {
            return EngineStatus {
                followed_by: vec![follow.clone()],
                metadata_phase: true,
                ..status_complete(METADATA_LENGTH)
            };
        }
        EngineStatus {
            total_length: METADATA_LENGTH,
            completed_length: METADATA_LENGTH * polls as u64 / (limit as u64 + 1),
            download_speed: 1024,
            connections: 2,
            bitfield: Some("80".to_string()),
            piece_length: METADATA_LENGTH,
            metadata_phase: true,
            ..blank_status(EngineState::Active)
        }
    }

    /// 控制台进度的样子：大小按 512 字节取整，没有位图和文件列表
    fn estimate(status: &EngineStatus) -> EngineStatus {
        EngineStatus {
            total_length: status.total_length / 512 * 512,
            completed_length: status.completed_length / 512 * 512,
            download_speed: status.download_speed,
            connections: status.connections,
            estimated: true,
            ..blank_status(EngineState::Active)
        }
    }
}

#[async_trait]
impl DownloadEngine for FakeSwarm {
    async fn start(&self, request: StartRequest) -> Result<Gid> {
        let selected: Vec<usize> = match &request.select_files {
            Some(indexes) => indexes.iter().map(|i| i - 1).collect(),
            None => (0..self.files.len()).collect(),
        };

        let mut plan: Vec<usize> = (0..self.piece_count())
            .filter(|&p| {
                let span = self.piece_span(p);
                selected
                    .iter()
                    .any(|&i| Self::intersect(&span, &self.file_span(i)).is_some())
            })
            .collect();
        if self.order == PieceOrder::PairSwapped {
            for pair in plan.chunks_mut(2) {
                pair.reverse();
            }
        }

        let mut state = self.state.lock();
        state.next_gid += 1;
        let gid = format!("swarm{}", state.next_gid);
        state.starts.push(request.select_files.clone());
        let handle = if self.metadata_polls > 0 {
            let meta = format!("meta{}", state.next_gid);
            state.metadata.insert(
                meta.clone(),
                MetadataDownload {
                    polls: 0,
                    follow: gid.clone(),
                },
            );
            meta
        } else {
            gid.clone()
        };
        state.downloads.insert(
            gid.clone(),
            SwarmDownload {
                dir: request.dir.clone(),
                selected,
                plan,
                next: 0,
                done: vec![false; self.piece_count()],
                paused: false,
                removed: false,
            },
        );
        Ok(handle)
    }

    async fn status(&self, gid: &str) -> Result<EngineStatus> {
        let mut state = self.state.lock();
        state.queries += 1;
        if let Some(meta) = state.metadata.get_mut(gid) {
            meta.polls += 1;
            return Ok(Self::metadata_status(meta.polls, self.metadata_polls, &meta.follow));
        }
        let estimated = self
            .estimated_every
            .map(|every| state.queries % every == 0)
            .unwrap_or(false);

        let mut download = state
            .downloads
            .remove(gid)
            .ok_or_else(|| anyhow::anyhow!("unknown gid {}", gid))?;

        if download.removed {
            state.downloads.insert(gid.to_string(), download);
            return Ok(blank_status(EngineState::Removed));
        }

        if !download.paused && !estimated {
            let limit = self.stall_after.unwrap_or(usize::MAX).min(download.plan.len());
            let until = (download.next + self.pieces_per_poll).min(limit);
            while download.next < until {
                let piece = download.plan[download.next];
                self.write_piece(&download, piece)?;
                download.done[piece] = true;
                download.next += 1;
            }
        }

        let local_files = Self::count_local_files(&download.dir);
        state.peak_local_files = state.peak_local_files.max(local_files);

        let mut total = 0;
        let mut completed = 0;
        for &index in &download.selected {
            let file_span = self.file_span(index);
            total += file_span.end - file_span.start;
            for (piece, done) in download.done.iter().enumerate() {
                if *done {
                    if let Some(part) = Self::intersect(&self.piece_span(piece), &file_span) {
                        completed += part.end - part.start;
                    }
                }
            }
        }

        let finished = download.next >= download.plan.len();
        let status = EngineStatus {
            state: if finished {
                EngineState::Complete
            } else if download.paused {
                EngineState::Paused
            } else {
                EngineState::Active
            },
            total_length: total,
            completed_length: completed,
            download_speed: if download.paused { 0 } else { 4096 },
            connections: if download.paused { 0 } else { 5 },
            bitfield: Some(Self::bitfield(&download.done)),
            piece_length: self.piece_length,
            files: self
                .files
                .iter()
                .enumerate()
                .map(|(i, f)| FileEntry {
                    index: i + 1,
                    relative_path: f.relative_path.clone(),
                    size: f.size,
                })
                .collect(),
            error_code: Some("0".to_string()),
            error_message: None,
            followed_by: vec![],
            name: Some(self.name.clone()),
            metadata_phase: false,
            estimated: false,
        };
        state.downloads.insert(gid.to_string(), download);
        if estimated {
            state.estimated += 1;
            return Ok(Self::estimate(&status));
        }
        Ok(status)
    }

    async fn pause(&self, gid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.pauses += 1;
        if let Some(d) = state.downloads.get_mut(gid) {
            d.paused = true;
        }
        Ok(())
    }

    async fn unpause(&self, gid: &str) -> Result<()> {
        if let Some(d) = self.state.lock().downloads.get_mut(gid) {
            d.paused = false;
        }
        Ok(())
    }

    async fn remove(&self, gid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.removes += 1;
        if let Some(d) = state.downloads.get_mut(gid) {
            d.removed = true;
        }
        Ok(())
    }

    async fn probe_metadata(
        &self,
        _source: &str,
        _trackers: &[String],
        _timeout: Duration,
    ) -> Result<MetadataProbe> {
        if self.probe_fails {
            anyhow::bail!("metadata not available");
        }
        Ok(MetadataProbe {
            name: Some(self.name.clone()),
            total_length: Some(self.total_size()),
            declared_file_count: Some(self.files.len()),
            files: self
                .files
                .iter()
                .enumerate()
                .map(|(i, f)| FileEntry {
                    index: i + 1,
                    relative_path: f.relative_path.clone(),
                    size: f.size,
                })
                .collect(),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =====================================================
// 内存网盘
// =====================================================

#[derive(Debug)]
struct MemorySession {
    path: String,
    data: Vec<u8>,
    total: Option<u64>,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<String, Vec<u8>>,
    sessions: HashMap<String, MemorySession>,
    ranges: HashMap<String, Vec<Range<u64>>>,
    sessions_created: usize,
    bytes_received: u64,
    fail_at: Option<u64>,
}

/// 内存网盘：会话分段必须从 0 开始严格首尾相接
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    next_id: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 起点为 `offset` 的分段返回服务器错误
    pub fn fail_range_at(&self, offset: u64) {
        self.state.lock().fail_at = Some(offset);
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(path).cloned()
    }

    pub fn object_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state.lock().objects.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn ranges(&self, path: &str) -> Vec<Range<u64>> {
        self.state.lock().ranges.get(path).cloned().unwrap_or_default()
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().sessions_created
    }

    pub fn bytes_received(&self) -> u64 {
        self.state.lock().bytes_received
    }

    fn item(&self, path: &str) -> RemoteItem {
        RemoteItem {
            id: format!("item-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            path: path.to_string(),
        }
    }
}

fn rejected(status: u16, body: &str) -> PipelineError {
    PipelineError::Storage(HttpFailure::new(status, body).into())
}

#[async_trait]
impl ObjectStorage for MemoryStore {
    async fn put_small(&self, remote_path: &str, data: Vec<u8>) -> PipelineResult<RemoteItem> {
        let mut state = self.state.lock();
        state.bytes_received += data.len() as u64;
        state.objects.insert(remote_path.to_string(), data);
        drop(state);
        Ok(self.item(remote_path))
    }

    async fn create_upload_session(&self, remote_path: &str) -> PipelineResult<UploadSession> {
        let mut state = self.state.lock();
        state.sessions_created += 1;
        let url = format!("mem://session/{}", state.sessions_created);
        state.sessions.insert(
            url.clone(),
            MemorySession {
                path: remote_path.to_string(),
                data: Vec::new(),
                total: None,
            },
        );
        state.ranges.insert(remote_path.to_string(), Vec::new());
        Ok(UploadSession {
            url,
            remote_path: remote_path.to_string(),
        })
    }

    async fn upload_range(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        total: u64,
        data: Vec<u8>,
    ) -> PipelineResult<RangeOutcome> {
        let mut state = self.state.lock();
        if state.fail_at == Some(range.start) {
            return Err(rejected(500, "injected failure"));
        }
        let Some(mem) = state.sessions.get_mut(&session.url) else {
            return Err(rejected(404, "session not found"));
        };
        if range.start != mem.data.len() as u64 {
            return Err(rejected(416, "range not contiguous"));
        }
        if data.len() as u64 != range.end - range.start {
            return Err(rejected(400, "length mismatch"));
        }
        if *mem.total.get_or_insert(total) != total || range.end > total {
            return Err(rejected(400, "total mismatch"));
        }

        mem.data.extend_from_slice(&data);
        let finished = mem.data.len() as u64 == total;
        let path = mem.path.clone();
        let body = finished.then(|| std::mem::take(&mut mem.data));
        let next_expected = range.end;

        state.bytes_received += data.len() as u64;
        state.ranges.entry(path.clone()).or_default().push(range);

        match body {
            Some(body) => {
                state.sessions.remove(&session.url);
                state.objects.insert(path.clone(), body);
                drop(state);
                Ok(RangeOutcome::Completed(self.item(&path)))
            }
            None => Ok(RangeOutcome::Accepted { next_expected }),
        }
    }
}

// =====================================================
// 剩余空间
// =====================================================

/// 固定（可调）的剩余空间
#[derive(Debug)]
pub struct FixedFreeSpace(AtomicU64);

impl FixedFreeSpace {
    pub fn new(free: u64) -> Self {
        Self(AtomicU64::new(free))
    }

    pub fn set(&self, free: u64) {
        self.0.store(free, Ordering::SeqCst);
    }
}

impl FreeSpaceProbe for FixedFreeSpace {
    fn free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}
