//! 分片可用性闸门（仅 Streaming 模式）
//!
//! 把引擎报告的分片完成位图转换为“可安全上传的连续前缀”：
//! 只统计从第 0 片开始连续完成的分片，遇到第一个未完成分片即停止，
//! 之后零散完成的分片一律不计入。

use anyhow::{Context, Result};
use bit_set::BitSet;
use tracing::debug;

/// 分片完成位图（高位在前，与 aria2 的 bitfield 一致）
#[derive(Debug, Clone, Default)]
pub struct PieceBitmap {
    bits: BitSet,
}

impl PieceBitmap {
    /// 从原始字节构建
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: BitSet::from_bytes(bytes),
        }
    }

    /// 从十六进制字符串构建，如 "ff80"
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.trim();
        // 奇数长度时补一个 0 半字节
        let bytes = if hex_str.len() % 2 == 1 {
            hex::decode(format!("{}0", hex_str))
        } else {
            hex::decode(hex_str)
        }
        .with_context(|| format!("无法解析分片位图: {}", hex_str))?;
        Ok(Self::from_bytes(&bytes))
    }

    /// 从 0/1 字符串构建
    #[cfg(test)]
    pub(crate) fn from_bit_str(bits: &str) -> Self {
        let mut set = BitSet::new();
        for (i, c) in bits.chars().enumerate() {
            if c == '1' {
                set.insert(i);
            }
        }
        Self { bits: set }
    }

    /// 从第 0 片开始连续完成的分片数（最多统计 limit 片）
    pub fn leading_run(&self, limit: usize) -> usize {
        (0..limit).take_while(|&i| self.bits.contains(i)).count()
    }

    /// 已完成分片总数（含前缀之后的零散分片）
    #[cfg(test)]
    fn completed_count(&self, limit: usize) -> usize {
        self.bits.iter().take_while(|&i| i < limit).count()
    }
}

/// 计算可上传前缀
///
/// 返回 `min(前导连续完成分片数 * piece_length, total_size)`
pub fn uploadable_prefix(bitmap: &PieceBitmap, piece_length: u64, total_size: u64) -> u64 {
    if piece_length == 0 || total_size == 0 {
        return 0;
    }
    let piece_count = total_size.div_ceil(piece_length) as usize;
    let run = bitmap.leading_run(piece_count) as u64;
    run.saturating_mul(piece_length).min(total_size)
}

/// 可用性闸门
///
/// 保证对外授权的前缀只增不减
#[derive(Debug)]
pub struct PieceGate {
    piece_length: u64,
    total_size: u64,
    authorized: u64,
}

impl PieceGate {
    pub fn new(piece_length: u64, total_size: u64) -> Self {
        Self {
            piece_length,
            total_size,
            authorized: 0,
        }
    }

    /// 当前已授权的前缀
    pub fn authorized(&self) -> u64 {
        self.authorized
    }

    /// 引擎在元数据阶段之后才报告分片大小，这里允许延迟设置
    pub fn set_piece_length(&mut self, piece_length: u64) {
        if self.piece_length == 0 && piece_length > 0 {
            self.piece_length = piece_length;
        }
    }

    /// 用最新位图推进前缀
    pub fn advance(&mut self, bitmap: &PieceBitmap) -> u64 {
        let prefix = uploadable_prefix(bitmap, self.piece_length, self.total_size);
        if prefix > self.authorized {
            debug!(
                "可上传前缀推进: {} -> {} bytes (总大小 {})",
                self.authorized, prefix, self.total_size
            );
            self.authorized = prefix;
        }
        self.authorized
    }

    /// 下载完成后整个文件都可上传
    pub fn complete(&mut self) -> u64 {
        self.authorized = self.total_size;
        self.authorized
    }
}
