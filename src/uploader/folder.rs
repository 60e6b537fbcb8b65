//! 下载产物扫描
//!
//! 递归遍历下载目录，列出需要上传的文件：
//! - 保留相对目录结构（用于构建远程路径）
//! - 跳过下载引擎的控制文件（`*.aria2`）和种子文件（`*.torrent`）
//! - 按相对路径排序

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// 跳过的扩展名
const SKIPPED_EXTENSIONS: &[&str] = &["aria2", "torrent"];

/// 文件扫描结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对于扫描根目录的路径，统一使用 `/` 分隔
    pub relative_path: String,
    /// 文件大小（字节）
    pub size: u64,
}

impl ScannedFile {
    /// 文件名（相对路径的最后一段）
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// 文件夹扫描器
#[derive(Debug, Default)]
pub struct FolderScanner;

impl FolderScanner {
    pub fn new() -> Self {
        Self
    }

    /// 递归扫描文件夹
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<ScannedFile>> {
        let root_path = root_path.as_ref();

        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root_path).follow_links(false) {
            let entry =
                entry.with_context(|| format!("读取目录失败: {}", root_path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if Self::is_skipped(path) {
                debug!("跳过控制文件: {}", path.display());
                continue;
            }

            let relative = path
                .strip_prefix(root_path)
                .with_context(|| format!("计算相对路径失败: {}", path.display()))?;
            let relative_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry
                .metadata()
                .with_context(|| format!("读取文件信息失败: {}", path.display()))?
                .len();

            files.push(ScannedFile {
                local_path: path.to_path_buf(),
                relative_path,
                size,
            });
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            files.len(),
            format_bytes(files.iter().map(|f| f.size).sum())
        );
        Ok(files)
    }

    fn is_skipped(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| SKIPPED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
