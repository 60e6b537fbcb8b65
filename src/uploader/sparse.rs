// 稀疏打洞：释放已上传区域占用的本地磁盘空间
//
// 文件长度保持不变（下载引擎仍在写入后面的分片），只回收 `range` 对应的数据块。
// 只在 Linux 上生效，其他平台为空操作。

use std::io;
use std::ops::Range;
use std::path::Path;

#[cfg(target_os = "linux")]
pub fn punch_hole(path: &Path, range: &Range<u64>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    if range.end <= range.start {
        return Ok(());
    }
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    let fd = file.as_raw_fd();
    let r = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            range.start as libc::off_t,
            (range.end - range.start) as libc::off_t,
        )
    };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole(_path: &Path, _range: &Range<u64>) -> io::Result<()> {
    Ok(())
}
