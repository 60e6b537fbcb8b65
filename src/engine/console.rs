//! aria2c 控制台进度解析（后备数据源）
//!
//! 结构化的 RPC 状态查询是首选；只有 RPC 查询失败时才使用最近一次解析出的控制台进度。
//!
//! 典型行：
//! `[#d5ab3b 1.2GiB/4.0GiB(30%) CN:44 SD:12 DL:3.4MiB UL:0B(0B) ETA:12m]`

use regex::Regex;
use std::sync::OnceLock;

/// 控制台进度行解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleProgress {
    /// gid 前缀（控制台只显示前 6 位）
    pub gid_prefix: String,
    pub completed: u64,
    pub total: Option<u64>,
    pub percent: Option<u8>,
    pub connections: u32,
    pub seeders: u32,
    pub download_speed: u64,
}

fn progress_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\[#(?P<gid>[0-9a-f]+)\s+(?P<done>[\d.]+[KMGT]?i?B)(?:/(?P<total>[\d.]+[KMGT]?i?B)\((?P<pct>\d+)%\))?(?:\s+CN:(?P<cn>\d+))?(?:\s+SD:(?P<sd>\d+))?(?:\s+DL:(?P<dl>[\d.]+[KMGT]?i?B))?",
        )
        .ok()
    })
    .as_ref()
}

/// 解析 "1.2GiB" / "400.0KiB" / "0B" 为字节数
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let number_end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(number_end);
    let value: f64 = number.parse().ok()?;
    let multiplier = match unit {
        "B" | "" => 1u64,
        "KiB" | "KB" => 1 << 10,
        "MiB" | "MB" => 1 << 20,
        "GiB" | "GB" => 1 << 30,
        "TiB" | "TB" => 1 << 40,
        _ => return None,
    };
    Some((value * multiplier as f64) as u64)
}

/// 解析一行控制台输出，非进度行返回 None
pub fn parse_progress_line(line: &str) -> Option<ConsoleProgress> {
    let caps = progress_regex()?.captures(line)?;
    let completed = parse_size(caps.name("done")?.as_str())?;
    let total = caps.name("total").and_then(|m| parse_size(m.as_str()));
    let percent = caps.name("pct").and_then(|m| m.as_str().parse().ok());
    let connections = caps
        .name("cn")
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let seeders = caps
        .name("sd")
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let download_speed = caps
        .name("dl")
        .and_then(|m| parse_size(m.as_str()))
        .unwrap_or(0);

    Some(ConsoleProgress {
        gid_prefix: caps["gid"].to_string(),
        completed,
        total,
        percent,
        connections,
        seeders,
        download_speed,
    })
}
