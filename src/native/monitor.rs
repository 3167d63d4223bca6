//! Resource sampling for a whole process group from `/proc`.

use std::fs;

/// Usage summed over every live process of one group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupUsage {
    pub processes: usize,
    pub rss_bytes: u64,
    pub cpu_time_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StatFields {
    pgrp: i32,
    /// utime + stime + cutime + cstime, in clock ticks.
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Blocking; callers run it on the blocking pool.
pub fn sample_group(pgid: i32) -> GroupUsage {
    let Ok(entries) = fs::read_dir("/proc") else {
        return GroupUsage::default();
    };
    let page_size = sysconf(libc::_SC_PAGESIZE).unwrap_or(4096);
    let ticks_per_second = sysconf(libc::_SC_CLK_TCK).unwrap_or(100);

    let mut usage = GroupUsage::default();
    let mut cpu_ticks = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Processes may exit between listing and reading.
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some(fields) = parse_stat(&stat) else {
            continue;
        };
        if fields.pgrp != pgid {
            continue;
        }
        usage.processes += 1;
        usage.rss_bytes += fields.rss_pages * page_size;
        cpu_ticks += fields.cpu_ticks;
    }
    usage.cpu_time_ms = cpu_ticks * 1000 / ticks_per_second.max(1);
    usage
}

fn parse_stat(stat: &str) -> Option<StatFields> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let number = |index: usize| fields.get(index)?.parse::<u64>().ok();

    Some(StatFields {
        pgrp: fields.get(2)?.parse().ok()?,
        cpu_ticks: number(11)? + number(12)? + number(13)? + number(14)?,
        rss_pages: number(21)?,
    })
}

fn sysconf(name: libc::c_int) -> Option<u64> {
    let value = unsafe { libc::sysconf(name) };
    (value > 0).then_some(value as u64)
}
