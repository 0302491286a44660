//! Process memory reporting for progress logs

use std::fs;

/// Resident set size of this process in bytes, from `/proc/self/status`.
///
/// `None` where procfs is unavailable.
pub fn resident_set_size() -> Option<usize> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

/// The `VmRSS:` line of a procfs status file, converted from kB to bytes.
pub fn parse_vm_rss(status: &str) -> Option<usize> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: usize = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

/// `bytes` in MiB for log lines.
pub fn mib(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// One log line: process RSS when known, plus the tensors the caller holds.
pub fn describe(tensor_bytes: usize) -> String {
    match resident_set_size() {
        Some(rss) => format!(
            "{:.1} MiB resident, {:.1} MiB in tensors",
            mib(rss),
            mib(tensor_bytes)
        ),
        None => format!("{:.1} MiB in tensors", mib(tensor_bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsae-rs\nVmPeak:\t  204800 kB\nVmRSS:\t   10240 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(10240 * 1024));
    }

    #[test]
    fn test_parse_vm_rss_missing_or_malformed() {
        assert_eq!(parse_vm_rss("Name:\tsae-rs\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\tlots kB\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\t12 MB\n"), None);
    }

    #[test]
    fn test_describe_mentions_tensor_bytes() {
        assert!(describe(3 * 1024 * 1024).contains("3.0 MiB in tensors"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_set_size_on_linux() {
        assert!(resident_set_size().unwrap() > 0);
    }
}
