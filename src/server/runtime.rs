/// Container-aware CPU limit detection for sizing the tokio worker thread
/// pool.
///
/// Detection order:
/// 1. `GATEWAY_CPU_LIMIT` env var (explicit override, "4" or "4000m")
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. Fallback: `std::thread::available_parallelism()` (host CPU count)
///
/// Without this, tokio defaults to host CPU count, which over-provisions
/// threads when a container is limited to e.g. 4 cores on a 64-core host.
pub fn get_container_cpu_limit() -> usize {
    if let Ok(cpu_limit) = std::env::var("GATEWAY_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&cpu_limit) {
            let threads = cores.max(1);
            eprintln!(
                "[runtime] Using CPU limit from GATEWAY_CPU_LIMIT: {} threads",
                threads
            );
            return threads;
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            let threads = cores.max(1);
            eprintln!(
                "[runtime] Using CPU limit from cgroup v2: {} threads",
                threads
            );
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] Using system CPU count: {} threads", threads);
    threads
}

/// Parse CPU value — supports "4" (cores) or "4000m" (millicores) format.
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        let millis: usize = millis.parse().ok()?;
        return Some(millis.div_ceil(1000));
    }
    value.parse::<f64>().ok().map(|v| v.ceil() as usize)
}

/// Parse cgroup v2 `cpu.max` — "<quota> <period>" or "max <period>".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: f64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0.0 {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    Some((quota / period).ceil() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("2.5"), Some(3));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("2500m"), Some(3));
        assert_eq!(parse_cpu_value("nope"), None);
    }

    #[test]
    fn test_parse_cgroup_v2() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("150000 100000"), Some(2));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu("garbage"), None);
    }
}
