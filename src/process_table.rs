//! Process existence, creation time and session id lookups.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Read-only view of the system process table.
pub trait ProcessTable: Send + Sync {
    /// Creation time of a live process; `None` if it is gone or a zombie.
    fn create_time(&self, pid: u32) -> Option<SystemTime>;

    /// How much later than [`ProcessTable::create_time`] the process may
    /// really have started.
    fn create_time_resolution(&self) -> Duration {
        Duration::ZERO
    }

    /// Identity of the process currently holding `pid`. It never changes
    /// while the process lives, not even when the wall clock is stepped,
    /// and differs for a later process reusing the pid.
    fn start_token(&self, pid: u32) -> Option<u64>;

    /// Session id of a live process.
    fn session_id(&self, pid: u32) -> Option<u32>;

    fn exists(&self, pid: u32) -> bool {
        self.start_token(pid).is_some()
    }
}

/// `/proc` backed process table.
pub struct ProcFs {
    root: PathBuf,
    ticks_per_second: u64,
}

/// Fields of `/proc/<pid>/stat` the daemon needs.
#[derive(Debug, Clone, PartialEq)]
struct ProcStat {
    state: char,
    session: u32,
    start_ticks: u64,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root(Path::new("/proc"))
    }

    pub fn with_root(root: &Path) -> Self {
        // SAFETY: sysconf has no memory-safety preconditions.
        let ticks = unsafe { nix::libc::sysconf(nix::libc::_SC_CLK_TCK) };
        Self {
            root: root.to_path_buf(),
            ticks_per_second: if ticks > 0 { ticks as u64 } else { 100 },
        }
    }

    fn stat(&self, pid: u32) -> Option<ProcStat> {
        let path = self.root.join(pid.to_string()).join("stat");
        let content = std::fs::read_to_string(path).ok()?;
        parse_stat(&content)
    }

    /// Stat of a process that is neither a zombie nor dead.
    fn live_stat(&self, pid: u32) -> Option<ProcStat> {
        self.stat(pid)
            .filter(|stat| !matches!(stat.state, 'Z' | 'X'))
    }

    fn boot_time(&self) -> Option<u64> {
        let content = std::fs::read_to_string(self.root.join("stat")).ok()?;
        content
            .lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|value| value.trim().parse().ok())
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    /// Boot time plus start ticks. `btime` is truncated to whole seconds
    /// and moves when the wall clock is stepped, so this is only good for
    /// ordering against file times, never for identity.
    fn create_time(&self, pid: u32) -> Option<SystemTime> {
        let stat = self.live_stat(pid)?;
        let boot = self.boot_time()?;
        let since_boot = Duration::from_nanos(
            stat.start_ticks.saturating_mul(1_000_000_000) / self.ticks_per_second,
        );
        Some(UNIX_EPOCH + Duration::from_secs(boot) + since_boot)
    }

    /// One second of `btime` truncation plus one clock tick.
    fn create_time_resolution(&self) -> Duration {
        Duration::from_secs(1) + Duration::from_nanos(1_000_000_000 / self.ticks_per_second)
    }

    /// Start time in clock ticks since boot.
    fn start_token(&self, pid: u32) -> Option<u64> {
        self.live_stat(pid).map(|stat| stat.start_ticks)
    }

    fn session_id(&self, pid: u32) -> Option<u32> {
        self.live_stat(pid).map(|stat| stat.session)
    }
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<ProcStat> {
    let (_, rest) = content.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        session: fields.get(3)?.parse().ok()?,
        start_ticks: fields.get(19)?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "4242 (odd) name) S 1 4242 4100 0 -1 4194560 100 0 0 0 \
                          1 2 0 0 20 0 1 0 12345 1000 10 18446744073709551615";

    fn write_btime(dir: &TempDir, btime: u64) {
        let contents = format!("cpu 1 2 3\nbtime {}\n", btime);
        std::fs::write(dir.path().join("stat"), contents).unwrap();
    }

    fn fake_proc(dir: &TempDir, pid: u32, stat: &str) -> ProcFs {
        write_btime(dir, 1_700_000_000);
        let pid_dir = dir.path().join(pid.to_string());
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("stat"), stat).unwrap();
        let mut table = ProcFs::with_root(dir.path());
        table.ticks_per_second = 100;
        table
    }

    #[test]
    fn test_parse_stat_with_parenthesized_name() {
        let stat = parse_stat(SAMPLE).unwrap();
        assert_eq!(
            stat,
            ProcStat {
                state: 'S',
                session: 4100,
                start_ticks: 12345,
            }
        );
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        assert_eq!(parse_stat("12 (x) S 1 2"), None);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_create_time_from_boot_and_ticks() {
        let dir = TempDir::new().unwrap();
        let table = fake_proc(&dir, 4242, SAMPLE);
        let boot = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let expected = boot + Duration::from_millis(123_450);
        assert_eq!(table.create_time(4242), Some(expected));
        assert_eq!(table.session_id(4242), Some(4100));
        assert!(table.exists(4242));
        assert!(!table.exists(4243));
        assert_eq!(table.create_time_resolution(), Duration::from_millis(1010));
    }

    #[test]
    fn test_start_token_survives_clock_step() {
        let dir = TempDir::new().unwrap();
        let table = fake_proc(&dir, 4242, SAMPLE);
        let before = table.create_time(4242);
        assert_eq!(table.start_token(4242), Some(12345));

        write_btime(&dir, 1_700_000_002);
        assert_ne!(table.create_time(4242), before);
        assert_eq!(table.start_token(4242), Some(12345));
    }

    #[test]
    fn test_zombie_counts_as_gone() {
        let dir = TempDir::new().unwrap();
        let table = fake_proc(&dir, 4242, &SAMPLE.replace(") S ", ") Z "));
        assert_eq!(table.create_time(4242), None);
        assert_eq!(table.start_token(4242), None);
        assert_eq!(table.session_id(4242), None);
    }

    #[test]
    fn test_own_process_is_visible() {
        let table = ProcFs::new();
        let pid = std::process::id();
        let created = table.create_time(pid).unwrap();
        assert!(created <= SystemTime::now());
        let sid = nix::unistd::getsid(None).unwrap().as_raw() as u32;
        assert_eq!(table.session_id(pid), Some(sid));
    }
}
