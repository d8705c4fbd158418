use std::io;
use std::net::TcpListener;
#[cfg(target_os = "linux")]
use std::path::Path;

/// Minimal view of `/proc/[pid]/stat`.
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub starttime: u64,
}

/// Parse `/proc/[pid]/stat` and extract `starttime` (field 22 / index 21).
///
/// The command name (field 2) may contain spaces, so parsing starts after the
/// closing parenthesis.
#[cfg(target_os = "linux")]
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let path = format!("/proc/{}/stat", pid);
    let content = std::fs::read_to_string(&path)?;
    let after_comm = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Malformed stat line in {}", path),
            )
        })?;

    // `after_comm` starts at field 3 (state), so starttime sits at index 19.
    let starttime = after_comm
        .split_whitespace()
        .nth(19)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Missing starttime field in {}", path),
            )
        })?
        .parse::<u64>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse starttime in {}: {}", path, err),
            )
        })?;

    Ok(ProcStat { starttime })
}

#[cfg(not(target_os = "linux"))]
pub fn read_proc_stat(_pid: u32) -> io::Result<ProcStat> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process start time is only available on Linux",
    ))
}

/// Check for existence of a process in `/proc`.
#[cfg(target_os = "linux")]
pub fn process_exists(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

/// Probe with signal 0: delivery succeeds (or is merely forbidden) only when
/// the pid exists.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a portable probe, never report a process as gone: a dead pid is the
/// only death signal the supervisor acts on.
#[cfg(not(unix))]
pub fn process_exists(pid: u32) -> bool {
    pid != 0
}

/// A recorded process is alive when its pid exists and, if the start time was
/// captured, the kernel start time still matches (the pid was not recycled).
pub fn process_alive(pid: u32, start_ticks: Option<u64>) -> bool {
    if !process_exists(pid) {
        return false;
    }
    match (start_ticks, read_proc_stat(pid)) {
        (Some(expected), Ok(stat)) => stat.starttime == expected,
        (Some(_), Err(_)) => !cfg!(target_os = "linux"),
        (None, _) => true,
    }
}

/// Ask a process to exit (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kill a process outright (SIGKILL).
#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to signal pid 0",
        ));
    }
    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> io::Result<()> {
    force_kill(pid)
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ))
    }
}

/// Reserve a free TCP port on `host` by binding port 0 and releasing it.
pub fn find_free_port(host: &str) -> io::Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_read_proc_stat_self() {
        let pid = std::process::id();
        let stat = read_proc_stat(pid).expect("Failed to read own stat");
        assert!(stat.starttime > 0);
    }

    #[test]
    fn test_process_alive_checks_start_ticks() {
        let pid = std::process::id();
        let ticks = read_proc_stat(pid).unwrap().starttime;
        assert!(process_alive(pid, Some(ticks)));
        assert!(process_alive(pid, None));
        assert!(!process_alive(pid, Some(ticks + 1)));
    }

    #[test]
    fn test_process_exists_invalid() {
        assert!(!process_exists(0));
        assert!(!process_exists(999_999_999));
    }

    #[test]
    fn test_find_free_port_is_bindable() {
        let port = find_free_port("127.0.0.1").expect("free port");
        assert!(port > 0);
        TcpListener::bind(("127.0.0.1", port)).expect("port should be free again");
    }
}
