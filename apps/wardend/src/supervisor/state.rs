use tokio::process::{Child, ChildStdin};
use warden_proto::proto::{ExitInfo, HealthSnapshot, ServerProcessState};

/// Observable run state. Guarded by a blocking mutex so `health()` never awaits.
#[derive(Debug, Clone)]
pub(crate) struct RunState {
    pub(crate) state: ServerProcessState,
    /// Bumped on every spawn; monitors exit once their run is superseded.
    pub(crate) run_id: u64,
    pub(crate) pid: Option<u32>,
    pub(crate) started_at_ms: Option<u64>,
    pub(crate) last_seen_alive_ms: Option<u64>,
    pub(crate) last_exit: Option<ExitInfo>,
    pub(crate) port_open: bool,
    pub(crate) memory_bytes: Option<u64>,
    pub(crate) cpu_percent: Option<f32>,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            state: ServerProcessState::Stopped,
            run_id: 0,
            pid: None,
            started_at_ms: None,
            last_seen_alive_ms: None,
            last_exit: None,
            port_open: false,
            memory_bytes: None,
            cpu_percent: None,
        }
    }

    /// Fields that only make sense while a process exists.
    pub(crate) fn clear_process(&mut self) {
        self.pid = None;
        self.port_open = false;
        self.memory_bytes = None;
        self.cpu_percent = None;
    }

    pub(crate) fn snapshot(&self, port: u16, now_ms: u64) -> HealthSnapshot {
        let uptime_ms = match (self.state.is_active(), self.started_at_ms) {
            (true, Some(start)) => Some(now_ms.saturating_sub(start)),
            _ => None,
        };
        HealthSnapshot {
            state: self.state,
            pid: self.pid,
            port,
            port_open: self.port_open,
            started_at_ms: self.started_at_ms,
            last_seen_alive_ms: self.last_seen_alive_ms,
            uptime_ms,
            last_exit: self.last_exit.clone(),
            memory_bytes: self.memory_bytes,
            cpu_percent: self.cpu_percent,
        }
    }
}

/// The OS handle of the managed process. Only the supervisor touches it.
pub(crate) struct ManagedChild {
    pub(crate) run_id: u64,
    pub(crate) child: Child,
    pub(crate) stdin: Option<ChildStdin>,
}

pub(crate) fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_only_while_a_process_is_active() {
        let mut run = RunState::new();
        run.started_at_ms = Some(1_000);
        assert_eq!(run.snapshot(42420, 5_000).uptime_ms, None);

        run.state = ServerProcessState::Running;
        let health = run.snapshot(42420, 5_000);
        assert_eq!(health.uptime_ms, Some(4_000));
        assert_eq!(health.port, 42420);

        run.state = ServerProcessState::Crashed;
        assert_eq!(run.snapshot(42420, 9_000).uptime_ms, None);
    }
}
