use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::debug;

use super::port;
use super::process::ProcessSupervisor;

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Per-run watcher: detects external death, caches the port check and samples usage.
/// Exits once the child of `run_id` is gone.
pub(super) fn spawn(supervisor: ProcessSupervisor, run_id: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new();
        loop {
            sleep(MONITOR_INTERVAL).await;

            let Some(pid) = supervisor.poll_child(run_id).await else {
                debug!("monitor for run {run_id} exiting");
                break;
            };
            let port_open = port::port_open(supervisor.port()).await;
            let usage = sample(&mut system, pid);
            supervisor.record_sample(run_id, port_open, usage);
        }
    })
}

fn sample(system: &mut System, pid: u32) -> Option<(u64, f32)> {
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| (process.memory(), process.cpu_usage()))
}
