use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, sleep, timeout};
use tracing::{info, warn};
use warden_proto::proto::{
    Event, ExitInfo, HealthSnapshot, LogStream, ServerProcessState, StateChange,
};

use super::logs::LogStore;
use super::monitor;
use super::players::PlayerTracker;
use super::port;
use super::state::{ManagedChild, RunState, exit_info};
use crate::config::ManagerConfig;
use crate::errors::ProcessError;
use crate::util::now_millis;

const STARTUP_POLL: Duration = Duration::from_millis(250);
/// How long each forced-termination signal gets before the next step.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub port: u16,
    pub stop_command: String,
    pub startup_timeout: Duration,
}

impl LaunchSpec {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            program: config.server_executable.clone(),
            args: config.launch_args(),
            cwd: config
                .server_executable
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from),
            port: config.port,
            stop_command: config.stop_command.clone(),
            startup_timeout: config.startup_timeout(),
        }
    }
}

/// Sole owner of the managed server process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    launch: LaunchSpec,
    run: Mutex<RunState>,
    child: tokio::sync::Mutex<Option<ManagedChild>>,
    // Held across start and stop so a second stop waits for the first and then no-ops.
    lifecycle: tokio::sync::Mutex<()>,
    logs: LogStore,
    players: PlayerTracker,
    events: broadcast::Sender<Event>,
}

impl ProcessSupervisor {
    pub fn new(
        launch: LaunchSpec,
        logs: LogStore,
        players: PlayerTracker,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launch,
                run: Mutex::new(RunState::new()),
                child: tokio::sync::Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                logs,
                players,
                events,
            }),
        }
    }

    fn run(&self) -> MutexGuard<'_, RunState> {
        self.inner.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerProcessState {
        self.run().state
    }

    pub fn health(&self) -> HealthSnapshot {
        self.run().snapshot(self.inner.launch.port, now_millis())
    }

    pub fn port(&self) -> u16 {
        self.inner.launch.port
    }

    pub fn players(&self) -> &PlayerTracker {
        &self.inner.players
    }

    pub fn logs(&self) -> &LogStore {
        &self.inner.logs
    }

    /// Spawn the server and wait until its port accepts connections.
    pub async fn start(&self, extra_args: &[String]) -> Result<ServerProcessState, ProcessError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let current = self.state();
        if !current.can_start() {
            return Err(ProcessError::AlreadyRunning(current));
        }

        let launch = &self.inner.launch;
        if port::port_in_use(launch.port).await {
            return Err(ProcessError::LaunchFailure(format!(
                "port {} is already in use",
                launch.port
            )));
        }

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &launch.cwd {
            cmd.current_dir(cwd);
        }

        self.inner.players.clear();
        let mut child = cmd.spawn().map_err(|err| {
            ProcessError::LaunchFailure(format!("{}: {err}", launch.program.display()))
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();
        self.attach_output(&mut child);

        let now = now_millis();
        let run_id = {
            let mut run = self.run();
            run.run_id += 1;
            run.clear_process();
            run.pid = pid;
            run.started_at_ms = Some(now);
            run.last_seen_alive_ms = Some(now);
            run.last_exit = None;
            run.run_id
        };
        *self.inner.child.lock().await = Some(ManagedChild {
            run_id,
            child,
            stdin,
        });
        self.transition(ServerProcessState::Starting);
        info!("server spawned: pid={pid:?} port={}", launch.port);

        self.wait_ready(run_id).await?;

        self.transition(ServerProcessState::Running);
        info!("server ready on port {}", launch.port);
        monitor::spawn(self.clone(), run_id);
        Ok(ServerProcessState::Running)
    }

    async fn wait_ready(&self, run_id: u64) -> Result<(), ProcessError> {
        let launch = &self.inner.launch;
        let deadline = Instant::now() + launch.startup_timeout;
        loop {
            let exited = {
                let mut guard = self.inner.child.lock().await;
                match guard.as_mut() {
                    Some(managed) if managed.run_id == run_id => match managed.child.try_wait() {
                        Ok(Some(status)) => {
                            guard.take();
                            Some(exit_info(status))
                        }
                        Ok(None) => None,
                        Err(err) => {
                            warn!("failed to poll server during startup: {err}");
                            None
                        }
                    },
                    _ => {
                        return Err(ProcessError::LaunchFailure(
                            "server process handle lost during startup".into(),
                        ));
                    }
                }
            };
            if let Some(exit) = exited {
                warn!("server exited during startup ({exit})");
                self.mark_exited(ServerProcessState::Crashed, Some(exit.clone()));
                return Err(ProcessError::LaunchFailure(format!(
                    "server exited during startup ({exit})"
                )));
            }

            if port::port_open(launch.port).await {
                let mut run = self.run();
                run.port_open = true;
                run.last_seen_alive_ms = Some(now_millis());
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    "server did not open port {} within {:?}, terminating",
                    launch.port, launch.startup_timeout
                );
                let managed = self.inner.child.lock().await.take();
                let exit = match managed {
                    Some(mut managed) => match force_terminate(&mut managed.child).await {
                        Ok(exit) => Some(exit),
                        Err(err) => {
                            warn!("failed to terminate unready server: {err}");
                            None
                        }
                    },
                    None => None,
                };
                self.mark_exited(ServerProcessState::Crashed, exit);
                return Err(ProcessError::StartupTimeout(launch.startup_timeout));
            }

            sleep(STARTUP_POLL).await;
        }
    }

    /// Stop the server. Always ends in Stopped; already-stopped is a no-op.
    pub async fn stop(
        &self,
        graceful: bool,
        grace: Duration,
    ) -> Result<Option<ExitInfo>, ProcessError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.state() {
            ServerProcessState::Stopped => return Ok(None),
            ServerProcessState::Crashed => {
                info!("acknowledging crashed server");
                self.transition(ServerProcessState::Stopped);
                return Ok(self.run().last_exit.clone());
            }
            _ => {}
        }

        self.transition(ServerProcessState::Stopping);
        let Some(mut managed) = self.inner.child.lock().await.take() else {
            self.mark_exited(ServerProcessState::Stopped, None);
            return Ok(None);
        };

        let mut exit = None;
        if graceful {
            match write_line(&mut managed, &self.inner.launch.stop_command).await {
                Ok(()) => match timeout(grace, managed.child.wait()).await {
                    Ok(Ok(status)) => exit = Some(exit_info(status)),
                    Ok(Err(err)) => warn!("failed waiting for server exit: {err}"),
                    Err(_) => warn!("server did not exit within {grace:?}, escalating"),
                },
                Err(err) => warn!("failed to send stop command, escalating: {err}"),
            }
        }

        let result = match exit {
            Some(exit) => Ok(exit),
            None => force_terminate(&mut managed.child).await,
        };
        match result {
            Ok(exit) => {
                info!("server stopped ({exit})");
                self.mark_exited(ServerProcessState::Stopped, Some(exit.clone()));
                Ok(Some(exit))
            }
            Err(err) => {
                warn!("server termination not observed: {err}");
                self.mark_exited(ServerProcessState::Stopped, None);
                Err(err)
            }
        }
    }

    /// Write one line to the server console.
    pub async fn send_command(&self, line: &str) -> Result<(), ProcessError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.contains(['\r', '\n']) {
            return Err(ProcessError::InvalidConsoleLine);
        }
        if self.state() != ServerProcessState::Running {
            return Err(ProcessError::NotRunning);
        }
        let mut guard = self.inner.child.lock().await;
        let managed = guard.as_mut().ok_or(ProcessError::NotRunning)?;
        write_line(managed, line).await
    }

    fn attach_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let logs = self.inner.logs.clone();
            let players = self.inner.players.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    players.observe(&line);
                    logs.push_server(LogStream::Stdout, line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let logs = self.inner.logs.clone();
            let players = self.inner.players.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    players.observe(&line);
                    logs.push_server(LogStream::Stderr, line);
                }
            });
        }
    }

    /// Check the child of `run_id` for an external exit. Returns its pid while alive.
    pub(super) async fn poll_child(&self, run_id: u64) -> Option<u32> {
        let mut guard = self.inner.child.lock().await;
        let managed = guard.as_mut().filter(|m| m.run_id == run_id)?;
        match managed.child.try_wait() {
            Ok(None) => managed.child.id(),
            Ok(Some(status)) => {
                guard.take();
                drop(guard);
                let exit = exit_info(status);
                let crashed = {
                    let mut run = self.run();
                    if run.run_id == run_id && run.state == ServerProcessState::Running {
                        run.clear_process();
                        run.last_exit = Some(exit.clone());
                        true
                    } else {
                        false
                    }
                };
                if crashed {
                    warn!("server crashed ({exit})");
                    self.inner.players.clear();
                    self.transition(ServerProcessState::Crashed);
                }
                None
            }
            Err(err) => {
                warn!("failed to poll server process: {err}");
                managed.child.id()
            }
        }
    }

    pub(super) fn record_sample(&self, run_id: u64, port_open: bool, usage: Option<(u64, f32)>) {
        let mut run = self.run();
        if run.run_id != run_id || run.state != ServerProcessState::Running {
            return;
        }
        run.port_open = port_open;
        run.last_seen_alive_ms = Some(now_millis());
        run.memory_bytes = usage.map(|(memory, _)| memory);
        run.cpu_percent = usage.map(|(_, cpu)| cpu);
    }

    fn mark_exited(&self, to: ServerProcessState, exit: Option<ExitInfo>) {
        {
            let mut run = self.run();
            run.clear_process();
            if exit.is_some() {
                run.last_exit = exit;
            }
        }
        self.inner.players.clear();
        self.transition(to);
    }

    fn transition(&self, to: ServerProcessState) {
        let from = std::mem::replace(&mut self.run().state, to);
        if from != to {
            let _ = self.inner.events.send(Event::State(StateChange {
                from,
                to,
                at_ms: now_millis(),
            }));
        }
    }
}

async fn write_line(managed: &mut ManagedChild, line: &str) -> Result<(), ProcessError> {
    let stdin = managed.stdin.as_mut().ok_or(ProcessError::NotRunning)?;
    stdin
        .write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|source| ProcessError::Io {
            context: "writing to server console",
            source,
        })?;
    stdin.flush().await.map_err(|source| ProcessError::Io {
        context: "flushing server console",
        source,
    })
}

/// SIGTERM first on unix, then a hard kill.
async fn force_terminate(child: &mut Child) -> Result<ExitInfo, ProcessError> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: the pid belongs to our unreaped child, so it cannot have been recycled.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(Ok(status)) = timeout(KILL_GRACE, child.wait()).await {
            return Ok(exit_info(status));
        }
        warn!("server ignored SIGTERM, killing");
    }

    child.start_kill().map_err(|source| ProcessError::Io {
        context: "killing server",
        source,
    })?;
    match timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => Ok(exit_info(status)),
        Ok(Err(source)) => Err(ProcessError::Io {
            context: "waiting for killed server",
            source,
        }),
        Err(_) => Err(ProcessError::ShutdownTimeout(KILL_GRACE)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{
        CONSOLE_SCRIPT, free_port, sh_launch, start_ready, supervisor_for, wait_for_state,
    };
    use tokio::net::TcpListener;

    fn supervisor(script: &str, port: u16, startup: Duration) -> ProcessSupervisor {
        supervisor_for(sh_launch(script, port, startup))
    }

    #[tokio::test]
    async fn start_refuses_a_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let sup = supervisor(CONSOLE_SCRIPT, port, Duration::from_secs(5));

        let err = sup.start(&[]).await.unwrap_err();
        assert!(matches!(err, ProcessError::LaunchFailure(msg) if msg.contains("in use")));
        assert_eq!(sup.state(), ServerProcessState::Stopped);
        assert!(sup.health().pid.is_none());
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_failure() {
        let mut spec = sh_launch(CONSOLE_SCRIPT, free_port(), Duration::from_secs(5));
        spec.program = PathBuf::from("/definitely/not/here");
        let sup = supervisor_for(spec);
        let err = sup.start(&[]).await.unwrap_err();
        assert!(matches!(err, ProcessError::LaunchFailure(_)));
        assert_eq!(sup.state(), ServerProcessState::Stopped);
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_spawning() {
        let sup = supervisor(CONSOLE_SCRIPT, free_port(), Duration::from_secs(10));
        let _listener = start_ready(&sup).await;
        let pid = sup.health().pid;

        let err = sup.start(&[]).await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning(ServerProcessState::Running)));
        assert_eq!(sup.health().pid, pid);

        let exit = sup.stop(true, Duration::from_secs(5)).await.expect("stop");
        assert_eq!(exit.and_then(|e| e.code), Some(0));
        assert_eq!(sup.state(), ServerProcessState::Stopped);
    }

    #[tokio::test]
    async fn console_lines_reach_the_server() {
        let sup = supervisor(CONSOLE_SCRIPT, free_port(), Duration::from_secs(10));
        let _listener = start_ready(&sup).await;
        let mut rx = sup.logs().server_subscribe();

        sup.send_command("/list").await.expect("send");
        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("output in time")
            .expect("line");
        assert_eq!(line.line, "console: /list");

        assert!(matches!(
            sup.send_command("a\nb").await,
            Err(ProcessError::InvalidConsoleLine)
        ));
        sup.stop(true, Duration::from_secs(5)).await.expect("stop");
        assert!(matches!(sup.send_command("/list").await, Err(ProcessError::NotRunning)));
    }

    #[tokio::test]
    async fn external_death_is_a_crash() {
        let sup = supervisor(CONSOLE_SCRIPT, free_port(), Duration::from_secs(10));
        let mut events = sup.inner.events.subscribe();
        let _listener = start_ready(&sup).await;

        sup.send_command("crash").await.expect("send");
        wait_for_state(&sup, ServerProcessState::Crashed).await;
        assert_eq!(sup.health().last_exit.and_then(|e| e.code), Some(3));

        let mut saw_crash = false;
        while let Ok(event) = events.try_recv() {
            if let Event::State(change) = event {
                saw_crash |= change.from == ServerProcessState::Running
                    && change.to == ServerProcessState::Crashed;
            }
        }
        assert!(saw_crash);

        // Stopping a crashed server acknowledges it.
        sup.stop(true, Duration::from_secs(1)).await.expect("stop");
        assert_eq!(sup.state(), ServerProcessState::Stopped);
    }

    #[tokio::test]
    async fn startup_timeout_kills_and_marks_crashed() {
        let sup = supervisor("sleep 30", free_port(), Duration::from_secs(1));
        let err = sup.start(&[]).await.unwrap_err();
        assert!(matches!(err, ProcessError::StartupTimeout(_)));
        assert_eq!(sup.state(), ServerProcessState::Crashed);
        assert!(sup.health().pid.is_none());
    }

    #[tokio::test]
    async fn graceful_stop_escalates_to_kill() {
        let script = "trap '' TERM; while true; do sleep 1; done";
        let sup = supervisor(script, free_port(), Duration::from_secs(10));
        let _listener = start_ready(&sup).await;

        let exit = sup
            .stop(true, Duration::from_millis(500))
            .await
            .expect("stop")
            .expect("exit info");
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(sup.state(), ServerProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let sup = supervisor(CONSOLE_SCRIPT, free_port(), Duration::from_secs(5));
        assert!(sup.stop(true, Duration::from_secs(1)).await.expect("stop").is_none());
        assert_eq!(sup.state(), ServerProcessState::Stopped);
    }
}
