use std::path::PathBuf;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep};
use warden_proto::proto::ServerProcessState;

use crate::config::PlayerPatterns;
use crate::supervisor::{LaunchSpec, LogStore, PlayerTracker, ProcessSupervisor};

/// Echoes console input, exits 0 on `/stop` and 3 on `crash`.
pub const CONSOLE_SCRIPT: &str = r#"while read line; do
  if [ "$line" = "/stop" ]; then exit 0; fi
  if [ "$line" = "crash" ]; then exit 3; fi
  echo "console: $line"
done"#;

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port()
}

pub fn sh_launch(script: &str, port: u16, startup: Duration) -> LaunchSpec {
    LaunchSpec {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), script.into()],
        cwd: None,
        port,
        stop_command: "/stop".into(),
        startup_timeout: startup,
    }
}

pub fn supervisor_for(launch: LaunchSpec) -> ProcessSupervisor {
    let players = PlayerTracker::new(&PlayerPatterns::default()).expect("patterns");
    let (events, _) = broadcast::channel(64);
    ProcessSupervisor::new(launch, LogStore::new(100), players, events)
}

/// Start the server and open its port once the process has been spawned.
pub async fn start_ready(sup: &ProcessSupervisor) -> TcpListener {
    let task = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.start(&[]).await })
    };
    let listener = open_port_later(sup.port()).await;
    let state = task.await.expect("join").expect("start");
    assert_eq!(state, ServerProcessState::Running);
    listener
}

/// Bind the fake server port after a short delay, as a real server would.
pub async fn open_port_later(port: u16) -> TcpListener {
    sleep(Duration::from_millis(300)).await;
    TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind server port")
}

pub async fn wait_for_state(sup: &ProcessSupervisor, want: ServerProcessState) {
    for _ in 0..50 {
        if sup.state() == want {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("state stayed {} instead of {want}", sup.state());
}
