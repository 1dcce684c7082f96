use graylag_common::store;
use graylag_common::whitelist;
use graylagd::config::{Config, SocketType};
use graylagd::error::ServeError;
use graylagd::server::{Listener, ServerState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        socket_type: SocketType::Inet,
        socket_path: dir.path().join("socket"),
        socket_mode: 0o660,
        listen_host: "127.0.0.1".to_owned(),
        listen_port: 0,
        listen_backlog: 5,
        reuse_socket: false,
        max_conns: 64,
        read_timeout: 5,
        grey_db: format!("sled://{}", dir.path().join("grey").display()),
        awl_db: format!("sled://{}", dir.path().join("awl").display()),
        grey_db_maintenance_disable: false,
        awl_db_maintenance_disable: false,
        wl_sources: Vec::new(),
        allow_wl_regex: false,
        hostname: "mx.test".to_owned(),
        delay: 60,
        retry_window: 172_800,
        max_age: 3_024_000,
        maintenance_interval: 3600,
        ipv4_mask: 20,
        ipv6_mask: 64,
        grey_action: "DEFER_IF_PERMIT".to_owned(),
        grey_text: "Greylisted, please retry in {wait} seconds".to_owned(),
        grey_smtp_header: "X-Greylist: delayed {delay} seconds at {hostname}; {date}".to_owned(),
        hash_keys: true,
        awl_client_count: 0,
        pid_file: None,
        metrics_addr: None,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<Result<(), ServeError>>,
}

pub async fn start_server(config: Config) -> TestServer {
    let grey_db = store::open(&config.grey_db).await.unwrap();
    let awl_db = if config.awl_client_count > 0 {
        Some(store::open(&config.awl_db).await.unwrap())
    } else {
        None
    };
    let state = Arc::new(ServerState::new(config.clone(), grey_db, awl_db));

    let set = whitelist::load_sources(&config.wl_sources, config.allow_wl_regex).await;
    state.whitelist.store(Arc::new(set));

    let listener = Listener::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(graylagd::run(listener, Arc::clone(&state), shutdown_rx));

    TestServer {
        addr,
        state,
        shutdown,
        handle,
    }
}

/// Sends raw bytes and returns everything the server answers before the
/// close.
pub async fn send_raw(addr: &SocketAddr, payload: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload.as_bytes()).await.unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

/// Sends a complete policy request for the canned client `192.0.2.44`.
pub async fn send_policy(addr: &SocketAddr, sender: &str, recipient: &str) -> String {
    let payload = format!(
        "request=smtpd_access_policy\n\
         protocol_state=RCPT\n\
         client_address=192.0.2.44\n\
         client_name=mail.example.com\n\
         sender={sender}\n\
         recipient={recipient}\n\
         \n"
    );
    send_raw(addr, &payload).await
}

/// Extracts the action from a rendered response line.
pub fn action(reply: &str) -> &str {
    reply
        .strip_prefix("action=")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .unwrap_or(reply)
}

/// The greylist key the canned [`send_policy`] tuple lands on.
pub fn canned_key(config: &Config, sender: &str, recipient: &str) -> String {
    graylag_common::keys::grey_key(
        "192.0.0.0/20",
        &graylag_common::keys::cleaned_sender(sender),
        recipient,
        config.hash_keys,
    )
}

/// A whitelist file with one literal recipient entry, as a source URL.
pub fn write_whitelist(dir: &tempfile::TempDir, recipient: &str) -> String {
    let path = dir.path().join("whitelist.json");
    std::fs::write(
        &path,
        format!(
            r#"{{"default": [{{"type": "recipient_literal", "recipient": "{recipient}"}}]}}"#
        ),
    )
    .unwrap();
    format!("file://{}", path.display())
}
