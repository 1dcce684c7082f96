use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the greylisting policy daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "graylagd")]
#[command(about = "Greylisting policy daemon")]
#[command(version)]
pub struct Args {
    /// Listener type: a filesystem stream socket or a TCP endpoint.
    #[arg(long, value_enum, default_value = "unix", env = "GRAYLAG_SOCKET_TYPE")]
    pub socket_type: SocketType,
    /// Path for the unix listener. Must not pre-exist at bind time.
    #[arg(long, default_value = "/var/run/graylag/socket", env = "GRAYLAG_SOCKET_PATH")]
    pub socket_path: PathBuf,
    /// Octal filesystem mode for the unix listener.
    #[arg(long, default_value = "0660", env = "GRAYLAG_SOCKET_MODE")]
    pub socket_mode: String,
    /// Host (name or IP) for the TCP listener.
    #[arg(long, default_value = "localhost", env = "GRAYLAG_LISTEN_HOST")]
    pub listen_host: String,
    /// Port for the TCP listener.
    #[arg(long, default_value_t = 10023, env = "GRAYLAG_LISTEN_PORT")]
    pub listen_port: u16,
    /// Listen queue depth for the TCP listener.
    #[arg(long, default_value_t = 5, env = "GRAYLAG_LISTEN_BACKLOG")]
    pub listen_backlog: u32,
    /// Whether to set SO_REUSEADDR on the TCP listener.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "GRAYLAG_REUSE_SOCKET")]
    pub reuse_socket: bool,
    /// Maximum concurrent connections being serviced.
    #[arg(long, default_value_t = 256, env = "GRAYLAG_MAX_CONNS")]
    pub max_conns: usize,
    /// Per-connection read deadline in seconds.
    #[arg(long, default_value_t = 30, env = "GRAYLAG_READ_TIMEOUT")]
    pub read_timeout: u64,
    /// URL for the greylisting store.
    #[arg(long, default_value = "sled:///var/db/graylag/greylistdb", env = "GRAYLAG_GREY_DB")]
    pub grey_db: String,
    /// URL for the auto-whitelist store.
    #[arg(long, default_value = "sled:///var/db/graylag/autowldb", env = "GRAYLAG_AWL_DB")]
    pub awl_db: String,
    /// Skip expiry sweeps of the greylist store on this instance.
    #[arg(long, env = "GRAYLAG_GREY_DB_MAINTENANCE_DISABLE")]
    pub grey_db_maintenance_disable: bool,
    /// Skip expiry sweeps of the auto-whitelist store on this instance.
    #[arg(long, env = "GRAYLAG_AWL_DB_MAINTENANCE_DISABLE")]
    pub awl_db_maintenance_disable: bool,
    /// Whitelist source URL (file:// or redis-*://). May be repeated.
    #[arg(
        long = "wl-source",
        default_value = "file:///var/db/graylag/whitelist",
        env = "GRAYLAG_WL_SOURCES",
        value_delimiter = ','
    )]
    pub wl_sources: Vec<String>,
    /// Honor regex-typed whitelist entries from the sources.
    #[arg(long, env = "GRAYLAG_ALLOW_WL_REGEX")]
    pub allow_wl_regex: bool,
    /// Hostname presented in prepended headers; defaults to the system's.
    #[arg(long, env = "GRAYLAG_HOSTNAME")]
    pub hostname: Option<String>,
    /// Greylisting delay in seconds.
    #[arg(long, default_value_t = 300, env = "GRAYLAG_DELAY")]
    pub delay: i64,
    /// Seconds a pending entry may wait for its retry before the delay
    /// clock restarts from the retrying request.
    #[arg(long, default_value_t = 172_800, env = "GRAYLAG_RETRY_WINDOW")]
    pub retry_window: i64,
    /// Seconds after which an idle entry is expired by the sweeper.
    #[arg(long, default_value_t = 3_024_000, env = "GRAYLAG_MAX_AGE")]
    pub max_age: i64,
    /// Seconds between maintenance sweeps.
    #[arg(long, default_value_t = 3600, env = "GRAYLAG_MAINTENANCE_INTERVAL")]
    pub maintenance_interval: u64,
    /// Prefix length used to normalize IPv4 client addresses.
    #[arg(long, default_value_t = 20, env = "GRAYLAG_IPV4_MASK")]
    pub ipv4_mask: u8,
    /// Prefix length used to normalize IPv6 client addresses.
    #[arg(long, default_value_t = 64, env = "GRAYLAG_IPV6_MASK")]
    pub ipv6_mask: u8,
    /// Verb used to defer a greylisted request.
    #[arg(long, default_value = "DEFER_IF_PERMIT", env = "GRAYLAG_GREY_ACTION")]
    pub grey_action: String,
    /// Text sent with a deferral; `{wait}` renders the remaining delay.
    #[arg(
        long,
        default_value = "Greylisted, please retry in {wait} seconds",
        env = "GRAYLAG_GREY_TEXT"
    )]
    pub grey_text: String,
    /// Header prepended on first pass; `{delay}`, `{hostname}` and `{date}`
    /// are substituted.
    #[arg(
        long,
        default_value = "X-Greylist: delayed {delay} seconds at {hostname}; {date}",
        env = "GRAYLAG_GREY_SMTP_HEADER"
    )]
    pub grey_smtp_header: String,
    /// Store hex SHA-1 digests of keys instead of the literal strings.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "GRAYLAG_HASH_KEYS")]
    pub hash_keys: bool,
    /// Passes after which a sender network is trusted directly.
    /// 0 disables the auto-whitelist.
    #[arg(long, default_value_t = 0, env = "GRAYLAG_AWL_CLIENT_COUNT")]
    pub awl_client_count: u64,
    /// Write the process id here at startup; refuses to clobber.
    #[arg(long, env = "GRAYLAG_PID_FILE")]
    pub pid_file: Option<PathBuf>,
    /// Serve prometheus metrics and health probes on this address.
    #[arg(long, env = "GRAYLAG_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Which kind of listener the server binds.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Filesystem stream socket.
    Unix,
    /// TCP endpoint.
    Inet,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener type.
    pub socket_type: SocketType,
    /// Path for the unix listener.
    pub socket_path: PathBuf,
    /// Filesystem mode for the unix listener.
    pub socket_mode: u32,
    /// Host for the TCP listener.
    pub listen_host: String,
    /// Port for the TCP listener.
    pub listen_port: u16,
    /// Listen queue depth.
    pub listen_backlog: u32,
    /// Whether SO_REUSEADDR is set.
    pub reuse_socket: bool,
    /// Maximum concurrent connections.
    pub max_conns: usize,
    /// Per-connection read deadline in seconds.
    pub read_timeout: u64,
    /// Greylisting store URL.
    pub grey_db: String,
    /// Auto-whitelist store URL.
    pub awl_db: String,
    /// Skip greylist sweeps here.
    pub grey_db_maintenance_disable: bool,
    /// Skip auto-whitelist sweeps here.
    pub awl_db_maintenance_disable: bool,
    /// Whitelist source URLs.
    pub wl_sources: Vec<String>,
    /// Honor regex-typed whitelist entries.
    pub allow_wl_regex: bool,
    /// Hostname for prepended headers.
    pub hostname: String,
    /// Greylisting delay in seconds.
    pub delay: i64,
    /// Retry window in seconds.
    pub retry_window: i64,
    /// Entry retention in seconds.
    pub max_age: i64,
    /// Seconds between sweeps.
    pub maintenance_interval: u64,
    /// IPv4 normalization prefix length.
    pub ipv4_mask: u8,
    /// IPv6 normalization prefix length.
    pub ipv6_mask: u8,
    /// Deferral verb.
    pub grey_action: String,
    /// Deferral text template.
    pub grey_text: String,
    /// First-pass header template.
    pub grey_smtp_header: String,
    /// Hash store keys with SHA-1.
    pub hash_keys: bool,
    /// Auto-whitelist threshold; 0 disables.
    pub awl_client_count: u64,
    /// PID file path, if any.
    pub pid_file: Option<PathBuf>,
    /// Metrics endpoint, if any.
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.socket_type == SocketType::Unix && self.socket_path.as_os_str().is_empty() {
            return Err("socket_path must not be empty for a unix listener".to_string());
        }
        if self.socket_mode > 0o7777 {
            return Err("socket_mode is not a sane octal mode".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.read_timeout == 0 {
            return Err("read_timeout must be greater than 0".to_string());
        }

        if self.ipv4_mask > 32 {
            return Err("ipv4_mask exceeds 32 bits".to_string());
        }
        if self.ipv6_mask > 128 {
            return Err("ipv6_mask exceeds 128 bits".to_string());
        }

        if self.delay < 0 {
            return Err("delay must not be negative".to_string());
        }
        if self.retry_window <= self.delay {
            return Err("retry_window must be longer than delay".to_string());
        }
        if self.max_age < 0 {
            return Err("max_age must not be negative".to_string());
        }
        if self.maintenance_interval == 0 {
            return Err("maintenance_interval must be greater than 0".to_string());
        }

        if self.grey_action.is_empty() {
            return Err("grey_action must not be empty".to_string());
        }
        if self.hostname.is_empty() {
            return Err("hostname must not be empty".to_string());
        }

        if self.awl_client_count > 0 && self.grey_db == self.awl_db {
            // Keys are derived differently so they do not collide, but one
            // database serving both spaces is unsupported territory.
            tracing::warn!("grey_db and awl_db point at the same database");
        }
        Ok(())
    }
}

impl TryFrom<Args> for Config {
    type Error = String;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let socket_mode = u32::from_str_radix(args.socket_mode.trim_start_matches("0o"), 8)
            .map_err(|_| format!("socket_mode {:?} is not octal", args.socket_mode))?;
        let hostname = match args.hostname {
            Some(name) => name,
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        };
        Ok(Self {
            socket_type: args.socket_type,
            socket_path: args.socket_path,
            socket_mode,
            listen_host: args.listen_host,
            listen_port: args.listen_port,
            listen_backlog: args.listen_backlog,
            reuse_socket: args.reuse_socket,
            max_conns: args.max_conns,
            read_timeout: args.read_timeout,
            grey_db: args.grey_db,
            awl_db: args.awl_db,
            grey_db_maintenance_disable: args.grey_db_maintenance_disable,
            awl_db_maintenance_disable: args.awl_db_maintenance_disable,
            wl_sources: args.wl_sources,
            allow_wl_regex: args.allow_wl_regex,
            hostname,
            delay: args.delay,
            retry_window: args.retry_window,
            max_age: args.max_age,
            maintenance_interval: args.maintenance_interval,
            ipv4_mask: args.ipv4_mask,
            ipv6_mask: args.ipv6_mask,
            grey_action: args.grey_action,
            grey_text: args.grey_text,
            grey_smtp_header: args.grey_smtp_header,
            hash_keys: args.hash_keys,
            awl_client_count: args.awl_client_count,
            pid_file: args.pid_file,
            metrics_addr: args.metrics_addr,
        })
    }
}

/// A complete, valid configuration for unit and integration tests.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        socket_type: SocketType::Inet,
        socket_path: PathBuf::from("/var/run/graylag/socket"),
        socket_mode: 0o660,
        listen_host: "localhost".to_owned(),
        listen_port: 10023,
        listen_backlog: 5,
        reuse_socket: true,
        max_conns: 256,
        read_timeout: 30,
        grey_db: "sled:///var/db/graylag/greylistdb".to_owned(),
        awl_db: "sled:///var/db/graylag/autowldb".to_owned(),
        grey_db_maintenance_disable: false,
        awl_db_maintenance_disable: false,
        wl_sources: vec!["file:///var/db/graylag/whitelist".to_owned()],
        allow_wl_regex: false,
        hostname: "mx.test".to_owned(),
        delay: 300,
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
