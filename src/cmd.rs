use std::path::PathBuf;

use clap::{ArgAction, Parser};

pub const DEFAULT_NPN_LIST: &str = "h2,h2-16,h2-14,http/1.1";

pub const DEFAULT_SOFARPC_CLASS_NAME: &str = "com.alipay.sofa.rpc.core.request.SofaRequest";
pub const DEFAULT_SOFARPC_HEADER: &str = "service:com.alipay.test.TestService:1.0";

/// Benchmarking tool for HTTP/2, HTTP/1.1 and SOFARPC (bolt) servers.
///
/// Multiple URIs can be specified. URIs are used in this order for each
/// client. The scheme, host and port in the subsequent URIs, if present,
/// are ignored; those in the first URI are used solely. A base URI
/// definition overrides all scheme, host or port values.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// URIs to access. Unix domain socket targets are given as `unix:PATH`.
    pub uris: Vec<String>,

    /// Number of requests across all clients.
    ///
    /// Ignored when timing-based benchmarking is enabled (see --duration).
    #[clap(short = 'n', long, default_value_t = 1)]
    pub requests: u64,

    /// Number of concurrent clients. With -r, the maximum number of
    /// connections to be made.
    #[clap(short = 'c', long, default_value_t = 1)]
    pub clients: u64,

    /// Number of native threads.
    #[clap(short = 't', long, default_value_t = 1)]
    pub threads: u64,

    /// Max concurrent streams to issue per session. When http/1.1 is used,
    /// this specifies the number of HTTP pipelining requests in-flight.
    #[clap(short = 'm', long, default_value_t = 1)]
    pub max_concurrent_streams: u32,

    /// Add/override a header to the requests, as `name: value`.
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// ALPN identifier of the protocol to be used when accessing a http URI
    /// without TLS. Available protocols: h2c, http/1.1 and sofarpc.
    #[clap(short = 'p', long, default_value = "h2c")]
    pub no_tls_proto: String,

    /// Post FILE to the server. The request method is changed to POST. For
    /// http/1.1 connections -d caps the pipelining depth at 1.
    #[clap(short = 'd', long, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Fixed rate at which connections are created, per rate period. The
    /// maximum number of connections is given by -c. Distributed among
    /// threads as evenly as possible. -r and -D are mutually exclusive.
    #[clap(short = 'r', long)]
    pub rate: Option<u64>,

    /// Time period between creating connections. Ignored unless -r is used.
    #[clap(long, default_value = "1s", value_name = "DURATION")]
    pub rate_period: String,

    /// Main duration, in seconds, for timing-based benchmarking.
    /// -D and -r are mutually exclusive.
    #[clap(short = 'D', long)]
    pub duration: Option<u64>,

    /// Time period spent warming connections up before the actual
    /// measurement starts. Needs to be provided along with -D.
    #[clap(long, value_name = "DURATION")]
    pub warm_up_time: Option<String>,

    /// Maximum time to keep a connection open, regardless of activity.
    #[clap(short = 'T', long, value_name = "DURATION")]
    pub connection_active_timeout: Option<String>,

    /// Maximum time to wait for activity on a given connection.
    #[clap(short = 'N', long, value_name = "DURATION")]
    pub connection_inactivity_timeout: Option<String>,

    /// Shorthand for --npn-list=http/1.1 --no-tls-proto=http/1.1, which
    /// effectively forces http/1.1 for both http and https URIs.
    #[clap(long)]
    pub h1: bool,

    /// Decoder header table size.
    #[clap(long, default_value = "4K", value_name = "SIZE")]
    pub header_table_size: String,

    /// Encoder header table size. The negotiated dynamic table size is the
    /// minimum of this value and the size the server advertises.
    #[clap(long, default_value = "4K", value_name = "SIZE")]
    pub encoder_header_table_size: String,

    /// Queries per second across all threads; requires -D.
    /// --qps and -r are mutually exclusive.
    #[clap(long)]
    pub qps: Option<u64>,

    /// Comma separated list of ALPN protocol identifiers in preference
    /// order, offered during the TLS handshake.
    #[clap(long, default_value = DEFAULT_NPN_LIST)]
    pub npn_list: String,

    /// Read URIs from a file, one per line. `-` reads from stdin.
    #[clap(long, value_name = "PATH")]
    pub input_file: Option<String>,

    /// Base URI overriding the scheme, host and port of all given URIs.
    #[clap(long)]
    pub base_uri: Option<String>,

    /// Request schedule file: one start offset per line, with unit.
    /// Requests are issued at the given offsets instead of back-to-back.
    #[clap(long, value_name = "PATH")]
    pub timing_script_file: Option<PathBuf>,

    /// SOFARPC request class name.
    #[clap(long, default_value = DEFAULT_SOFARPC_CLASS_NAME)]
    pub sofarpc_class_name: String,

    /// SOFARPC header map, comma separated `k=v` pairs.
    #[clap(long, default_value = DEFAULT_SOFARPC_HEADER)]
    pub sofarpc_header: String,

    /// SOFARPC request content. The built-in echo payload is used when
    /// this is not given.
    #[clap(long)]
    pub sofarpc_content: Option<String>,

    /// SOFARPC request timeout, in milliseconds.
    #[clap(long, default_value_t = 5000)]
    pub sofarpc_timeout: u32,

    /// Be verbose in terms of logging.
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}
