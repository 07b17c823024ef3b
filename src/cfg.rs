//! Immutable run configuration, built once from the parsed command line.

use core::{error::Error, fmt, time::Duration};
use std::{
    fs,
    io::{self, BufRead},
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use url::Url;

use crate::{bolt, cmd::Cmd, pacing::PacingMode};

pub const H2_ALPN_FAMILY: [&str; 3] = ["h2", "h2-16", "h2-14"];
pub const H1_ALPN: &str = "http/1.1";
pub const SOFARPC_ALPN: &str = "sofarpc";
pub const H2_CLEARTEXT: &str = "h2c";

const UNIX_PATH_PREFIX: &str = "unix:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => fmt.write_str("http"),
            Scheme::Https => fmt.write_str("https"),
        }
    }
}

/// A resolved connect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Application protocol used when the scheme carries no TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoTlsProto {
    Http2,
    Http1,
    SofaRpc,
}

/// One request header. Pseudo-headers keep their `:` prefix.
pub type Header = (String, String);

#[derive(Debug)]
pub struct Config {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub default_port: u16,
    pub addrs: Vec<Address>,
    /// ALPN preference list, also the fallback list when the server
    /// negotiates nothing.
    pub npn_list: Vec<String>,
    pub no_tls_proto: NoTlsProto,
    /// Total number of requests; [`u64::MAX`] in plain duration mode,
    /// `qps * duration` in QPS mode.
    pub nreqs: u64,
    pub nclients: u64,
    pub nthreads: u64,
    pub max_concurrent_streams: u32,
    pub rate: u64,
    pub rate_period: Duration,
    pub duration: Duration,
    pub warm_up_time: Duration,
    pub conn_active_timeout: Option<Duration>,
    pub conn_inactivity_timeout: Option<Duration>,
    pub qps: u64,
    pub header_table_size: u32,
    pub encoder_header_table_size: u32,
    /// POST body; switches the request method to POST.
    pub data: Option<Bytes>,
    pub verbose: bool,
    /// Absolute per-request start offsets from the timing script.
    pub timings: Vec<Duration>,
    /// Prebuilt HTTP/1.1 request heads, one per request line.
    pub h1reqs: Vec<Bytes>,
    /// HTTP/2 header lists, one per request line.
    pub h2_templates: Vec<Arc<Vec<Header>>>,
    /// Prebuilt SOFARPC request frames with a zero request id.
    pub bolt_reqs: Vec<Bytes>,
}

impl Config {
    pub fn is_qps_mode(&self) -> bool {
        self.qps != 0
    }

    pub fn is_rate_mode(&self) -> bool {
        self.rate != 0
    }

    pub fn is_timing_based_mode(&self) -> bool {
        !self.duration.is_zero()
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub fn pacing(&self) -> PacingMode {
        if self.is_qps_mode() {
            PacingMode::Qps { qps: self.qps, duration: self.duration }
        } else if self.is_rate_mode() {
            PacingMode::Rate { rate: self.rate, period: self.rate_period }
        } else {
            PacingMode::Count { nreqs: self.nreqs }
        }
    }

    /// Authority for the request templates: host, plus the port when it
    /// differs from the scheme default.
    pub fn authority(&self) -> String {
        if self.port != self.default_port {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }
}

/// Parses `10`, `500ms`, `1s`, `2m`, `1h` into a duration; a bare number
/// means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, Box<dyn Error>> {
    let s = s.trim();
    let (num, mul_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000.0)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1000.0)
    } else {
        (s, 1000.0)
    };

    let v: f64 = num.trim().parse().map_err(|_| format!("bad duration: {s}"))?;
    if !v.is_finite() || v < 0.0 {
        return Err(format!("bad duration: {s}").into());
    }

    Ok(Duration::from_secs_f64(v * mul_ms / 1000.0))
}

/// Parses `4096`, `4K`, `1M`, `1G` (powers of 1024) into a u32.
pub fn parse_size(s: &str) -> Result<u32, Box<dyn Error>> {
    let s = s.trim();
    let (num, mul) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1u64 << 10),
        Some('M') => (&s[..s.len() - 1], 1u64 << 20),
        Some('G') => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    let v: u64 = num.trim().parse().map_err(|_| format!("bad size: {s}"))?;
    let v = v.checked_mul(mul).ok_or_else(|| format!("size too large: {s}"))?;

    u32::try_from(v).map_err(|_| format!("size too large: {s}").into())
}

/// Splits a `-H name: value` argument, tolerating a leading `:` in
/// pseudo-header names. The name is lowercased.
fn parse_custom_header(raw: &str) -> Result<Header, Box<dyn Error>> {
    if raw.len() < 2 {
        return Err(format!("-H: invalid header: {raw}").into());
    }
    let sep = raw[1..].find(':').map(|i| i + 1);
    let Some(sep) = sep else {
        return Err(format!("-H: invalid header: {raw}").into());
    };
    let name = &raw[..sep];
    let value = raw[sep + 1..].trim_start();
    if name.is_empty() || name == ":" || value.is_empty() {
        return Err(format!("-H: invalid header: {raw}").into());
    }

    Ok((name.to_ascii_lowercase(), value.to_string()))
}

/// Merges custom headers into the shared set. `:host` overrides
/// `:authority`; the other overridable names override by exact match;
/// everything else appends.
fn merge_headers(shared: &mut Vec<Header>, custom: Vec<Header>) {
    const OVERRIDABLE: [&str; 5] = [":authority", ":host", ":method", ":scheme", "user-agent"];

    for (name, value) in custom {
        if OVERRIDABLE.contains(&name.as_str()) {
            for nv in shared.iter_mut() {
                if (nv.0 == ":authority" && name == ":host") || nv.0 == name {
                    nv.1 = value.clone();
                }
            }
        } else {
            shared.push((name, value));
        }
    }
}

struct BaseUri {
    scheme: Scheme,
    host: String,
    port: u16,
    default_port: u16,
    unix_path: Option<PathBuf>,
}

fn parse_base_uri(uri: &str) -> Result<BaseUri, Box<dyn Error>> {
    if let Some(path) = uri.strip_prefix(UNIX_PATH_PREFIX) {
        let scheme = Scheme::Http;
        return Ok(BaseUri {
            scheme,
            host: "localhost".to_string(),
            port: scheme.default_port(),
            default_port: scheme.default_port(),
            unix_path: Some(PathBuf::from(path)),
        });
    }

    let u = Url::parse(uri).map_err(|_| format!("invalid URI: {uri}"))?;
    let scheme = match u.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => return Err(format!("unsupported scheme: {other}").into()),
    };
    let host = u.host_str().ok_or_else(|| format!("invalid URI: {uri}"))?.to_string();
    let default_port = scheme.default_port();
    let port = u.port().unwrap_or(default_port);

    Ok(BaseUri {
        scheme,
        host,
        port,
        default_port,
        unix_path: None,
    })
}

/// Extracts `path?query` from one URI argument. Plain paths pass through;
/// `unix:` targets request `/`.
fn reqline_of(uri: &str) -> Result<String, Box<dyn Error>> {
    if uri.starts_with(UNIX_PATH_PREFIX) {
        return Ok("/".to_string());
    }
    if uri.starts_with('/') {
        return Ok(uri.to_string());
    }

    let u = Url::parse(uri).map_err(|_| format!("invalid URI: {uri}"))?;
    let mut reqline = u.path().to_string();
    if reqline.is_empty() {
        reqline.push('/');
    }
    if let Some(q) = u.query() {
        reqline.push('?');
        reqline.push_str(q);
    }

    Ok(reqline)
}

fn read_uris_from(reader: impl BufRead) -> Result<Vec<String>, Box<dyn Error>> {
    let mut uris = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            uris.push(line.trim().to_string());
        }
    }

    Ok(uris)
}

fn resolve_host(host: &str, port: u16) -> Result<Vec<Address>, Box<dyn Error>> {
    let addrs: Vec<Address> = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve {host}: {e}"))?
        .map(Address::Tcp)
        .collect();
    if addrs.is_empty() {
        return Err("no address returned".into());
    }

    Ok(addrs)
}

fn load_timing_script(path: &PathBuf) -> Result<Vec<Duration>, Box<dyn Error>> {
    let data = fs::read_to_string(path).map_err(|e| format!("cannot read timing script: {e}"))?;
    let mut timings = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        timings.push(parse_duration(line)?);
    }
    if timings.is_empty() {
        return Err("timing script is empty".into());
    }

    Ok(timings)
}

impl TryFrom<Cmd> for Config {
    type Error = Box<dyn Error>;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        let rate_period = parse_duration(&cmd.rate_period)?;
        let warm_up_time = cmd.warm_up_time.as_deref().map(parse_duration).transpose()?.unwrap_or_default();
        let conn_active_timeout = cmd
            .connection_active_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .filter(|d| !d.is_zero());
        let conn_inactivity_timeout = cmd
            .connection_inactivity_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .filter(|d| !d.is_zero());
        let header_table_size = parse_size(&cmd.header_table_size)?;
        let encoder_header_table_size = parse_size(&cmd.encoder_header_table_size)?;

        let duration = Duration::from_secs(cmd.duration.unwrap_or(0));
        if cmd.duration == Some(0) {
            return Err("-D: the main duration for timing-based benchmarking must be positive".into());
        }
        let rate = cmd.rate.unwrap_or(0);
        if cmd.rate == Some(0) {
            return Err("-r: the rate at which connections are made must be positive".into());
        }
        let qps = cmd.qps.unwrap_or(0);
        if cmd.qps == Some(0) {
            return Err("--qps: the query rate must be positive".into());
        }

        let is_timing = !duration.is_zero();
        if qps != 0 && rate != 0 {
            return Err("-r, --qps: they are mutually exclusive".into());
        }
        if qps != 0 && !is_timing {
            return Err("duration (-D) must be positive in --qps mode".into());
        }
        if is_timing && rate != 0 {
            return Err("-r, -D: they are mutually exclusive".into());
        }
        if cmd.clients == 0 {
            return Err("-c: the number of clients must be strictly greater than 0".into());
        }
        if cmd.requests == 0 && !is_timing {
            return Err(
                "-n: the number of requests must be strictly greater than 0 \
                 if a timing-based test is not being run"
                    .into(),
            );
        }
        if cmd.max_concurrent_streams == 0 {
            return Err("-m: the max concurrent streams must be strictly greater than 0".into());
        }
        if cmd.threads == 0 {
            return Err("-t: the number of threads must be strictly greater than 0".into());
        }
        if let Ok(cores) = std::thread::available_parallelism() {
            if cmd.threads > cores.get() as u64 {
                log::warn!("-t: the number of threads is greater than hardware cores");
            }
        }
        if cmd.clients < cmd.threads && qps == 0 {
            return Err(
                "-c, -t: the number of clients must be greater than or equal \
                 to the number of threads"
                    .into(),
            );
        }
        if rate != 0 {
            if rate_period.is_zero() {
                return Err("--rate-period: the period must be positive".into());
            }
            if rate < cmd.threads {
                return Err(
                    "-r, -t: the connection rate must be greater than or equal \
                     to the number of threads"
                        .into(),
                );
            }
            if rate > cmd.clients {
                return Err(
                    "-r, -c: the connection rate must be smaller than or equal \
                     to the number of clients"
                        .into(),
                );
            }
        }

        // Protocol selection without TLS, and the ALPN offer.
        let (mut npn_list, mut no_tls_proto) = (cmd.npn_list.clone(), None);
        if cmd.h1 {
            npn_list = H1_ALPN.to_string();
            no_tls_proto = Some(NoTlsProto::Http1);
        }
        let npn_list: Vec<String> = npn_list
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let no_tls_proto = match no_tls_proto {
            Some(p) => p,
            None => {
                let p = cmd.no_tls_proto.to_ascii_lowercase();
                if p == H2_CLEARTEXT {
                    NoTlsProto::Http2
                } else if p == H1_ALPN {
                    NoTlsProto::Http1
                } else if p == SOFARPC_ALPN || p == "bolt" {
                    NoTlsProto::SofaRpc
                } else {
                    return Err(format!("-p: unsupported protocol {p}").into());
                }
            }
        };

        // URI list.
        let uris = match cmd.input_file.as_deref() {
            None => cmd.uris.clone(),
            Some("-") => read_uris_from(io::stdin().lock())?,
            Some(path) => {
                let file = fs::File::open(path).map_err(|e| format!("cannot read input file: {e}"))?;
                read_uris_from(io::BufReader::new(file))?
            }
        };
        if uris.is_empty() && cmd.base_uri.is_none() {
            return Err("no URI or input file given".into());
        }

        let base = match &cmd.base_uri {
            Some(b) => parse_base_uri(b)?,
            None => parse_base_uri(&uris[0])?,
        };
        let mut reqlines = Vec::with_capacity(uris.len().max(1));
        for uri in &uris {
            reqlines.push(reqline_of(uri)?);
        }
        if reqlines.is_empty() {
            reqlines.push("/".to_string());
        }

        if base.host == "nghttp2.org" {
            return Err("using this tool against a public server should be prohibited".into());
        }

        let data = match &cmd.data {
            Some(path) => {
                let body = fs::read(path).map_err(|e| format!("-d: could not open file: {e}"))?;
                Some(Bytes::from(body))
            }
            None => None,
        };

        let timings = match &cmd.timing_script_file {
            Some(path) => load_timing_script(path)?,
            None => Vec::new(),
        };

        // Shared header set and the -H merge.
        let method = if data.is_some() { "POST" } else { "GET" };
        let authority = if base.port != base.default_port {
            format!("{}:{}", base.host, base.port)
        } else {
            base.host.clone()
        };
        let mut shared: Vec<Header> = vec![
            (":scheme".to_string(), base.scheme.to_string()),
            (":authority".to_string(), authority),
            (":method".to_string(), method.to_string()),
            ("user-agent".to_string(), concat!("volley/", env!("CARGO_PKG_VERSION")).to_string()),
        ];
        let custom = cmd
            .headers
            .iter()
            .map(|h| parse_custom_header(h))
            .collect::<Result<Vec<_>, _>>()?;
        merge_headers(&mut shared, custom);

        let content_length = data.as_ref().map(|d| d.len().to_string());

        let mut h1reqs = Vec::with_capacity(reqlines.len());
        let mut h2_templates = Vec::with_capacity(reqlines.len());
        let mut bolt_reqs = Vec::with_capacity(reqlines.len());

        let method = shared
            .iter()
            .find(|nv| nv.0 == ":method")
            .map(|nv| nv.1.clone())
            .unwrap_or_else(|| "GET".to_string());

        let bolt_header = bolt::encode_header_map(&cmd.sofarpc_header);
        let bolt_content: Vec<u8> = match &cmd.sofarpc_content {
            Some(c) => c.clone().into_bytes(),
            None => bolt::DEFAULT_CONTENT.to_vec(),
        };

        for req in &reqlines {
            // HTTP/1.1 head.
            let mut h1req = format!("{method} {req} HTTP/1.1\r\n");
            for (name, value) in &shared {
                if name == ":authority" {
                    h1req.push_str("Host: ");
                    h1req.push_str(value);
                    h1req.push_str("\r\n");
                    continue;
                }
                if name.starts_with(':') {
                    continue;
                }
                h1req.push_str(name);
                h1req.push_str(": ");
                h1req.push_str(value);
                h1req.push_str("\r\n");
            }
            if let Some(cl) = &content_length {
                h1req.push_str("Content-Length: ");
                h1req.push_str(cl);
                h1req.push_str("\r\n");
            }
            h1req.push_str("\r\n");
            h1reqs.push(Bytes::from(h1req));

            // HTTP/2 header list.
            let mut nva: Vec<Header> = Vec::with_capacity(2 + shared.len());
            nva.push((":path".to_string(), req.clone()));
            nva.extend(shared.iter().cloned());
            if let Some(cl) = &content_length {
                nva.push(("content-length".to_string(), cl.clone()));
            }
            h2_templates.push(Arc::new(nva));

            // SOFARPC frame.
            let frame = bolt::encode_request(
                &cmd.sofarpc_class_name,
                &bolt_header,
                &bolt_content,
                cmd.sofarpc_timeout,
            );
            bolt_reqs.push(frame.freeze());
        }

        let addrs = match base.unix_path {
            Some(path) => vec![Address::Unix(path)],
            None => resolve_host(&base.host, base.port)?,
        };

        // In timing-based modes the request count is derived, not given.
        let nreqs = if is_timing {
            if qps != 0 {
                qps.saturating_mul(duration.as_secs())
            } else {
                u64::MAX
            }
        } else {
            cmd.requests
        };

        let m = Self {
            scheme: base.scheme,
            host: base.host,
            port: base.port,
            default_port: base.default_port,
            addrs,
            npn_list,
            no_tls_proto,
            nreqs,
            nclients: cmd.clients,
            nthreads: cmd.threads,
            max_concurrent_streams: cmd.max_concurrent_streams,
            rate,
            rate_period,
            duration,
            warm_up_time,
            conn_active_timeout,
            conn_inactivity_timeout,
            qps,
            header_table_size,
            encoder_header_table_size,
            data,
            verbose: cmd.verbose > 0,
            timings,
            h1reqs,
            h2_templates,
            bolt_reqs,
        };

        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn cfg(args: &[&str]) -> Result<Config, Box<dyn Error>> {
        let mut argv = vec!["volley"];
        argv.extend_from_slice(args);
        Config::try_from(Cmd::try_parse_from(argv).unwrap())
    }

    #[test]
    fn durations_and_sizes_parse_with_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("abc").is_err());

        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn mutually_exclusive_modes_are_rejected() {
        assert!(cfg(&["-r", "2", "-D", "5", "-c", "4", "http://localhost/"]).is_err());
        assert!(cfg(&["-r", "2", "--qps", "10", "-c", "4", "http://localhost/"]).is_err());
        assert!(cfg(&["--qps", "10", "http://localhost/"]).is_err());
        assert!(cfg(&["--qps", "0", "-D", "5", "http://localhost/"]).is_err());
        assert!(cfg(&["-r", "0", "http://localhost/"]).is_err());
        assert!(cfg(&["-n", "0", "http://localhost/"]).is_err());
    }

    #[test]
    fn clients_must_cover_threads_outside_qps_mode() {
        assert!(cfg(&["-c", "2", "-t", "4", "http://localhost/"]).is_err());
        // QPS mode lifts the restriction.
        let c = cfg(&["-c", "2", "-t", "4", "-D", "1", "--qps", "8", "http://localhost/"]).unwrap();
        assert_eq!(c.nreqs, 8);
    }

    #[test]
    fn rate_must_sit_between_threads_and_clients() {
        assert!(cfg(&["-r", "1", "-t", "2", "-c", "4", "http://localhost/"]).is_err());
        assert!(cfg(&["-r", "8", "-t", "2", "-c", "4", "http://localhost/"]).is_err());
        let c = cfg(&["-r", "2", "-t", "2", "-c", "4", "http://localhost/"]).unwrap();
        assert!(c.is_rate_mode());
    }

    #[test]
    fn first_uri_pins_scheme_host_port() {
        let c = cfg(&["http://localhost:8080/a", "http://ignored:9999/b?x=1", "/c"]).unwrap();
        assert_eq!(c.host, "localhost");
        assert_eq!(c.port, 8080);
        assert_eq!(c.h1reqs.len(), 3);
        let first = core::str::from_utf8(&c.h1reqs[0]).unwrap();
        assert!(first.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(first.contains("Host: localhost:8080\r\n"));
        let second = core::str::from_utf8(&c.h1reqs[1]).unwrap();
        assert!(second.starts_with("GET /b?x=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn default_port_is_left_out_of_authority() {
        let c = cfg(&["http://localhost/"]).unwrap();
        assert_eq!(c.port, 80);
        assert_eq!(c.authority(), "localhost");
    }

    #[test]
    fn host_header_override_replaces_authority() {
        let c = cfg(&["-H", ":host: example.org", "-H", "x-probe: 1", "http://localhost/"]).unwrap();
        let tpl = &c.h2_templates[0];
        let authority = tpl.iter().find(|nv| nv.0 == ":authority").unwrap();
        assert_eq!(authority.1, "example.org");
        assert!(tpl.iter().any(|nv| nv.0 == "x-probe" && nv.1 == "1"));

        let h1 = core::str::from_utf8(&c.h1reqs[0]).unwrap();
        assert!(h1.contains("Host: example.org\r\n"));
        assert!(h1.contains("x-probe: 1\r\n"));
    }

    #[test]
    fn user_agent_can_be_overridden_not_duplicated() {
        let c = cfg(&["-H", "user-agent: probe/1", "http://localhost/"]).unwrap();
        let h1 = core::str::from_utf8(&c.h1reqs[0]).unwrap();
        assert!(h1.contains("user-agent: probe/1\r\n"));
        assert_eq!(h1.matches("user-agent").count(), 1);
    }

    #[test]
    fn unix_target_resolves_to_socket_path() {
        let c = cfg(&["unix:/tmp/volley.sock"]).unwrap();
        assert_eq!(c.addrs, vec![Address::Unix(PathBuf::from("/tmp/volley.sock"))]);
        assert_eq!(c.host, "localhost");
    }

    #[test]
    fn h1_flag_forces_http1_everywhere() {
        let c = cfg(&["--h1", "https://localhost/"]).unwrap();
        assert_eq!(c.npn_list, vec![H1_ALPN.to_string()]);
        assert_eq!(c.no_tls_proto, NoTlsProto::Http1);
    }

    #[test]
    fn sofarpc_proto_token_selects_bolt() {
        let c = cfg(&["-p", "sofarpc", "http://localhost/svc"]).unwrap();
        assert_eq!(c.no_tls_proto, NoTlsProto::SofaRpc);
        // 22 byte head plus 1358 payload bytes for the default template.
        assert_eq!(c.bolt_reqs[0].len(), 1380);
    }

    #[test]
    fn qps_mode_derives_request_total() {
        let c = cfg(&["-D", "5", "--qps", "200", "-t", "4", "http://localhost/"]).unwrap();
        assert_eq!(c.nreqs, 1000);
        let PacingMode::Qps { qps, .. } = c.pacing() else {
            panic!("expected qps pacing");
        };
        assert_eq!(qps, 200);
    }
}
