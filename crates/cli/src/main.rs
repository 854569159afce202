use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "carlink")]
#[command(about = "carlink: WebSocket relay for a line-protocol device", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the relay (HTTP + WebSocket on one port). Sessions pick the device with `?ip=..&port=..`.
    Serve {
        /// Config file path (default: CARLINK_CONFIG_PATH or ~/.carlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from CARLINK_PORT, config, or 8081)
        #[arg(long, short)]
        port: Option<u16>,

        /// Bind address (default from config or 127.0.0.1)
        #[arg(long, short)]
        bind: Option<String>,
    },

    /// Print the status of a running relay (uptime, device connectivity, live sessions).
    Status {
        /// Config file path (default: CARLINK_CONFIG_PATH or ~/.carlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Relay base URL (default: http://<relay.bind>:<port> from config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Open a session to the relay and measure heartbeat round-trip latency.
    Probe {
        /// Config file path (default: CARLINK_CONFIG_PATH or ~/.carlink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Relay base URL, http(s) or ws(s) (default: http://<relay.bind>:<port> from config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Device IP or host name the session should target
        #[arg(long)]
        ip: String,

        /// Device TCP port
        #[arg(long, value_name = "PORT")]
        device_port: u16,

        /// Number of pings to send
        #[arg(long, short = 'n', default_value_t = 5)]
        count: u32,

        /// Delay between pings in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("carlink {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port, bind }) => {
            if let Err(e) = run_serve(config, port, bind).await {
                log::error!("relay failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config, url }) => {
            if let Err(e) = run_status(config, url).await {
                log::error!("status failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Probe {
            config,
            url,
            ip,
            device_port,
            count,
            interval_ms,
        }) => {
            if let Err(e) = run_probe(config, url, ip, device_port, count, interval_ms).await {
                log::error!("probe failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    config.relay.port = port.unwrap_or_else(|| lib::config::resolve_relay_port(&config));
    if let Some(b) = bind {
        config.relay.bind = b;
    }
    log::info!("starting relay on {}:{}", config.relay.bind, config.relay.port);
    lib::gateway::run_relay(config).await
}

/// Base HTTP URL of the relay described by the config.
fn relay_base_url(config: &lib::config::Config) -> String {
    let bind = config.relay.bind.trim();
    let host = if bind == "0.0.0.0" || bind == "::" {
        "127.0.0.1"
    } else {
        bind
    };
    format!("http://{}:{}", host, lib::config::resolve_relay_port(config))
}

async fn run_status(
    config_path: Option<std::path::PathBuf>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let base = url.unwrap_or_else(|| relay_base_url(&config));
    let status_url = format!("{}/status", base.trim_end_matches('/'));
    let res = reqwest::get(&status_url).await?;
    if !res.status().is_success() {
        anyhow::bail!("GET {} returned {}", status_url, res.status());
    }
    let status: serde_json::Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// WebSocket session URL on the relay at `base` for the given device. Query values are encoded.
fn session_url(base: &str, ip: &str, device_port: u16) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("unsupported relay URL scheme: {}", other),
    };
    if url.set_scheme(scheme).is_err() {
        anyhow::bail!("cannot open a session at {}", base);
    }
    url.set_path("/");
    url.query_pairs_mut()
        .clear()
        .append_pair("ip", ip)
        .append_pair("port", &device_port.to_string());
    Ok(url)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn run_probe(
    config_path: Option<std::path::PathBuf>,
    url: Option<String>,
    ip: String,
    device_port: u16,
    count: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let base = url.unwrap_or_else(|| relay_base_url(&config));
    let ws_url = session_url(&base, &ip, device_port)?;

    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
    log::info!("session open at {}", ws_url);

    let mut samples: Vec<u64> = Vec::new();
    for seq in 0..count {
        let sent = now_ms();
        let ping = serde_json::json!({ "type": "ping", "timestamp": sent });
        ws.send(Message::Text(ping.to_string())).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let frame = match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(frame)) => frame?,
                Ok(None) => anyhow::bail!("relay closed the session"),
                Err(_) => {
                    println!("ping {}: no pong within 5s", seq + 1);
                    break;
                }
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    anyhow::bail!("relay closed the session: {}", reason);
                }
                _ => continue,
            };
            let msg: serde_json::Value = serde_json::from_str(&text)?;
            match msg.get("type").and_then(|v| v.as_str()) {
                Some("pong") if msg.get("timestamp").and_then(|v| v.as_u64()) == Some(sent) => {
                    let rtt = now_ms().saturating_sub(sent);
                    println!("ping {}: {} ms", seq + 1, rtt);
                    samples.push(rtt);
                    break;
                }
                Some("status") => {
                    let connected = msg.get("connected").and_then(|v| v.as_bool()).unwrap_or(false);
                    match msg.get("error").and_then(|v| v.as_str()) {
                        Some(err) => println!("device connected: {} ({})", connected, err),
                        None => println!("device connected: {}", connected),
                    }
                }
                _ => {}
            }
        }

        if seq + 1 < count {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    let _ = ws.close(None).await;
    if !samples.is_empty() {
        let min = samples.iter().min().copied().unwrap_or(0);
        let max = samples.iter().max().copied().unwrap_or(0);
        let avg = samples.iter().sum::<u64>() / samples.len() as u64;
        println!(
            "{} of {} pongs received; min/avg/max = {}/{}/{} ms",
            samples.len(),
            count,
            min,
            avg,
            max
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_switches_to_websocket_scheme() {
        let url = session_url("http://127.0.0.1:8081", "10.0.0.5", 5006).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8081/?ip=10.0.0.5&port=5006");

        let url = session_url("https://relay.example/dashboard/", "10.0.0.5", 5006).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example/?ip=10.0.0.5&port=5006");
    }

    #[test]
    fn session_url_encodes_the_device_host() {
        let url = session_url("ws://127.0.0.1:8081", "car one&port=1", 5006).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8081/?ip=car+one%26port%3D1&port=5006"
        );
    }

    #[test]
    fn session_url_rejects_other_schemes() {
        assert!(session_url("ftp://relay.example", "10.0.0.5", 5006).is_err());
        assert!(session_url("not a url", "10.0.0.5", 5006).is_err());
    }
}
