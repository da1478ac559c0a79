use std::path::PathBuf;

use anyhow::Context;
use sharecast_protocol::ShareConfig;

use crate::config::DEFAULT_CONFIG_PATH;

/// Command-line arguments. Every value except the config path and display
/// overrides the corresponding config file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Args {
    pub config_path: PathBuf,
    pub display: String,
    pub log_json: bool,
    pub server_url: Option<String>,
    pub tls_cert_path: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<u32>,
    pub bitrate: Option<u32>,
    pub encoder: Option<String>,
    pub enterprise_id: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            display: ":0".to_string(),
            log_json: false,
            server_url: None,
            tls_cert_path: None,
            width: None,
            height: None,
            framerate: None,
            bitrate: None,
            encoder: None,
            enterprise_id: None,
        }
    }
}

impl Args {
    pub fn apply(&self, config: &mut ShareConfig) {
        if let Some(url) = &self.server_url {
            config.signaling.url = url.clone();
        }
        if let Some(cert) = &self.tls_cert_path {
            config.signaling.tls_cert = Some(cert.clone());
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(framerate) = self.framerate {
            config.capture.framerate = framerate;
        }
        if let Some(bitrate) = self.bitrate {
            config.capture.bitrate = bitrate;
        }
        if let Some(encoder) = &self.encoder {
            config.capture.encoder = Some(encoder.clone());
        }
        if let Some(enterprise_id) = &self.enterprise_id {
            config.device.enterprise_id = Some(enterprise_id.clone());
        }
    }
}

fn print_help() {
    println!("sharecast-agent - device screen-sharing agent");
    println!();
    println!("USAGE:");
    println!("    sharecast-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              Config file [default: {DEFAULT_CONFIG_PATH}]");
    println!("    --display <DISPLAY>          X11 display to share [default: :0]");
    println!("    --server-url <URL>           Signaling server WebSocket URL");
    println!("    --tls-cert <PATH>            TLS certificate to pin for wss:// connections");
    println!("    --width <PIXELS>             Capture width [default: 480]");
    println!("    --height <PIXELS>            Capture height [default: 960]");
    println!("    --framerate <FPS>            Target framerate [default: 15]");
    println!("    --bitrate <KBPS>             Video bitrate [default: 1500]");
    println!("    --encoder <NAME>             Force encoder (nvh264enc, vah264enc, x264enc)");
    println!("    --enterprise-id <ID>         Append a management id to the device id");
    println!("    --log-json                   Emit logs as JSON");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_from(&args)
}

fn parse_from(args: &[String]) -> anyhow::Result<Args> {
    let mut parsed = Args::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("sharecast-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                parsed.config_path = args.get(i).context("Missing --config value")?.into();
            }
            "--display" => {
                i += 1;
                parsed.display = args.get(i).context("Missing --display value")?.clone();
            }
            "--log-json" => parsed.log_json = true,
            "--server-url" => {
                i += 1;
                parsed.server_url = Some(args.get(i).context("Missing --server-url value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                parsed.tls_cert_path = Some(args.get(i).context("Missing --tls-cert value")?.clone());
            }
            "--width" => {
                i += 1;
                parsed.width = Some(
                    args.get(i)
                        .context("Missing --width value")?
                        .parse()
                        .context("Invalid --width value")?,
                );
            }
            "--height" => {
                i += 1;
                parsed.height = Some(
                    args.get(i)
                        .context("Missing --height value")?
                        .parse()
                        .context("Invalid --height value")?,
                );
            }
            "--framerate" => {
                i += 1;
                parsed.framerate = Some(
                    args.get(i)
                        .context("Missing --framerate value")?
                        .parse()
                        .context("Invalid --framerate value")?,
                );
            }
            "--bitrate" => {
                i += 1;
                parsed.bitrate = Some(
                    args.get(i)
                        .context("Missing --bitrate value")?
                        .parse()
                        .context("Invalid --bitrate value")?,
                );
            }
            "--encoder" => {
                i += 1;
                parsed.encoder = Some(args.get(i).context("Missing --encoder value")?.clone());
            }
            "--enterprise-id" => {
                i += 1;
                parsed.enterprise_id =
                    Some(args.get(i).context("Missing --enterprise-id value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_without_arguments() {
        assert_eq!(parse_from(&[]).unwrap(), Args::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let parsed = parse_from(&args(&[
            "--config",
            "/tmp/a.toml",
            "--display",
            ":1",
            "--server-url",
            "wss://signal.example.com/ws",
            "--framerate",
            "30",
            "--enterprise-id",
            "fleet-9",
            "--log-json",
        ]))
        .unwrap();
        assert_eq!(parsed.config_path, PathBuf::from("/tmp/a.toml"));
        assert_eq!(parsed.display, ":1");
        assert_eq!(parsed.framerate, Some(30));
        assert_eq!(parsed.enterprise_id.as_deref(), Some("fleet-9"));
        assert!(parsed.log_json);
    }

    #[test]
    fn missing_and_bad_values_are_errors() {
        assert!(parse_from(&args(&["--width"])).is_err());
        assert!(parse_from(&args(&["--bitrate", "fast"])).is_err());
        assert!(parse_from(&args(&["--frobnicate"])).is_err());
    }

    #[test]
    fn apply_overrides_only_given_values() {
        let parsed = parse_from(&args(&["--width", "720", "--encoder", "x264enc"])).unwrap();
        let mut config = ShareConfig::default();
        parsed.apply(&mut config);
        assert_eq!(config.capture.width, 720);
        assert_eq!(config.capture.height, 960);
        assert_eq!(config.capture.encoder.as_deref(), Some("x264enc"));
        assert_eq!(config.signaling.url, ShareConfig::default().signaling.url);
    }
}
